//! rtperm-demo: runtime permission flows against a simulated OS
//!
//! ```text
//! rtperm-demo walkthrough --group location
//! rtperm-demo status
//! rtperm-demo asked
//! rtperm-demo reset
//! ```

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rtperm::{
    FileAuditSink, FilePermissionStore, GroupStatus, MockSystemPermissions, NullAuditSink,
    PermissionGroup, PermissionsManager, PermissionsManagerBuilder, PermissionsResult,
};

use crate::logging::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "rtperm-demo", version, about = "Runtime permission flows against a simulated OS")]
struct Cli {
    /// Application name used for the default store location
    #[arg(long, env = "RTPERM_APP_NAME", default_value = "rtperm-demo", global = true)]
    app_name: String,

    /// Asked-permission store (defaults to the config directory)
    #[arg(long, env = "RTPERM_STORE", global = true)]
    store: Option<PathBuf>,

    /// Append audit events to this JSONL file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// Overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<tracing::Level>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run never-asked, denied, blocked and granted in order for one group
    Walkthrough {
        #[arg(long, default_value = "camera")]
        group: PermissionGroup,
    },
    /// Show the state of every group on a fresh simulated OS
    Status,
    /// List persisted "has asked" flags
    Asked,
    /// Forget every asked flag
    Reset,
}

struct Demo {
    manager: PermissionsManager,
    system: Arc<MockSystemPermissions>,
    json: bool,
}

impl Demo {
    fn new(cli: &Cli) -> Result<Self> {
        let store = match &cli.store {
            Some(path) => FilePermissionStore::new(path),
            None => FilePermissionStore::default_for_app(&cli.app_name),
        }
        .context("failed to open asked-permission store")?;
        tracing::debug!(path = %store.path().display(), "Using asked-permission store");

        let system = Arc::new(MockSystemPermissions::new());
        let builder = PermissionsManagerBuilder::new()
            .app_name(&cli.app_name)
            .store(store)
            .platform(system.clone())
            .strict_assertions(true);

        let builder = match &cli.audit_log {
            Some(path) => builder.audit(
                FileAuditSink::new(path)
                    .with_context(|| format!("failed to open audit log {}", path.display()))?,
            ),
            None => builder.audit(NullAuditSink::new()),
        };

        Ok(Self {
            manager: builder.build()?,
            system,
            json: cli.json,
        })
    }

    /// Let the simulated user answer and hand the result to the manager
    fn answer_dialog(&self) -> Result<()> {
        let outcome = self
            .system
            .complete_dialog()
            .context("no permission dialog on screen")?;
        self.manager
            .on_request_permissions_result(&outcome.permissions, &outcome.grant_results)?;
        Ok(())
    }

    async fn request(&self, group: PermissionGroup) -> Result<PermissionsResult> {
        let pending = self.manager.request(group)?;
        if !pending.is_immediate() {
            self.answer_dialog()?;
        }
        Ok(pending.await?)
    }

    fn print_status(&self, label: &str, status: GroupStatus) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(&status)?);
        } else {
            println!(
                "{label:<24} {:<12} granted={:<5} asked={:<5} never_ask_again={}",
                status.group, status.granted, status.has_asked, status.never_ask_again
            );
        }
        Ok(())
    }

    fn print_result(&self, label: &str, result: PermissionsResult) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            println!(
                "{label:<24} granted={} asked_just_now={}",
                result.granted, result.was_asked_just_now
            );
        }
        Ok(())
    }

    async fn walkthrough(&self, group: PermissionGroup) -> Result<()> {
        self.manager.reset()?;
        self.print_status("never requested", self.manager.status(group))?;

        let denied = self.request(group).await?;
        self.print_result("request (user denies)", denied)?;
        self.print_status("after denial", self.manager.status(group))?;

        self.system.set_never_ask_again(group, true);
        self.print_status("blocked in OS", self.manager.status(group))?;
        if self.manager.never_ask_again(group) {
            self.manager.open_app_settings();
        }

        // The user re-enables the dialog from settings and accepts this time
        self.system.set_never_ask_again(group, false);
        self.system.allow(group, true);
        let granted = self.request(group).await?;
        self.print_result("request (user allows)", granted)?;
        self.print_status("after grant", self.manager.status(group))?;

        let again = self.request(group).await?;
        self.print_result("request again", again)?;
        Ok(())
    }

    fn status(&self) -> Result<()> {
        for group in PermissionGroup::ALL {
            self.print_status(group.name(), self.manager.status(group))?;
        }
        Ok(())
    }

    fn asked(&self) -> Result<()> {
        let entries = self.manager.asked_entries();
        if self.json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else if entries.is_empty() {
            println!("No permission groups have been requested");
        } else {
            for (key, asked) in entries {
                println!("{key:<32} {asked}");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.log_level);

    let demo = Demo::new(&cli)?;
    match cli.command {
        Command::Walkthrough { group } => demo.walkthrough(group).await?,
        Command::Status => demo.status()?,
        Command::Asked => demo.asked()?,
        Command::Reset => {
            demo.manager.reset()?;
            println!("Cleared asked-permission registry");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn demo_with_store(dir: &tempfile::TempDir) -> Demo {
        let store = dir.path().join("asked.json");
        let cli = Cli::parse_from([
            "rtperm-demo",
            "--store",
            store.to_str().unwrap(),
            "status",
        ]);
        Demo::new(&cli).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_walkthrough_group() {
        let cli = Cli::parse_from(["rtperm-demo", "walkthrough", "--group", "body-sensors"]);
        assert!(matches!(
            cli.command,
            Command::Walkthrough {
                group: PermissionGroup::BodySensor
            }
        ));
        assert_eq!(cli.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_rejects_unknown_group() {
        let result = Cli::try_parse_from(["rtperm-demo", "walkthrough", "--group", "gps"]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_walkthrough_persists_asked_flag() {
        let dir = tempfile::tempdir().unwrap();
        let demo = demo_with_store(&dir);

        demo.walkthrough(PermissionGroup::Location).await.unwrap();
        assert!(demo.manager.is_location_granted());
        assert_eq!(demo.system.settings_opened(), 1);

        let reopened = demo_with_store(&dir);
        assert!(reopened.manager.has_asked_for_location_permission());
    }
}
