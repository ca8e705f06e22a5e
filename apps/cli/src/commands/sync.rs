//! # Sync Commands
//!
//! Manual sync, the auto-sync preference, status, and the conflict surface.

use anyhow::bail;
use clap::{ArgGroup, Subcommand};

use tally_core::{Conflict, ConflictChoice, FieldValue};

use super::{print_json, print_record};
use crate::App;

#[derive(Debug, Subcommand)]
pub enum ConflictCommand {
    /// List pending conflicts
    List,
    /// Pick the value a conflicted field (or record) should keep
    #[command(group(ArgGroup::new("choice").required(true).args(["local", "remote", "value"])))]
    Resolve {
        id: String,
        /// Keep this device's value
        #[arg(long)]
        local: bool,
        /// Keep the synced value
        #[arg(long)]
        remote: bool,
        /// Use a value of your own
        #[arg(long)]
        value: Option<String>,
    },
    /// Accept the automatic resolution and forget the conflict
    Dismiss { id: String },
}

pub async fn sync_now(app: &App) -> anyhow::Result<()> {
    let outcome = app.agent.trigger_manual_sync().await;
    if app.json {
        print_json(&outcome)?;
    } else {
        println!("{}", outcome.message);
        for conflict in &outcome.conflicts {
            println!("{}", describe_conflict(conflict));
        }
    }

    if !outcome.success {
        bail!("sync failed");
    }
    Ok(())
}

pub async fn conflicts(app: &App, cmd: ConflictCommand) -> anyhow::Result<()> {
    match cmd {
        ConflictCommand::List => {
            let pending = app.agent.pending_conflicts().await?;
            if app.json {
                return print_json(&pending);
            }
            if pending.is_empty() {
                println!("No pending conflicts");
            }
            for conflict in &pending {
                println!("{}", describe_conflict(conflict));
            }
            Ok(())
        }
        ConflictCommand::Resolve {
            id,
            local,
            remote,
            value,
        } => {
            let choice = match (local, remote, value) {
                (true, _, _) => ConflictChoice::Local,
                (_, true, _) => ConflictChoice::Remote,
                (_, _, Some(value)) => ConflictChoice::Custom(FieldValue::from_input(&value)),
                _ => bail!("choose one of --local, --remote or --value"),
            };

            let resolution = app.agent.resolve_conflict(&id, choice).await?;
            print_record(app.json, &resolution.record)?;
            if !resolution.propagated && !app.json {
                println!("Saved locally; it will sync on the next successful round");
            }
            Ok(())
        }
        ConflictCommand::Dismiss { id } => {
            app.agent.dismiss_conflict(&id).await?;
            if !app.json {
                println!("Dismissed {}", id);
            }
            Ok(())
        }
    }
}

pub async fn auto_sync(app: &App, enabled: bool) -> anyhow::Result<()> {
    if enabled {
        app.agent.enable_auto_sync().await?;
    } else {
        app.agent.disable_auto_sync().await?;
    }
    if !app.json {
        println!("Auto-sync {}", if enabled { "on" } else { "off" });
    }
    Ok(())
}

pub async fn status(app: &App) -> anyhow::Result<()> {
    let status = app.agent.status().await?;
    if app.json {
        return print_json(&status);
    }

    println!("State:      {}", status.state);
    println!("Auto-sync:  {}", if status.auto_sync { "on" } else { "off" });
    println!("Signed in:  {}", if status.signed_in { "yes" } else { "no" });
    match status.last_sync {
        Some(at) => println!("Last sync:  {}", at.to_rfc3339()),
        None => println!("Last sync:  never"),
    }
    println!("Conflicts:  {}", status.pending_conflicts);
    if let Some(error) = &status.last_error {
        println!("Last error: {}", error);
    }
    Ok(())
}

fn describe_conflict(conflict: &Conflict) -> String {
    format!(
        "{}  {} {} {}: local {} (v{}) / cloud {} (v{}), default {:?}",
        conflict.id,
        conflict.entity_kind,
        conflict.entity_id,
        conflict.field,
        conflict.local_value,
        conflict.local_version,
        conflict.cloud_value,
        conflict.cloud_version,
        conflict.default_resolution
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{ConflictValue, DefaultResolution, EntityKind, Money};

    #[test]
    fn test_describe_field_conflict() {
        let conflict = Conflict::field(
            EntityKind::Entry,
            "e-1",
            "amount",
            Money::from_major_minor(300, 0).into(),
            Money::from_major_minor(200, 0).into(),
            2,
            2,
        );
        let line = describe_conflict(&conflict);
        assert!(line.contains("entry e-1 amount"));
        assert!(line.contains("local 300.00"));
        assert!(line.contains("cloud 200.00"));
        assert_eq!(conflict.default_resolution, DefaultResolution::RemoteWins);
        assert!(matches!(conflict.local_value, ConflictValue::Value(_)));
    }
}
