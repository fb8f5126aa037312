//! `fieldprov config` — show and set persisted configuration values.

use anyhow::Result;
use clap::Subcommand;

use crate::config::{ConfigStore, encode_multiline, keys};
use crate::output::OutputContext;

/// Config subcommands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
    /// Print the configuration file path
    Path,
}

/// Run the config command.
///
/// # Errors
///
/// Returns an error for unknown keys or when the file cannot be
/// read/written.
pub fn run(ctx: &OutputContext, cmd: ConfigCommand) -> Result<()> {
    let store = ConfigStore::new()?;
    match cmd {
        ConfigCommand::Show => {
            let cfg = store.load()?;
            ctx.info(&format!("Configuration at {}", store.path().display()));
            if cfg.is_empty() {
                ctx.info("(empty — defaults apply)");
            }
            for (key, value) in &cfg {
                let shown = if key == keys::REGISTRY_TOKEN {
                    "<redacted>"
                } else {
                    value.as_str()
                };
                ctx.kv(key, shown);
            }
            Ok(())
        }
        ConfigCommand::Set { key, value } => {
            if !keys::ALL.contains(&key.as_str()) {
                anyhow::bail!(
                    "Unknown setting: {key}\n\nValid settings: {}",
                    keys::ALL.join(", ")
                );
            }
            let mut cfg = store.load()?;
            let stored = if value.contains('\n') {
                encode_multiline(&value)
            } else {
                value
            };
            cfg.insert(key.clone(), stored);
            store.save(&cfg)?;
            ctx.success(&format!("Set {key}"));
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", store.path().display());
            Ok(())
        }
    }
}
