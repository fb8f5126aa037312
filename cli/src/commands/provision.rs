//! `fieldprov provision` — run the full provisioning pipeline against one
//! device. One invocation provisions one address; launching a second copy
//! for the same address is the caller's mistake to avoid, as each run
//! assumes exclusive ownership of its device.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, EnvConfig, keys};
use crate::error::Error;
use crate::install::session::SshConnector;
use crate::install::{self, Parameters, Prompter, container};
use crate::output::reporter::CliReporter;
use crate::output::{OutputContext, progress};
use crate::registry;

#[derive(Args)]
pub struct ProvisionArgs {
    /// Target device address (overrides the configured default)
    #[arg(long)]
    pub ip: Option<String>,

    /// Local firmware image (.wup archive)
    #[arg(long)]
    pub firmware_path: Option<PathBuf>,

    /// Minimum firmware build number the device must reach
    #[arg(long)]
    pub firmware_revision: Option<String>,

    /// Run the firmware update even when the device reports a newer build
    #[arg(long)]
    pub force_firmware: bool,

    /// Container image reference to deploy
    #[arg(long)]
    pub container_image: Option<String>,

    /// Configuration bundle uploaded to /root at the end of the run
    #[arg(long)]
    pub bundle_path: Option<PathBuf>,
}

/// Run the provision command.
///
/// # Errors
///
/// Fails on configuration gaps, registry token resolution, or any fatal
/// pipeline error. Cancellations (Ctrl-C, declined prompts) are rendered
/// as warnings, not failures.
pub async fn run(ctx: &OutputContext, args: ProvisionArgs) -> Result<()> {
    let store = ConfigStore::new()?;
    let mut cfg = store.load()?;
    apply_overrides(&mut cfg, &args);
    // The merged values become the new defaults, like every run before it.
    store.save(&cfg)?;

    // Token resolution happens before any device contact so a missing
    // registry setup cannot strand a half-provisioned device.
    let registry_auth = registry::resolve_auth(&cfg)?;

    let ip = value(&cfg, keys::IP_ADDRESS).unwrap_or_else(|| install::DEFAULT_IP.to_string());
    install::validate_address(&ip)?;

    let (firmware_target, target_warning) =
        parse_firmware_target(value(&cfg, keys::FIRMWARE_REVISION));
    let force_firmware = args.force_firmware
        || value(&cfg, keys::FORCE_FIRMWARE_UPDATE).as_deref() == Some("true");

    let container_image = value(&cfg, keys::CONTAINER_IMAGE).with_context(|| {
        format!(
            "missing '{}': set it with 'fieldprov config set {} <image>'",
            keys::CONTAINER_IMAGE,
            keys::CONTAINER_IMAGE
        )
    })?;
    let bundle_path = value(&cfg, keys::BUNDLE_PATH).with_context(|| {
        format!(
            "missing '{}': set it with 'fieldprov config set {} <path>'",
            keys::BUNDLE_PATH,
            keys::BUNDLE_PATH
        )
    })?;
    let container_flags =
        container::assemble_flags(&value(&cfg, keys::CONTAINER_FLAGS).unwrap_or_default());

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let bar = if ctx.show_progress() {
        progress::provisioning_bar()
    } else {
        ProgressBar::hidden()
    };
    let reporter = CliReporter::new(bar.clone(), ctx.quiet);
    let animator = reporter.spawn_animator();
    if let Some(warning) = target_warning {
        reporter_log(&reporter, &warning);
    }

    let mut params = Parameters {
        ip,
        firmware_target,
        force_firmware,
        firmware_path: value(&cfg, keys::FIRMWARE_PATH)
            .map(PathBuf::from)
            .unwrap_or_default(),
        container_image,
        container_flags,
        bundle_path: PathBuf::from(bundle_path),
        registry: registry_auth,
        cancel,
        current_password: String::new(),
    };

    let connector = SshConnector::new();
    let prompter = DialoguerPrompter { bar: bar.clone() };
    let result = install::run(&connector, &mut params, &prompter, reporter.as_ref()).await;
    animator.abort();
    ctrl_c.abort();

    match result {
        Ok(outcome) => {
            progress::finish_success(&bar, &format!("Device {} provisioned", params.ip));
            if outcome.firmware_still_required {
                ctx.warn("Firmware update ran but the target revision was not reached");
            }
            ctx.success(&format!(
                "Provisioning complete (serial {})",
                outcome.serial
            ));
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            progress::finish_error(&bar, "Cancelled");
            ctx.warn(&e.to_string());
            Ok(())
        }
        Err(e @ Error::HardwareDefect) => {
            progress::finish_error(&bar, "Device setup failed");
            Err(anyhow::Error::new(e))
        }
        Err(e) => {
            progress::finish_error(&bar, "Device setup failed");
            Err(anyhow::Error::new(e).context(format!("provisioning {}", params.ip)))
        }
    }
}

fn reporter_log(reporter: &CliReporter, line: &str) {
    use crate::install::Reporter as _;
    reporter.log(line, "");
}

fn value(cfg: &EnvConfig, key: &str) -> Option<String> {
    cfg.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn apply_overrides(cfg: &mut EnvConfig, args: &ProvisionArgs) {
    if let Some(ip) = &args.ip {
        cfg.insert(keys::IP_ADDRESS.into(), ip.trim().to_string());
    }
    if let Some(path) = &args.firmware_path {
        cfg.insert(
            keys::FIRMWARE_PATH.into(),
            path.to_string_lossy().into_owned(),
        );
    }
    if let Some(revision) = &args.firmware_revision {
        cfg.insert(keys::FIRMWARE_REVISION.into(), revision.trim().to_string());
    }
    if args.force_firmware {
        cfg.insert(keys::FORCE_FIRMWARE_UPDATE.into(), "true".into());
    }
    if let Some(image) = &args.container_image {
        cfg.insert(keys::CONTAINER_IMAGE.into(), image.trim().to_string());
    }
    if let Some(path) = &args.bundle_path {
        cfg.insert(
            keys::BUNDLE_PATH.into(),
            path.to_string_lossy().into_owned(),
        );
    }
}

/// A non-numeric configured revision disables the comparison with a
/// warning instead of failing the run.
fn parse_firmware_target(raw: Option<String>) -> (Option<u32>, Option<String>) {
    let Some(raw) = raw else {
        return (None, None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    match trimmed.parse::<u32>() {
        Ok(0) => (None, None),
        Ok(build) => (Some(build), None),
        Err(_) => (
            None,
            Some(format!(
                "Warning: firmware revision '{trimmed}' is not numeric; skipping automatic comparison"
            )),
        ),
    }
}

/// Interactive prompts on the blocking pool, with the progress bar
/// suspended so the prompt renders cleanly. The pipeline blocks on its own
/// suspension point while the terminal task answers.
struct DialoguerPrompter {
    bar: ProgressBar,
}

impl Prompter for DialoguerPrompter {
    async fn password(&self) -> Option<String> {
        let bar = self.bar.clone();
        tokio::task::spawn_blocking(move || {
            bar.suspend(|| {
                dialoguer::Password::new()
                    .with_prompt("Device password")
                    .allow_empty_password(false)
                    .interact()
                    .ok()
            })
        })
        .await
        .ok()
        .flatten()
    }

    async fn new_password(&self) -> Option<String> {
        let bar = self.bar.clone();
        tokio::task::spawn_blocking(move || {
            bar.suspend(|| {
                dialoguer::Password::new()
                    .with_prompt("New device password")
                    .with_confirmation("Confirm new device password", "Passwords do not match")
                    .allow_empty_password(false)
                    .interact()
                    .ok()
            })
        })
        .await
        .ok()
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_firmware_target_accepts_numeric() {
        assert_eq!(parse_firmware_target(Some("28".into())), (Some(28), None));
    }

    #[test]
    fn test_parse_firmware_target_warns_on_non_numeric() {
        let (target, warning) = parse_firmware_target(Some("v3.1".into()));
        assert_eq!(target, None);
        assert!(warning.expect("warning").contains("not numeric"));
    }

    #[test]
    fn test_parse_firmware_target_empty_and_zero_disable_comparison() {
        assert_eq!(parse_firmware_target(None), (None, None));
        assert_eq!(parse_firmware_target(Some("  ".into())), (None, None));
        assert_eq!(parse_firmware_target(Some("0".into())), (None, None));
    }

    #[test]
    fn test_apply_overrides_only_touches_provided_flags() {
        let mut cfg = EnvConfig::new();
        cfg.insert(keys::CONTAINER_IMAGE.into(), "app:1".into());
        let args = ProvisionArgs {
            ip: Some("10.0.1.7".into()),
            firmware_path: None,
            firmware_revision: None,
            force_firmware: false,
            container_image: None,
            bundle_path: None,
        };
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg[keys::IP_ADDRESS], "10.0.1.7");
        assert_eq!(cfg[keys::CONTAINER_IMAGE], "app:1");
        assert!(!cfg.contains_key(keys::FORCE_FIRMWARE_UPDATE));
    }
}
