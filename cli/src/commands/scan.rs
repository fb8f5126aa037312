//! `fieldprov scan` — discover candidate devices on the local network.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Args;
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;

use crate::discovery::{self, DiscoveredDevice, ScanStatus};
use crate::output::{OutputContext, progress};

#[derive(Args)]
pub struct ScanArgs {
    /// Address, CIDR block, `start-end` range, or four-octet pattern where
    /// an octet may be `*` or `a-b` (e.g. `10.0.1.*`, `172.16.1.0/25`)
    pub pattern: String,

    /// Output the discovered devices as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the scan command.
///
/// # Errors
///
/// Fails when the pattern cannot be expanded.
pub async fn run(ctx: &OutputContext, args: ScanArgs) -> Result<()> {
    let addresses = discovery::expand_pattern(&args.pattern)?;
    let total = addresses.len();

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let spinner = if ctx.show_progress() && !args.json {
        progress::spinner(&format!("Scanning {total} address(es)..."))
    } else {
        ProgressBar::hidden()
    };

    let devices = Arc::new(Mutex::new(Vec::new()));
    let found_spinner = spinner.clone();
    let status_spinner = spinner.clone();
    let status = discovery::scan(
        addresses,
        &cancel,
        &devices,
        move |device: &DiscoveredDevice| {
            found_spinner.println(format!("  found {}  {}", device.ip, device.mac));
        },
        move |status: &ScanStatus| {
            if let ScanStatus::Scanning {
                processed,
                total,
                found,
                last_error,
            } = status
            {
                let message = match last_error {
                    Some(error) => {
                        format!("Scanning ({processed}/{total})... last error: {error}")
                    }
                    None => format!("Found {found} device(s). Scanning ({processed}/{total})..."),
                };
                status_spinner.set_message(message);
            }
        },
    )
    .await;
    ctrl_c.abort();
    spinner.finish_and_clear();

    let list = devices
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    for device in &list {
        ctx.kv(&device.ip.to_string(), &device.mac);
    }
    match status {
        ScanStatus::Cancelled { found } => {
            ctx.warn(&format!("Scan cancelled. Found {found} device(s)."));
        }
        ScanStatus::Finished { found } => {
            ctx.success(&format!("Scan finished. Found {found} device(s)."));
        }
        ScanStatus::Scanning { .. } => {}
    }
    Ok(())
}
