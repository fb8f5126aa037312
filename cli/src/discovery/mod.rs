//! Network discovery scanner.
//!
//! Expands an address pattern into a bounded candidate set and probes each
//! candidate concurrently for a MAC address and vendor-allowlist
//! membership. The discovered-device list is a mutex-guarded container
//! owned by the caller and shared with the probe workers; callbacks fire
//! from worker context.

pub mod probe;
pub mod ranges;

pub use probe::{ALLOWED_OUIS, ProbeOutcome, probe_device};
pub use ranges::{SCAN_LIMIT, expand_pattern};

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Cap on concurrently running probes.
pub const SCAN_CONCURRENCY: usize = 100;

/// One allowlisted device found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// Live and terminal scan state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    Scanning {
        processed: usize,
        total: usize,
        found: usize,
        last_error: Option<String>,
    },
    Cancelled {
        found: usize,
    },
    Finished {
        found: usize,
    },
}

/// Probes every address under the concurrency cap, appending allowlisted
/// devices to `devices` and reporting through the callbacks. Cancellation
/// stops dispatching new probes promptly; probes already in flight finish
/// naturally. The final list is sorted by address.
pub async fn scan<F, G>(
    addresses: Vec<Ipv4Addr>,
    cancel: &CancellationToken,
    devices: &Arc<Mutex<Vec<DiscoveredDevice>>>,
    on_found: F,
    on_status: G,
) -> ScanStatus
where
    F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
    G: Fn(&ScanStatus) + Send + Sync + 'static,
{
    scan_with(addresses, cancel, devices, probe_device, on_found, on_status).await
}

/// [`scan`] with an injectable probe, so the coordination logic is
/// testable without touching the network.
pub(crate) async fn scan_with<Pr, Fut, F, G>(
    addresses: Vec<Ipv4Addr>,
    cancel: &CancellationToken,
    devices: &Arc<Mutex<Vec<DiscoveredDevice>>>,
    probe_fn: Pr,
    on_found: F,
    on_status: G,
) -> ScanStatus
where
    Pr: Fn(Ipv4Addr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProbeOutcome> + Send + 'static,
    F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
    G: Fn(&ScanStatus) + Send + Sync + 'static,
{
    let total = addresses.len();
    let semaphore = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
    let processed = Arc::new(AtomicUsize::new(0));
    let found = Arc::new(AtomicUsize::new(0));
    let probe_fn = Arc::new(probe_fn);
    let on_found = Arc::new(on_found);
    let on_status = Arc::new(on_status);
    let mut tasks = JoinSet::new();

    for ip in addresses {
        if cancel.is_cancelled() {
            break;
        }
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => {
                let Ok(permit) = permit else { break };
                permit
            }
            () = cancel.cancelled() => break,
        };

        let probe_fn = Arc::clone(&probe_fn);
        let on_found = Arc::clone(&on_found);
        let on_status = Arc::clone(&on_status);
        let devices = Arc::clone(devices);
        let processed = Arc::clone(&processed);
        let found = Arc::clone(&found);
        tasks.spawn(async move {
            let outcome = probe_fn(ip).await;
            drop(permit);
            let processed_now = processed.fetch_add(1, Ordering::SeqCst) + 1;
            match outcome {
                ProbeOutcome::Allowed(mac) => {
                    let device = DiscoveredDevice { ip, mac };
                    let found_now = found.fetch_add(1, Ordering::SeqCst) + 1;
                    devices
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(device.clone());
                    on_found(&device);
                    on_status(&ScanStatus::Scanning {
                        processed: processed_now,
                        total,
                        found: found_now,
                        last_error: None,
                    });
                }
                ProbeOutcome::Denied => {
                    on_status(&ScanStatus::Scanning {
                        processed: processed_now,
                        total,
                        found: found.load(Ordering::SeqCst),
                        last_error: None,
                    });
                }
                ProbeOutcome::Unresolved(reason) => {
                    on_status(&ScanStatus::Scanning {
                        processed: processed_now,
                        total,
                        found: found.load(Ordering::SeqCst),
                        last_error: Some(reason),
                    });
                }
            }
        });
    }

    while tasks.join_next().await.is_some() {}

    devices
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .sort_by_key(|device| device.ip);

    let found = found.load(Ordering::SeqCst);
    let status = if cancel.is_cancelled() {
        ScanStatus::Cancelled { found }
    } else {
        ScanStatus::Finished { found }
    };
    on_status(&status);
    status
}
