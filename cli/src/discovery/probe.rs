//! Per-address probe: best-effort reachability ping, ARP-table MAC
//! resolution, normalization, and OUI allowlist classification.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::Error;
use crate::install::Reporter;

/// Vendor OUIs (first three MAC octets) accepted as provisionable devices.
pub const ALLOWED_OUIS: [&str; 1] = ["00:30:de"];

const PROBE_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// What one probe learned about an address.
pub enum ProbeOutcome {
    /// MAC resolved and its OUI is allowlisted.
    Allowed(String),
    /// MAC resolved but the vendor is not supported.
    Denied,
    /// No MAC could be resolved (host down, ARP miss, command failure).
    Unresolved(String),
}

/// Probes one address: ping (result ignored) to populate the ARP table,
/// then a table lookup.
pub async fn probe_device(ip: Ipv4Addr) -> ProbeOutcome {
    let ip = ip.to_string();
    let _ = ping_once(&ip).await;
    match lookup_mac(&ip).await {
        Ok(mac) => {
            if is_allowed(&mac) {
                ProbeOutcome::Allowed(mac)
            } else {
                ProbeOutcome::Denied
            }
        }
        Err(reason) => ProbeOutcome::Unresolved(reason),
    }
}

/// Resolves and checks the MAC for the provisioning pipeline's identity
/// gate. The ping is best-effort; its failure is logged and ignored.
///
/// # Errors
///
/// [`Error::Network`] when no MAC can be resolved for `ip`.
pub async fn resolve_mac(ip: &str, reporter: &dyn Reporter) -> Result<String, Error> {
    if let Err(e) = ping_once(ip).await {
        reporter.log(
            &format!("Ping attempt failed, device might be offline: {e}"),
            "",
        );
    }
    lookup_mac(ip)
        .await
        .map_err(|reason| Error::Network(format!("failed to resolve MAC for {ip}: {reason}")))
}

async fn ping_once(ip: &str) -> Result<(), String> {
    let mut command = if cfg!(windows) {
        let mut c = tokio::process::Command::new("ping");
        c.args(["-n", "1", "-w", "1000", ip]);
        c
    } else {
        let mut c = tokio::process::Command::new("ping");
        c.args(["-c", "1", "-W", "1", ip]);
        c
    };
    let status = run_probe_command(&mut command).await?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("ping exited with {status}"))
    }
}

async fn lookup_mac(ip: &str) -> Result<String, String> {
    let mut command = if cfg!(windows) {
        let mut c = tokio::process::Command::new("arp");
        c.args(["-a", ip]);
        c
    } else {
        let mut c = tokio::process::Command::new("arp");
        c.args(["-n", ip]);
        c
    };
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = command
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(PROBE_COMMAND_TIMEOUT, output)
        .await
        .map_err(|_| "arp lookup timed out".to_string())?
        .map_err(|e| format!("arp failed to start: {e}"))?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        return Err(format!(
            "arp failed: {} (output: {})",
            output.status,
            combined.trim()
        ));
    }
    extract_mac(&combined).ok_or_else(|| "no mac address found".to_string())
}

async fn run_probe_command(
    command: &mut tokio::process::Command,
) -> Result<std::process::ExitStatus, String> {
    command.stdout(Stdio::null()).stderr(Stdio::null());
    let status = command.kill_on_drop(true).status();
    tokio::time::timeout(PROBE_COMMAND_TIMEOUT, status)
        .await
        .map_err(|_| "probe command timed out".to_string())?
        .map_err(|e| format!("probe command failed to start: {e}"))
}

/// Finds the first MAC-looking token in command output and returns it in
/// canonical form.
#[must_use]
pub fn extract_mac(text: &str) -> Option<String> {
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    let re = MAC_RE.get_or_init(|| {
        Regex::new(r"(?i)(?:[0-9a-f]{1,2}[:-]){5}[0-9a-f]{1,2}")
            .unwrap_or_else(|e| panic!("mac regex: {e}"))
    });
    re.find(text).and_then(|m| normalize_mac(m.as_str()))
}

/// Canonicalizes a MAC: lowercase, two hex digits per octet, colons
/// between octets (hyphens accepted on input).
#[must_use]
pub fn normalize_mac(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut octets = Vec::with_capacity(6);
    for part in parts {
        let value = u8::from_str_radix(part, 16).ok()?;
        octets.push(format!("{value:02x}"));
    }
    Some(octets.join(":"))
}

/// `true` when the MAC's OUI (first three octets) is on the allowlist.
#[must_use]
pub fn is_allowed(mac: &str) -> bool {
    let Some(oui) = mac.get(..8) else {
        return false;
    };
    ALLOWED_OUIS.contains(&oui)
}
