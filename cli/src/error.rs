//! Typed error taxonomy for provisioning and discovery.
//!
//! All variants implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator at the command layer. The two cancellation variants
//! (`PromptCancelled`, `Cancelled`) are outcomes, not system faults, and the
//! command layer renders them differently from failures.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the provisioning pipeline and the discovery scanner.
#[derive(Debug, Error)]
pub enum Error {
    /// Target address is not four dot-separated octets in 0-255.
    #[error("invalid IP address '{0}': expected four dot-separated octets in 0-255")]
    InvalidAddress(String),

    /// A scan pattern could not be expanded.
    #[error("{0}")]
    InvalidPattern(String),

    /// The device answered ARP but its OUI is not on the allowlist.
    #[error("device with MAC address {mac} is not a supported model")]
    UnsupportedDevice { mac: String },

    /// Transport-level failure. Fatal, never retried internally.
    /// Authentication rejections never reach this enum: they feed the
    /// interactive retry loop via `install::DialError::Auth` and only
    /// surface as [`Error::PromptCancelled`] when the user gives up.
    #[error("connection failed: {0}")]
    Network(String),

    /// A remote command exceeded its deadline. The remote process has been
    /// sent a kill signal before this is returned.
    #[error("command '{command}' timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// A remote command exited non-zero.
    #[error("command '{command}' failed with status {status} (stderr: {stderr})")]
    Command {
        command: String,
        status: u32,
        stderr: String,
    },

    /// Local packaging or remote extraction failed during a bulk transfer.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// The user declined an interactive prompt.
    #[error("cancelled by user")]
    PromptCancelled,

    /// The caller triggered the cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Calibration data is missing and could not be restored.
    #[error("device is missing calibration data. Please return this device to the retailer")]
    HardwareDefect,

    /// Registry login was rejected. Never carries the token or the raw
    /// command line.
    #[error("registry login failed: {0}")]
    RegistryLogin(String),

    /// The firmware sub-protocol failed hard (activation, status=error,
    /// reboot never completed, ...).
    #[error("firmware update failed: {0}")]
    Firmware(String),

    /// Salt generation or hashing failed during credential rotation.
    #[error("password hashing failed: {0}")]
    Crypto(String),
}

impl Error {
    /// Returns `true` for the two designed non-fault outcomes so callers can
    /// render them as cancellations instead of failures.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::PromptCancelled | Error::Cancelled)
    }
}
