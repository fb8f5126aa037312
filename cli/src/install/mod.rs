//! Device provisioning core.
//!
//! The orchestrator in this module drives one cancellable pipeline against a
//! single device: identity gate, connect, health checks, credential
//! rotation, conditional firmware update, service configuration, container
//! deployment, and the final configuration-bundle upload. All remote work
//! goes through the [`DeviceSession`] / [`DeviceConnector`] traits so the
//! pipeline can be exercised against scripted fakes; production wires in the
//! SSH implementations from [`session`].

pub mod checks;
pub mod container;
pub mod firmware;
pub mod password;
pub mod services;
pub mod session;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testutil;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::discovery::probe;
use crate::error::Error;
use crate::registry::RegistryAuth;

/// Account used for all SSH logins.
pub const SSH_USER: &str = "root";

/// Factory-default password tried before prompting the user.
pub const DEFAULT_PASSWORD: &str = "wago";

/// Address used when nothing is configured.
pub const DEFAULT_IP: &str = "10.92.1.113";

/// Deadline for quick diagnostic commands.
pub const SHORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for service-level commands.
pub const LONG_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Sink for provisioning events. Implementations marshal to their own
/// presentation thread; the core invokes these from worker context.
pub trait Reporter: Send + Sync {
    /// Emit a log line. A non-empty `replace_key` asks the sink to replace
    /// the previous line carrying the same key instead of appending (used
    /// for repeatedly polled status lines).
    fn log(&self, line: &str, replace_key: &str);

    /// Emit a progress milestone. `target` is the value the presentation
    /// layer should drift toward while no further updates arrive.
    fn progress(&self, value: f64, target: f64);
}

/// Interactive prompt callbacks. `None` means the user declined, which
/// aborts the current operation as a cancellation, not a failure.
#[allow(async_fn_in_trait)]
pub trait Prompter: Send + Sync {
    async fn password(&self) -> Option<String>;
    async fn new_password(&self) -> Option<String>;
}

/// Why a dial attempt failed. Only authentication rejections feed the
/// interactive retry loop; everything else is fatal.
#[derive(Debug)]
pub enum DialError {
    Auth,
    Network(String),
}

/// One authenticated connection to a device. Commands on a session are
/// issued strictly sequentially; the upload/extract pair and the firmware
/// start/monitor pair are the two designed exceptions.
#[allow(async_fn_in_trait)]
pub trait DeviceSession {
    /// Runs `command` to completion or kills it at the deadline. Returns
    /// trimmed stdout; non-zero exit yields [`Error::Command`] carrying the
    /// captured stderr.
    async fn run_command(&self, command: &str, timeout: Duration) -> Result<String, Error>;

    /// Runs `command`, forwarding every non-empty output line (stdout and
    /// stderr, split on both `\n` and `\r`) to the reporter as it arrives.
    async fn run_command_streaming(
        &self,
        command: &str,
        timeout: Duration,
        reporter: &dyn Reporter,
    ) -> Result<(), Error>;

    /// Streams a local file or directory tree into a remote extraction
    /// command rooted at `remote`.
    async fn copy_to(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        reporter: &dyn Reporter,
    ) -> Result<(), Error>;

    /// Closes the session. Idempotent; the pipeline guarantees it is
    /// reached exactly once per session on every exit path.
    async fn close(&mut self);
}

/// Produces sessions and answers the pre-connect identity probe.
#[allow(async_fn_in_trait)]
pub trait DeviceConnector {
    type Session: DeviceSession;

    /// One connection attempt with one password candidate.
    async fn dial(&self, ip: &str, password: &str) -> Result<Self::Session, DialError>;

    /// Resolves the device MAC address (normalized, colon-separated
    /// lowercase) via the local network.
    async fn resolve_mac(&self, ip: &str, reporter: &dyn Reporter) -> Result<String, Error>;
}

/// Inputs for one provisioning run. Immutable once the pipeline starts,
/// except `current_password`, which tracks the credential that currently
/// opens the device (updated after rotation and after the post-reboot
/// reconnect).
pub struct Parameters {
    pub ip: String,
    /// Minimum firmware build; `None` disables the comparison.
    pub firmware_target: Option<u32>,
    /// Run the firmware sub-protocol even when the comparison says no.
    pub force_firmware: bool,
    pub firmware_path: PathBuf,
    pub container_image: String,
    /// Single-line flag string, already decoded and assembled by the caller.
    pub container_flags: String,
    /// Configuration bundle pushed to `/root` at the end of the run.
    pub bundle_path: PathBuf,
    pub registry: RegistryAuth,
    pub cancel: CancellationToken,
    pub current_password: String,
}

/// Terminal result of a successful run.
#[derive(Debug)]
pub struct RunOutcome {
    pub serial: String,
    /// The firmware update ran but the target revision was not observed
    /// afterwards. Reported as a warning, never as a failure.
    pub firmware_still_required: bool,
}

/// Validates that `ip` is exactly four dot-separated integers in 0-255.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] otherwise.
pub fn validate_address(ip: &str) -> Result<(), Error> {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return Err(Error::InvalidAddress(ip.to_string()));
    }
    for part in parts {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidAddress(ip.to_string()));
        }
        match part.parse::<u16>() {
            Ok(value) if value <= 255 => {}
            _ => return Err(Error::InvalidAddress(ip.to_string())),
        }
    }
    Ok(())
}

pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Connects to `ip`, retrying with interactively prompted passwords while
/// authentication keeps getting rejected. Transport failures are fatal and
/// never retried here.
///
/// # Errors
///
/// [`Error::Network`] on transport failure, [`Error::PromptCancelled`] when
/// the user declines the prompt.
pub async fn establish<C: DeviceConnector, P: Prompter>(
    connector: &C,
    ip: &str,
    initial_password: &str,
    prompter: &P,
) -> Result<(C::Session, String), Error> {
    let mut password = initial_password.to_string();
    loop {
        match connector.dial(ip, &password).await {
            Ok(session) => return Ok((session, password)),
            Err(DialError::Network(e)) => return Err(Error::Network(e)),
            Err(DialError::Auth) => {}
        }
        match prompter.password().await {
            Some(next) => password = next,
            None => return Err(Error::PromptCancelled),
        }
    }
}

/// Runs the full provisioning pipeline against one device.
///
/// The session is closed exactly once on every exit path. Progress reaches
/// 1.0 only on success.
///
/// # Errors
///
/// Any stage error is surfaced unchanged; see the taxonomy in
/// [`crate::error::Error`].
pub async fn run<C, P>(
    connector: &C,
    params: &mut Parameters,
    prompter: &P,
    reporter: &dyn Reporter,
) -> Result<RunOutcome, Error>
where
    C: DeviceConnector,
    P: Prompter,
{
    reporter.progress(0.0, 0.0);
    validate_address(&params.ip)?;
    reporter.log(&format!("Starting provisioning for {}", params.ip), "");

    check_supported(connector, &params.ip, reporter).await?;
    reporter.progress(0.04, 0.04);
    ensure_active(&params.cancel)?;

    let (session, password) =
        establish(connector, &params.ip, DEFAULT_PASSWORD, prompter).await?;
    params.current_password = password;
    let mut session = session;

    let result = pipeline(connector, &mut session, params, prompter, reporter).await;
    session.close().await;

    match result {
        Ok(outcome) => {
            reporter.log("Provisioning completed successfully", "");
            reporter.progress(1.0, 1.0);
            Ok(outcome)
        }
        Err(e) => Err(e),
    }
}

async fn check_supported<C: DeviceConnector>(
    connector: &C,
    ip: &str,
    reporter: &dyn Reporter,
) -> Result<(), Error> {
    let mac = connector.resolve_mac(ip, reporter).await?;
    reporter.log(&format!("Device MAC address: {mac}"), "");
    if probe::is_allowed(&mac) {
        Ok(())
    } else {
        Err(Error::UnsupportedDevice { mac })
    }
}

async fn pipeline<C, P>(
    connector: &C,
    session: &mut C::Session,
    params: &mut Parameters,
    prompter: &P,
    reporter: &dyn Reporter,
) -> Result<RunOutcome, Error>
where
    C: DeviceConnector,
    P: Prompter,
{
    ensure_active(&params.cancel)?;
    let serial = checks::check_serial(&*session, reporter).await?;
    checks::validate_calibration(&*session).await?;
    reporter.progress(0.10, 0.10);

    ensure_active(&params.cancel)?;
    let new_password = prompter
        .new_password()
        .await
        .ok_or(Error::PromptCancelled)?;
    password::rotate_passwords(&*session, reporter, &new_password).await?;
    params.current_password = new_password;
    reporter.progress(0.15, 0.15);

    ensure_active(&params.cancel)?;
    let update_required =
        checks::check_firmware(&*session, reporter, params.firmware_target).await?;
    let mut firmware_still_required = false;
    if update_required || params.force_firmware {
        let outcome =
            firmware::run_update(connector, session, params, prompter, reporter).await?;
        if outcome == firmware::FirmwareOutcome::StillRequired {
            reporter.log(
                "Firmware update did not reach the target revision; update is still required",
                "",
            );
            firmware_still_required = true;
        }
    } else {
        reporter.log("Firmware is up to date", "");
    }
    reporter.progress(0.65, 0.65);

    ensure_active(&params.cancel)?;
    services::configure_services(&*session, reporter).await?;
    reporter.progress(0.70, 0.75);

    ensure_active(&params.cancel)?;
    container::deploy_container(
        &*session,
        reporter,
        &params.registry,
        &params.container_image,
        &params.container_flags,
    )
    .await?;
    reporter.progress(0.90, 0.90);

    ensure_active(&params.cancel)?;
    session
        .copy_to(&params.cancel, &params.bundle_path, "/root", reporter)
        .await?;
    reporter.progress(0.97, 0.97);

    Ok(RunOutcome {
        serial,
        firmware_still_required,
    })
}

#[cfg(test)]
mod tests {
    use super::testutil::{FakeConnector, FakePrompter, FakeReporter};
    use super::*;

    fn test_params(cancel: CancellationToken) -> Parameters {
        Parameters {
            ip: "10.0.1.20".into(),
            firmware_target: None,
            force_firmware: false,
            firmware_path: PathBuf::new(),
            container_image: "registry.example.com/app:1".into(),
            container_flags: "--restart always".into(),
            bundle_path: PathBuf::from("/tmp/bundle"),
            registry: RegistryAuth {
                token: "tok".into(),
                host: "registry.example.com".into(),
            },
            cancel,
            current_password: String::new(),
        }
    }

    // -----------------------------------------------------------------------
    // validate_address
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_address_accepts_valid_octets() {
        for ip in ["0.0.0.0", "10.92.1.113", "255.255.255.255", "192.168.0.1"] {
            assert!(validate_address(ip).is_ok(), "{ip} should be valid");
        }
    }

    #[test]
    fn test_validate_address_rejects_out_of_range_and_malformed() {
        for ip in [
            "10.0.1",
            "10.0.1.2.3",
            "256.0.0.1",
            "10.-1.0.1",
            "10.0.1.",
            "a.b.c.d",
            "",
        ] {
            assert!(validate_address(ip).is_err(), "{ip} should be invalid");
        }
    }

    // -----------------------------------------------------------------------
    // establish — interactive auth retry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_establish_prompts_exactly_once_for_single_auth_failure() {
        let connector = FakeConnector::new().with_auth_failures(1);
        let prompter = FakePrompter::new().with_passwords(vec![Some("secret".into())]);
        let (_, password) = establish(&connector, "10.0.1.2", DEFAULT_PASSWORD, &prompter)
            .await
            .expect("second attempt should succeed");
        assert_eq!(password, "secret");
        assert_eq!(prompter.password_prompts(), 1);
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_establish_does_not_retry_network_failures() {
        let connector = FakeConnector::new().with_network_failure("connection refused");
        let prompter = FakePrompter::new();
        let err = establish(&connector, "10.0.1.2", DEFAULT_PASSWORD, &prompter)
            .await
            .expect_err("network failure must be fatal");
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(prompter.password_prompts(), 0);
        assert_eq!(connector.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_establish_declined_prompt_is_prompt_cancelled() {
        let connector = FakeConnector::new().with_auth_failures(1);
        let prompter = FakePrompter::new().with_passwords(vec![None]);
        let err = establish(&connector, "10.0.1.2", DEFAULT_PASSWORD, &prompter)
            .await
            .expect_err("declined prompt aborts");
        assert!(matches!(err, Error::PromptCancelled));
    }

    // -----------------------------------------------------------------------
    // run — pipeline ordering and cleanup
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_executes_stages_in_order_and_closes_once() {
        let connector = FakeConnector::new();
        let prompter = FakePrompter::new().with_new_password("n3w");
        let reporter = FakeReporter::new();
        let mut params = test_params(CancellationToken::new());

        let outcome = run(&connector, &mut params, &prompter, &reporter)
            .await
            .expect("pipeline should succeed");
        assert!(!outcome.firmware_still_required);
        assert_eq!(outcome.serial, "0030DEAABBCC");
        assert_eq!(params.current_password, "n3w");
        assert_eq!(connector.close_count(), 1);

        let ops = connector.operations();
        let position = |needle: &str| {
            ops.iter()
                .position(|op| op.contains(needle))
                .unwrap_or_else(|| panic!("operation '{needle}' missing from {ops:?}"))
        };
        let serial = position("get_typelabel_value");
        let calib = position("cat /etc/calib");
        let rotate = position("usermod -p");
        let firmware = position("get_coupler_details");
        let ntp = position("config_sntp");
        let docker = position("config_docker activate");
        let login = position("docker login");
        let create = position("docker create");
        let bundle = position("copy: /tmp/bundle -> /root");
        assert!(serial < calib, "serial before calibration");
        assert!(calib < rotate, "calibration before rotation");
        assert!(rotate < firmware, "rotation before firmware check");
        assert!(firmware < ntp, "firmware check before services");
        assert!(ntp < docker, "ntp before container runtime");
        assert!(docker < login, "services before registry login");
        assert!(login < create, "login before container create");
        assert!(create < bundle, "container before bundle upload");

        let final_progress = reporter.last_progress().expect("progress emitted");
        assert!((final_progress.0 - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_run_rotates_all_accounts_in_order() {
        let connector = FakeConnector::new();
        let prompter = FakePrompter::new().with_new_password("n3w");
        let reporter = FakeReporter::new();
        let mut params = test_params(CancellationToken::new());
        run(&connector, &mut params, &prompter, &reporter)
            .await
            .expect("pipeline should succeed");

        let ops = connector.operations();
        let rotations: Vec<&String> = ops.iter().filter(|op| op.contains("usermod -p")).collect();
        assert_eq!(rotations.len(), 3);
        assert!(rotations[0].ends_with("root"));
        assert!(rotations[1].ends_with("admin"));
        assert!(rotations[2].ends_with("user"));
    }

    #[tokio::test]
    async fn test_run_rejects_cancelled_token_before_dialing() {
        let connector = FakeConnector::new();
        let prompter = FakePrompter::new();
        let reporter = FakeReporter::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut params = test_params(cancel);

        let err = run(&connector, &mut params, &prompter, &reporter)
            .await
            .expect_err("cancelled token aborts");
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(connector.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_run_declined_new_password_closes_session() {
        let connector = FakeConnector::new();
        let prompter = FakePrompter::new(); // no new password scripted -> declined
        let reporter = FakeReporter::new();
        let mut params = test_params(CancellationToken::new());

        let err = run(&connector, &mut params, &prompter, &reporter)
            .await
            .expect_err("declined new password aborts");
        assert!(matches!(err, Error::PromptCancelled));
        assert_eq!(connector.close_count(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_unsupported_mac_before_connecting() {
        let connector = FakeConnector::new().with_mac("aa:bb:cc:01:02:03");
        let prompter = FakePrompter::new();
        let reporter = FakeReporter::new();
        let mut params = test_params(CancellationToken::new());

        let err = run(&connector, &mut params, &prompter, &reporter)
            .await
            .expect_err("foreign OUI must be rejected");
        assert!(matches!(err, Error::UnsupportedDevice { .. }));
        assert_eq!(connector.dial_count(), 0);
    }
}
