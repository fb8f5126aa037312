//! Firmware update sub-protocol.
//!
//! Upload, extract, activate, start, monitor, survive the reboot,
//! reconnect, finalize, verify. The mid-flash connection drop is a designed
//! "expected disconnect", classified explicitly by error variant instead of
//! being inferred from message text. All polling loops share the
//! [`StatusPoll`] primitive (poll, dedupe-log, verdict, sleep).

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::install::session::shell_quote;
use crate::install::{
    DEFAULT_PASSWORD, DeviceConnector, DeviceSession, DialError, LONG_COMMAND_TIMEOUT,
    Parameters, Prompter, Reporter, SHORT_COMMAND_TIMEOUT, checks, ensure_active, establish,
};

const FIRMWARE_REMOTE_DIR: &str = "/home/update";
const FW_START_COMMAND: &str = "/etc/config-tools/fwupdate start --path";
const FW_ACTIVATE_COMMAND: &str = "/etc/config-tools/fwupdate activate [--keep-application]";
const FW_CANCEL_COMMAND: &str = "/etc/config-tools/fwupdate cancel";
const FW_STATUS_COMMAND: &str = "/etc/config-tools/fwupdate status";
const FW_FINISH_COMMAND: &str = "/etc/config-tools/fwupdate finish";

const UNZIP_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FLASH_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const FINISH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_TRANSIENT_POLL_ERRORS: u32 = 6;

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(6 * 60);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal result of the sub-protocol. `StillRequired` means the update
/// ran but the target revision was not observed afterwards — a soft
/// outcome the caller reports as a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareOutcome {
    Completed,
    StillRequired,
}

/// How one polling loop ended, short of a hard error.
#[derive(Debug)]
pub(crate) enum PollExit {
    /// A status line satisfied the loop's terminal predicate.
    Terminal(String),
    /// Polling lost the device (more consecutive transport errors than the
    /// loop tolerates). Whether that is good or bad news is the caller's
    /// call: during flashing it announces the reboot, during finalization
    /// it is a failure.
    Disconnected(Error),
}

/// One parameterized shape for every firmware status polling loop.
pub(crate) struct StatusPoll<'a> {
    pub interval: Duration,
    pub log_prefix: &'a str,
    pub replace_key: &'a str,
    pub log_changes: bool,
    pub max_transient_errors: u32,
    pub is_terminal: fn(&str) -> bool,
}

impl StatusPoll<'_> {
    pub(crate) async fn run<S: DeviceSession>(
        &self,
        session: &S,
        cancel: &CancellationToken,
        reporter: &dyn Reporter,
    ) -> Result<PollExit, Error> {
        let mut last_line: Option<String> = None;
        let mut transient_errors: u32 = 0;
        loop {
            ensure_active(cancel)?;
            match session
                .run_command(FW_STATUS_COMMAND, LONG_COMMAND_TIMEOUT)
                .await
            {
                Err(e) => {
                    transient_errors += 1;
                    if transient_errors > self.max_transient_errors {
                        return Ok(PollExit::Disconnected(e));
                    }
                    reporter.log(
                        &format!(
                            "Lost connection while checking firmware status ({transient_errors}/{}); retrying...",
                            self.max_transient_errors
                        ),
                        "",
                    );
                }
                Ok(output) => {
                    transient_errors = 0;
                    for line in output.lines() {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let lower = line.to_lowercase();
                        if self.log_changes && last_line.as_deref() != Some(line) {
                            reporter.log(
                                &format!("{}{line}", self.log_prefix),
                                self.replace_key,
                            );
                            last_line = Some(line.to_string());
                        }
                        if lower.contains("status=error") {
                            return Err(Error::Firmware(format!("device reported: {line}")));
                        }
                        if (self.is_terminal)(&lower) {
                            return Ok(PollExit::Terminal(line.to_string()));
                        }
                    }
                }
            }
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

/// Runs the whole firmware update against the device behind `session`.
///
/// On success `session` refers to the post-reboot connection and
/// `params.current_password` holds whichever credential reopened it.
///
/// # Errors
///
/// Hard protocol failures surface as [`Error::Firmware`]; cancellations and
/// prompt declines keep their own variants.
pub async fn run_update<C, P>(
    connector: &C,
    session: &mut C::Session,
    params: &mut Parameters,
    prompter: &P,
    reporter: &dyn Reporter,
) -> Result<FirmwareOutcome, Error>
where
    C: DeviceConnector,
    P: Prompter,
{
    reporter.progress(0.16, 0.22);

    let artifact = params.firmware_path.clone();
    if artifact.as_os_str().is_empty() {
        return Err(Error::Firmware("firmware path is not configured".into()));
    }
    validate_artifact(&artifact)?;

    session
        .run_command(
            "rm -rf /home/update/* && mkdir -p /home/update",
            LONG_COMMAND_TIMEOUT,
        )
        .await?;

    reporter.log("Uploading firmware package to device", "");
    session
        .copy_to(&params.cancel, &artifact, FIRMWARE_REMOTE_DIR, reporter)
        .await?;
    reporter.progress(0.23, 0.23);

    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    reporter.log("Extracting firmware package on device", "");
    let unzip_cmd = format!(
        "cd {} && unzip -o {}",
        shell_quote(FIRMWARE_REMOTE_DIR),
        shell_quote(&file_name)
    );
    session
        .run_command_streaming(&unzip_cmd, UNZIP_TIMEOUT, reporter)
        .await?;

    // The extracted image stays; the archive itself is dead weight on a
    // small flash partition.
    session
        .run_command(
            &format!(
                "rm -f {}",
                shell_quote(&format!("{FIRMWARE_REMOTE_DIR}/{file_name}"))
            ),
            SHORT_COMMAND_TIMEOUT,
        )
        .await?;
    reporter.progress(0.25, 0.25);

    reporter.log("Activating firmware daemon", "");
    if let Err(e) = session
        .run_command_streaming(FW_ACTIVATE_COMMAND, ACTIVATE_TIMEOUT, reporter)
        .await
    {
        let _ = session
            .run_command_streaming(FW_CANCEL_COMMAND, ACTIVATE_TIMEOUT, reporter)
            .await;
        return Err(Error::Firmware(format!("fwupdate activate: {e}")));
    }

    let prepared = StatusPoll {
        interval: STATUS_POLL_INTERVAL,
        log_prefix: "",
        replace_key: "",
        log_changes: false,
        max_transient_errors: 0,
        is_terminal: |line| line.contains("status=prepared"),
    };
    match prepared.run(&*session, &params.cancel, reporter).await? {
        PollExit::Terminal(_) => {}
        PollExit::Disconnected(e) => return Err(e),
    }
    reporter.progress(0.26, 0.45);

    start_and_monitor(&*session, &params.cancel, reporter).await?;

    reporter.log("Device connection lost, waiting for reboot to complete...", "");
    reporter.progress(0.46, 0.56);
    session.close().await;

    reporter.log("Waiting for device to come back online after reboot...", "");
    let (new_session, new_password) = reconnect(
        connector,
        &params.ip,
        params.current_password.clone(),
        prompter,
        &params.cancel,
        reporter,
    )
    .await?;
    *session = new_session;
    params.current_password = new_password;
    reporter.progress(0.59, 0.59);

    let finalize = StatusPoll {
        interval: STATUS_POLL_INTERVAL,
        log_prefix: "Firmware status: ",
        replace_key: "Firmware status:",
        log_changes: true,
        max_transient_errors: MAX_TRANSIENT_POLL_ERRORS,
        is_terminal: |line| {
            line.contains("status=idle")
                || line.contains("status=unconfirmed")
                || line.contains("status=finished")
        },
    };
    match finalize.run(&*session, &params.cancel, reporter).await? {
        PollExit::Terminal(_) => {}
        PollExit::Disconnected(e) => {
            return Err(Error::Firmware(format!("monitor firmware finalization: {e}")));
        }
    }

    reporter.log("Finalising firmware update", "");
    session
        .run_command_streaming(FW_FINISH_COMMAND, FINISH_TIMEOUT, reporter)
        .await
        .map_err(|e| Error::Firmware(format!("fwupdate finish: {e}")))?;

    let still_required =
        checks::check_firmware(&*session, reporter, params.firmware_target).await?;
    if still_required {
        Ok(FirmwareOutcome::StillRequired)
    } else {
        reporter.log("Firmware update completed successfully", "");
        Ok(FirmwareOutcome::Completed)
    }
}

/// Issues the streamed start command while concurrently polling status.
/// Returns `Ok(())` once the device drops the connection (the expected
/// reboot); a reported `status=error` or a non-zero start exit is a hard
/// failure that leaves the daemon cancelled.
async fn start_and_monitor<S: DeviceSession>(
    session: &S,
    cancel: &CancellationToken,
    reporter: &dyn Reporter,
) -> Result<(), Error> {
    let start_cmd = format!("{FW_START_COMMAND} {FIRMWARE_REMOTE_DIR}");
    let monitor = StatusPoll {
        interval: STATUS_POLL_INTERVAL,
        log_prefix: "",
        replace_key: "",
        log_changes: true,
        max_transient_errors: 0,
        is_terminal: |_| false,
    };

    let start_fut = session.run_command_streaming(&start_cmd, FLASH_TIMEOUT, reporter);
    let poll_fut = monitor.run(session, cancel, reporter);
    tokio::pin!(start_fut);
    tokio::pin!(poll_fut);

    let mut start_done = false;
    loop {
        tokio::select! {
            result = &mut start_fut, if !start_done => {
                match result {
                    Ok(()) => {
                        reporter.log("Firmware update initiated, monitoring device status...", "");
                        start_done = true;
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e @ (Error::Network(_) | Error::Timeout { .. })) => {
                        // The connection dying under the start command is the
                        // same reboot the monitor is waiting for.
                        reporter.log(
                            &format!("Start command connection dropped ({e}); device is likely rebooting."),
                            "",
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = session
                            .run_command_streaming(FW_CANCEL_COMMAND, ACTIVATE_TIMEOUT, reporter)
                            .await;
                        return Err(Error::Firmware(format!("fwupdate start: {e}")));
                    }
                }
            }
            exit = &mut poll_fut => {
                match exit {
                    Ok(PollExit::Disconnected(_)) => {
                        reporter.log(
                            "Stopped receiving firmware status updates; device is likely rebooting.",
                            "",
                        );
                        return Ok(());
                    }
                    Ok(PollExit::Terminal(_)) => return Ok(()),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        let _ = session
                            .run_command_streaming(FW_CANCEL_COMMAND, ACTIVATE_TIMEOUT, reporter)
                            .await;
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Reconnects after the reboot: stored password first (an authentication
/// rejection clears it), then the interactive prompt path. Attempts are
/// spaced by a fixed interval and individually time-boxed so a device that
/// is still booting is never hammered or waited on indefinitely.
async fn reconnect<C, P>(
    connector: &C,
    ip: &str,
    stored_password: String,
    prompter: &P,
    cancel: &CancellationToken,
    reporter: &dyn Reporter,
) -> Result<(C::Session, String), Error>
where
    C: DeviceConnector,
    P: Prompter,
{
    let deadline = Instant::now() + RECONNECT_TIMEOUT;
    let mut password = stored_password;

    while Instant::now() < deadline {
        ensure_active(cancel)?;

        if !password.is_empty() {
            match tokio::time::timeout(RECONNECT_ATTEMPT_TIMEOUT, connector.dial(ip, &password))
                .await
            {
                Ok(Ok(session)) => {
                    reporter.log("Reconnected to device using stored credentials", "");
                    return Ok((session, password));
                }
                Ok(Err(DialError::Auth)) => {
                    reporter.log("Stored password rejected, requesting password from user", "");
                    password.clear();
                }
                Ok(Err(DialError::Network(_))) | Err(_) => {}
            }
        }

        if password.is_empty() {
            match establish(connector, ip, DEFAULT_PASSWORD, prompter).await {
                Ok((session, pwd)) => {
                    reporter.log("Reconnected to device after reboot", "");
                    return Ok((session, pwd));
                }
                Err(Error::PromptCancelled) => return Err(Error::PromptCancelled),
                Err(_) => {}
            }
        }

        tokio::select! {
            () = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            () = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
    Err(Error::Firmware("timed out waiting for device to reboot".into()))
}

/// Checks the artifact before any network activity: `.wup` extension,
/// regular file, structurally valid zip (local header magic and an
/// end-of-central-directory record).
pub(crate) fn validate_artifact(path: &Path) -> Result<(), Error> {
    let has_extension = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wup"));
    if !has_extension {
        return Err(Error::Firmware(format!(
            "firmware file must have .wup extension: {}",
            path.display()
        )));
    }

    let meta = std::fs::metadata(path)
        .map_err(|e| Error::Firmware(format!("stat firmware file: {e}")))?;
    if meta.is_dir() {
        return Err(Error::Firmware(format!(
            "firmware path points to a directory: {}",
            path.display()
        )));
    }

    let well_formed = is_zip_archive(path)
        .map_err(|e| Error::Firmware(format!("read firmware file: {e}")))?;
    if well_formed {
        Ok(())
    } else {
        Err(Error::Firmware(format!(
            "firmware file is not a valid zip archive: {}",
            path.display()
        )))
    }
}

fn is_zip_archive(path: &Path) -> std::io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    const LOCAL_HEADER: &[u8; 4] = b"PK\x03\x04";
    const END_OF_CENTRAL_DIR: &[u8; 4] = b"PK\x05\x06";
    // EOCD record plus the maximum comment length it can carry.
    const EOCD_SEARCH_SPAN: u64 = 22 + 65_535;

    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len < 22 {
        return Ok(false);
    }

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != LOCAL_HEADER && &magic != END_OF_CENTRAL_DIR {
        return Ok(false);
    }

    let span = len.min(EOCD_SEARCH_SPAN);
    let offset = i64::try_from(span).unwrap_or(i64::MAX);
    file.seek(SeekFrom::End(-offset))?;
    let mut tail = Vec::new();
    file.take(span).read_to_end(&mut tail)?;
    Ok(tail
        .windows(END_OF_CENTRAL_DIR.len())
        .any(|window| window == END_OF_CENTRAL_DIR))
}
