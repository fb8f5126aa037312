//! Device identity and health checks: serial number, firmware revision,
//! calibration data.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::Error;
use crate::install::{DeviceSession, Reporter, SHORT_COMMAND_TIMEOUT};

pub const SERIAL_COMMAND: &str = "/etc/config-tools/get_typelabel_value -n UII";
pub const FIRMWARE_COMMAND: &str = "/etc/config-tools/get_coupler_details firmware-revision";

const CALIB_READ_COMMAND: &str = "cat /etc/calib";
const CALIB_REMOVE_COMMAND: &str = "rm /etc/calib";
const CALIB_INIT_COMMAND: &str = "/etc/init.d/calib start";

/// Calibration output must carry at least this many non-empty lines.
const CALIB_MIN_LINES: usize = 5;

/// Reads and logs the device serial number.
///
/// # Errors
///
/// Fails if the command fails or the parsed serial is empty.
pub async fn check_serial<S: DeviceSession>(
    session: &S,
    reporter: &dyn Reporter,
) -> Result<String, Error> {
    let output = session
        .run_command(SERIAL_COMMAND, SHORT_COMMAND_TIMEOUT)
        .await?;
    let serial = parse_serial(&output);
    if serial.is_empty() {
        return Err(Error::Network(
            "serial number output empty after parsing".into(),
        ));
    }
    reporter.log(&format!("Device serial number: {serial}"), "");
    Ok(serial)
}

/// Reads the firmware revision and decides whether an update is required.
///
/// When no build number can be extracted the full revision text is logged
/// and no comparison is made.
///
/// # Errors
///
/// Fails if the command fails or returns empty output.
pub async fn check_firmware<S: DeviceSession>(
    session: &S,
    reporter: &dyn Reporter,
    target: Option<u32>,
) -> Result<bool, Error> {
    let output = session
        .run_command(FIRMWARE_COMMAND, SHORT_COMMAND_TIMEOUT)
        .await?;
    let (full, build) = parse_firmware_build(&output);
    if full.is_empty() {
        return Err(Error::Network("firmware revision output empty".into()));
    }
    if build == 0 {
        reporter.log(
            &format!("Firmware revision: {full} (build number not detected)"),
            "",
        );
    } else {
        reporter.log(&format!("Firmware revision: {build}"), "");
    }
    Ok(update_required(build, target))
}

/// `true` iff a target is configured and the discovered build is a real
/// number strictly below it.
#[must_use]
pub fn update_required(build: u32, target: Option<u32>) -> bool {
    build != 0 && target.is_some_and(|t| build < t)
}

/// Verifies factory calibration data is present, attempting one
/// remove-and-reinitialize recovery before declaring the unit defective.
///
/// # Errors
///
/// [`Error::HardwareDefect`] when the data is still missing after the
/// recovery attempt; command errors are surfaced unchanged.
pub async fn validate_calibration<S: DeviceSession>(session: &S) -> Result<(), Error> {
    if calibration_present(session).await? {
        return Ok(());
    }
    session
        .run_command(CALIB_REMOVE_COMMAND, SHORT_COMMAND_TIMEOUT)
        .await?;
    session
        .run_command(CALIB_INIT_COMMAND, SHORT_COMMAND_TIMEOUT)
        .await?;
    if calibration_present(session).await? {
        Ok(())
    } else {
        Err(Error::HardwareDefect)
    }
}

async fn calibration_present<S: DeviceSession>(session: &S) -> Result<bool, Error> {
    let output = session
        .run_command(CALIB_READ_COMMAND, SHORT_COMMAND_TIMEOUT)
        .await?;
    Ok(count_data_lines(&output) >= CALIB_MIN_LINES)
}

fn count_data_lines(output: &str) -> usize {
    output
        .trim()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count()
}

pub(crate) fn parse_serial(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix("UII=").unwrap_or(raw).trim().to_string()
}

/// Extracts `(full_text, build_number)` from a revision string like
/// `03.10.08(22)`. A missing parenthesized integer yields build 0.
pub(crate) fn parse_firmware_build(raw: &str) -> (String, u32) {
    static BUILD_RE: OnceLock<Regex> = OnceLock::new();
    let re = BUILD_RE.get_or_init(|| {
        Regex::new(r"\((\d+)\)").unwrap_or_else(|e| panic!("build regex: {e}"))
    });

    let full = raw.trim().to_string();
    let build = re
        .captures(&full)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    (full, build)
}
