//! OS service configuration: NTP and the container runtime.

use crate::error::Error;
use crate::install::{DeviceSession, LONG_COMMAND_TIMEOUT, Reporter, SHORT_COMMAND_TIMEOUT};

pub const NTP_COMMAND: &str =
    "/etc/config-tools/config_sntp state=enabled time-server-1=pool.ntp.org update-time=600";
pub const DOCKER_ACTIVATE_COMMAND: &str = "/etc/config-tools/config_docker activate";

const DOCKER_REMOVE_CONTAINERS: &str = "docker rm -vf $(docker ps -aq)";
const DOCKER_REMOVE_IMAGES: &str = "docker rmi -f $(docker images -aq)";

/// Enables NTP, activates the container runtime, and clears any
/// pre-existing containers and images. The cleanup commands are
/// best-effort: a fresh device has nothing to remove and they exit
/// non-zero.
///
/// # Errors
///
/// Fails if the NTP or runtime activation command fails.
pub async fn configure_services<S: DeviceSession>(
    session: &S,
    reporter: &dyn Reporter,
) -> Result<(), Error> {
    let ntp_out = session
        .run_command(NTP_COMMAND, SHORT_COMMAND_TIMEOUT)
        .await?;
    reporter.log(&format!("NTP set to pool.ntp.org {ntp_out}"), "");

    let docker_out = session
        .run_command(DOCKER_ACTIVATE_COMMAND, LONG_COMMAND_TIMEOUT)
        .await?;
    reporter.log(&format!("Container runtime activated {docker_out}"), "");

    let _ = session
        .run_command(DOCKER_REMOVE_CONTAINERS, LONG_COMMAND_TIMEOUT)
        .await;
    let _ = session
        .run_command(DOCKER_REMOVE_IMAGES, LONG_COMMAND_TIMEOUT)
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::DeviceConnector;
    use crate::install::testutil::{FakeConnector, FakeReporter};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cleanup_failures_are_ignored() {
        let connector = FakeConnector::new().with_responder(Arc::new(|cmd: &str| {
            if cmd.contains("docker rm") || cmd.contains("docker rmi") {
                Err(Error::Command {
                    command: cmd.to_string(),
                    status: 1,
                    stderr: "nothing to remove".into(),
                })
            } else {
                Ok(String::new())
            }
        }));
        let session = match connector.dial("10.0.1.2", "pw").await {
            Ok(session) => session,
            Err(_) => panic!("fake dial failed"),
        };
        let reporter = FakeReporter::new();
        assert!(configure_services(&session, &reporter).await.is_ok());
    }

    #[tokio::test]
    async fn test_activation_failure_is_fatal() {
        let connector = FakeConnector::new().with_responder(Arc::new(|cmd: &str| {
            if cmd.contains("config_docker") {
                Err(Error::Command {
                    command: cmd.to_string(),
                    status: 1,
                    stderr: "activation failed".into(),
                })
            } else {
                Ok(String::new())
            }
        }));
        let session = match connector.dial("10.0.1.2", "pw").await {
            Ok(session) => session,
            Err(_) => panic!("fake dial failed"),
        };
        let reporter = FakeReporter::new();
        assert!(configure_services(&session, &reporter).await.is_err());
    }
}
