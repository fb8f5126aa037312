//! Container deployment: registry login and container creation.

use std::time::Duration;

use crate::config::decode_multiline;
use crate::error::Error;
use crate::install::session::shell_quote;
use crate::install::{DeviceSession, Reporter, SHORT_COMMAND_TIMEOUT};
use crate::registry::RegistryAuth;

const CONTAINER_CREATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Logs in to the registry and creates the workload container.
///
/// # Errors
///
/// [`Error::RegistryLogin`] for login failures (the token never appears in
/// the error); create failures keep their plain [`Error::Command`] shape so
/// the two are clearly distinguishable.
pub async fn deploy_container<S: DeviceSession>(
    session: &S,
    reporter: &dyn Reporter,
    auth: &RegistryAuth,
    image: &str,
    flags: &str,
) -> Result<(), Error> {
    registry_login(session, auth).await?;

    let create_cmd = build_create_command(flags, image);
    reporter.log(&format!("Creating container with image: {image}"), "");
    session
        .run_command_streaming(&create_cmd, CONTAINER_CREATE_TIMEOUT, reporter)
        .await?;

    reporter.log("Container created successfully.", "");
    Ok(())
}

/// Pipes the token into the registry login command. The command line
/// contains the token, so every failure is mapped to a sanitized
/// [`Error::RegistryLogin`] built only from exit diagnostics.
async fn registry_login<S: DeviceSession>(
    session: &S,
    auth: &RegistryAuth,
) -> Result<(), Error> {
    let login_cmd = format!(
        "echo {} | docker login --username AWS --password-stdin {}",
        shell_quote(&auth.token),
        shell_quote(&auth.host)
    );
    match session.run_command(&login_cmd, SHORT_COMMAND_TIMEOUT).await {
        Ok(_) => Ok(()),
        Err(Error::Command { status, stderr, .. }) => Err(Error::RegistryLogin(format!(
            "docker login exited with status {status} (stderr: {stderr})"
        ))),
        Err(Error::Timeout { timeout, .. }) => Err(Error::RegistryLogin(format!(
            "docker login timed out after {}s",
            timeout.as_secs()
        ))),
        Err(e) => Err(Error::RegistryLogin(e.to_string())),
    }
}

/// Assembles the persisted multi-line flag value into the single-line
/// fragment passed to the create command: decode the stored escapes,
/// normalize CRLF, join non-empty trimmed lines with single spaces.
#[must_use]
pub fn assemble_flags(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let decoded = decode_multiline(raw).replace("\r\n", "\n");
    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `docker create <flags> '<image>'`. The flag string is taken verbatim
/// (the caller validated it); the image reference is shell-quoted.
#[must_use]
pub fn build_create_command(flags: &str, image: &str) -> String {
    let mut parts = vec!["docker".to_string(), "create".to_string()];
    let flags = flags.trim();
    if !flags.is_empty() {
        parts.push(flags.to_string());
    }
    parts.push(shell_quote(image));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::DeviceConnector;
    use crate::install::testutil::{FakeConnector, FakeReporter};
    use std::sync::Arc;

    // -----------------------------------------------------------------------
    // Command assembly
    // -----------------------------------------------------------------------

    #[test]
    fn test_build_create_command_quotes_image() {
        assert_eq!(
            build_create_command("--restart always", "registry.example.com/app:1"),
            "docker create --restart always 'registry.example.com/app:1'"
        );
    }

    #[test]
    fn test_build_create_command_without_flags() {
        assert_eq!(
            build_create_command("  ", "app:1"),
            "docker create 'app:1'"
        );
    }

    #[test]
    fn test_assemble_flags_joins_stored_lines() {
        let stored = "-p 8080:80\\n\\n  --restart always  \\n-e MODE=field";
        assert_eq!(
            assemble_flags(stored),
            "-p 8080:80 --restart always -e MODE=field"
        );
        assert_eq!(assemble_flags(""), "");
    }

    // -----------------------------------------------------------------------
    // Login failure sanitization
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_login_failure_never_leaks_the_token() {
        let connector = FakeConnector::new().with_responder(Arc::new(|cmd: &str| {
            if cmd.contains("docker login") {
                Err(Error::Command {
                    command: cmd.to_string(),
                    status: 1,
                    stderr: "unauthorized".into(),
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
        let auth = RegistryAuth {
            token: "sup3r-s3cret-token".into(),
            host: "registry.example.com".into(),
        };

        let err = deploy_container(&session, &reporter, &auth, "app:1", "")
            .await
            .expect_err("login failure surfaces");
        assert!(matches!(err, Error::RegistryLogin(_)));
        assert!(!err.to_string().contains("sup3r-s3cret-token"));
    }

    #[tokio::test]
    async fn test_create_failure_is_distinct_from_login_failure() {
        let connector = FakeConnector::new().with_responder(Arc::new(|cmd: &str| {
            if cmd.starts_with("docker create") {
                Err(Error::Command {
                    command: cmd.to_string(),
                    status: 125,
                    stderr: "manifest unknown".into(),
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
        let auth = RegistryAuth {
            token: "tok".into(),
            host: "registry.example.com".into(),
        };

        let err = deploy_container(&session, &reporter, &auth, "app:1", "")
            .await
            .expect_err("create failure surfaces");
        assert!(matches!(err, Error::Command { .. }));
    }
}
