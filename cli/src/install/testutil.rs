//! Scripted fakes for pipeline tests. Production code never touches this
//! module; the fakes plug into the same generics the SSH implementations use.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::install::{DeviceConnector, DeviceSession, DialError, Prompter, Reporter};

pub(crate) type Responder = Arc<dyn Fn(&str) -> Result<String, Error> + Send + Sync>;

/// Canned replies for the fixed diagnostic commands; everything else
/// succeeds with empty output.
fn default_responder() -> Responder {
    Arc::new(|command: &str| {
        if command.contains("get_typelabel_value") {
            Ok("UII=0030DEAABBCC".into())
        } else if command.contains("get_coupler_details") {
            Ok("03.10.08(22)".into())
        } else if command.contains("cat /etc/calib") {
            Ok("a=1\nb=2\nc=3\nd=4\ne=5\nf=6".into())
        } else {
            Ok(String::new())
        }
    })
}

pub(crate) struct FakeReporter {
    lines: Mutex<Vec<(String, String)>>,
    progress: Mutex<Vec<(f64, f64)>>,
}

impl FakeReporter {
    pub(crate) fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("reporter lock")
            .iter()
            .map(|(line, _)| line.clone())
            .collect()
    }

    pub(crate) fn last_progress(&self) -> Option<(f64, f64)> {
        self.progress.lock().expect("reporter lock").last().copied()
    }
}

impl Reporter for FakeReporter {
    fn log(&self, line: &str, replace_key: &str) {
        let mut lines = self.lines.lock().expect("reporter lock");
        if !replace_key.is_empty() {
            if let Some(existing) = lines.iter_mut().find(|(l, _)| l.contains(replace_key)) {
                *existing = (line.to_string(), replace_key.to_string());
                return;
            }
        }
        lines.push((line.to_string(), replace_key.to_string()));
    }

    fn progress(&self, value: f64, target: f64) {
        self.progress
            .lock()
            .expect("reporter lock")
            .push((value, target));
    }
}

pub(crate) struct FakePrompter {
    passwords: Mutex<Vec<Option<String>>>,
    new_password: Option<String>,
    password_prompts: AtomicUsize,
}

impl FakePrompter {
    pub(crate) fn new() -> Self {
        Self {
            passwords: Mutex::new(Vec::new()),
            new_password: None,
            password_prompts: AtomicUsize::new(0),
        }
    }

    /// Queue of answers for `password()`, popped front-first. An exhausted
    /// queue answers `None` (declined).
    pub(crate) fn with_passwords(self, answers: Vec<Option<String>>) -> Self {
        *self.passwords.lock().expect("prompter lock") = answers;
        self
    }

    pub(crate) fn with_new_password(mut self, value: &str) -> Self {
        self.new_password = Some(value.to_string());
        self
    }

    pub(crate) fn password_prompts(&self) -> usize {
        self.password_prompts.load(Ordering::SeqCst)
    }
}

impl Prompter for FakePrompter {
    async fn password(&self) -> Option<String> {
        self.password_prompts.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.passwords.lock().expect("prompter lock");
        if queue.is_empty() {
            None
        } else {
            queue.remove(0)
        }
    }

    async fn new_password(&self) -> Option<String> {
        self.new_password.clone()
    }
}

pub(crate) struct FakeSession {
    operations: Arc<Mutex<Vec<String>>>,
    responder: Responder,
    closes: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeSession")
            .field("operations", &self.operations)
            .field("closes", &self.closes)
            .finish_non_exhaustive()
    }
}

impl DeviceSession for FakeSession {
    async fn run_command(&self, command: &str, _timeout: Duration) -> Result<String, Error> {
        self.operations
            .lock()
            .expect("ops lock")
            .push(format!("run: {command}"));
        (self.responder)(command)
    }

    async fn run_command_streaming(
        &self,
        command: &str,
        _timeout: Duration,
        reporter: &dyn Reporter,
    ) -> Result<(), Error> {
        self.operations
            .lock()
            .expect("ops lock")
            .push(format!("stream: {command}"));
        let output = (self.responder)(command)?;
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            reporter.log(line.trim(), "");
        }
        Ok(())
    }

    async fn copy_to(
        &self,
        _cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        _reporter: &dyn Reporter,
    ) -> Result<(), Error> {
        self.operations
            .lock()
            .expect("ops lock")
            .push(format!("copy: {} -> {remote}", local.display()));
        Ok(())
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeConnector {
    mac: String,
    operations: Arc<Mutex<Vec<String>>>,
    responder: Responder,
    closes: Arc<AtomicUsize>,
    dials: AtomicUsize,
    auth_failures: AtomicUsize,
    network_failure: Option<String>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self {
            mac: "00:30:de:aa:bb:cc".into(),
            operations: Arc::new(Mutex::new(Vec::new())),
            responder: default_responder(),
            closes: Arc::new(AtomicUsize::new(0)),
            dials: AtomicUsize::new(0),
            auth_failures: AtomicUsize::new(0),
            network_failure: None,
        }
    }

    /// Reject the next `count` dials as authentication failures.
    pub(crate) fn with_auth_failures(self, count: usize) -> Self {
        self.auth_failures.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_network_failure(mut self, message: &str) -> Self {
        self.network_failure = Some(message.to_string());
        self
    }

    pub(crate) fn with_mac(mut self, mac: &str) -> Self {
        self.mac = mac.to_string();
        self
    }

    pub(crate) fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = responder;
        self
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn operations(&self) -> Vec<String> {
        self.operations.lock().expect("ops lock").clone()
    }
}

impl DeviceConnector for FakeConnector {
    type Session = FakeSession;

    async fn dial(&self, _ip: &str, _password: &str) -> Result<FakeSession, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.network_failure {
            return Err(DialError::Network(message.clone()));
        }
        if self
            .auth_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DialError::Auth);
        }
        Ok(FakeSession {
            operations: Arc::clone(&self.operations),
            responder: Arc::clone(&self.responder),
            closes: Arc::clone(&self.closes),
        })
    }

    async fn resolve_mac(&self, _ip: &str, _reporter: &dyn Reporter) -> Result<String, Error> {
        Ok(self.mac.clone())
    }
}
