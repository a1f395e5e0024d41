//! Binary judgement oracle used to refine matches
//!
//! An oracle answers whether a concrete string (a command, a path, a URL,
//! program text) is malicious in the role it plays. Implementations talk to
//! external services; [`with_retry`] bounds how often they are retried.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::ServiceError;

/// The role of the string being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Judgement {
    Command,
    Executable,
    FileRead,
    FileWrite,
    SearchPath,
    Url,
    Program,
    ShellCommand,
    ObfuscatedSource,
}

impl Judgement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Judgement::Command => "command",
            Judgement::Executable => "executable",
            Judgement::FileRead => "file-read",
            Judgement::FileWrite => "file-write",
            Judgement::SearchPath => "search-path",
            Judgement::Url => "url",
            Judgement::Program => "program",
            Judgement::ShellCommand => "shell-command",
            Judgement::ObfuscatedSource => "obfuscated-source",
        }
    }
}

pub trait Oracle: Send + Sync {
    /// `true` when `subject` is judged malicious.
    fn judge(&self, kind: Judgement, subject: &str) -> Result<bool, ServiceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up.
/// Malformed responses are not retried.
pub fn with_retry<T>(
    service: &'static str,
    policy: RetryPolicy,
    mut op: impl FnMut() -> Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    let attempts = policy.attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err @ ServiceError::MalformedResponse { .. }) => return Err(err),
            Err(err) => {
                warn!(service, attempt, error = %err, "external call failed");
                last = err.to_string();
                if attempt < attempts {
                    thread::sleep(policy.delay);
                }
            }
        }
    }
    Err(ServiceError::RetriesExhausted {
        service,
        attempts,
        message: last,
    })
}

/// Oracle with fixed answers per judgement kind, for tests and offline runs.
#[derive(Debug, Default)]
pub struct FixedOracle {
    malicious: Vec<Judgement>,
    calls: parking_lot::Mutex<Vec<(Judgement, String)>>,
}

impl FixedOracle {
    pub fn new(malicious: impl IntoIterator<Item = Judgement>) -> Self {
        Self {
            malicious: malicious.into_iter().collect(),
            calls: Default::default(),
        }
    }

    /// Every judgement requested so far.
    pub fn calls(&self) -> Vec<(Judgement, String)> {
        self.calls.lock().clone()
    }
}

impl Oracle for FixedOracle {
    fn judge(&self, kind: Judgement, subject: &str) -> Result<bool, ServiceError> {
        self.calls.lock().push((kind, subject.to_string()));
        Ok(self.malicious.contains(&kind))
    }
}
