use std::time::{Duration, Instant};

use crate::error::{AnalysisError, Result};

/// Wall-clock budget of one package analysis.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit: Some(limit),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn check(&self) -> Result<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(AnalysisError::Timeout(limit)),
            _ => Ok(()),
        }
    }
}
