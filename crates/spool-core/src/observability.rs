//! Tracing setup and status views.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};
use crate::domain::Status;

/// Install the global tracing subscriber. `RUST_LOG` wins over `config.level`.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init()?,
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
    }

    tracing::debug!(level = %config.level, format = ?config.format, "tracing initialized");
    Ok(())
}

/// Number of jobs per derived status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub init: usize,
    pub waiting: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub aborted: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: Status) {
        match status {
            Status::Init => self.init += 1,
            Status::Waiting => self.waiting += 1,
            Status::Running => self.running += 1,
            Status::Done => self.done += 1,
            Status::Error => self.error += 1,
            Status::Aborted => self.aborted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.init + self.waiting + self.running + self.done + self.error + self.aborted
    }
}

impl FromIterator<Status> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = Status>>(iter: I) -> Self {
        let mut counts = StatusCounts::default();
        for status in iter {
            counts.record(status);
        }
        counts
    }
}
