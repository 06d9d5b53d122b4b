//! The outcome of one send attempt.

use std::time::Duration;

use rand::{Rng, distr::Alphanumeric};

use crate::model::DeliveryStatus;

const LOG_ID_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Sent,
    SoftFail,
    HardFail,
}

impl ResultType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "Sent",
            Self::SoftFail => "SoftFail",
            Self::HardFail => "HardFail",
        }
    }
}

impl From<ResultType> for DeliveryStatus {
    fn from(value: ResultType) -> Self {
        match value {
            ResultType::Sent => Self::Sent,
            ResultType::SoftFail => Self::SoftFail,
            ResultType::HardFail => Self::HardFail,
        }
    }
}

/// Whether, and when, the queue row should be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retry {
    #[default]
    No,
    /// Retry on the default backoff schedule.
    Yes,
    /// Retry after this many seconds.
    After(u64),
}

impl Retry {
    #[must_use]
    pub const fn is_set(self) -> bool {
        !matches!(self, Self::No)
    }

    #[must_use]
    pub const fn delay_secs(self) -> Option<u64> {
        match self {
            Self::After(secs) => Some(secs),
            Self::No | Self::Yes => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub result_type: ResultType,
    pub details: String,
    pub output: String,
    pub retry: Retry,
    /// The transport was encrypted.
    pub secure: bool,
    /// No connection could be made. Reused for the rest of a batch.
    pub connect_error: bool,
    pub suppress_bounce: bool,
    pub log_id: String,
    /// Seconds, rounded to two decimal places.
    pub time: Option<f64>,
}

impl SendResult {
    #[must_use]
    pub fn new(result_type: ResultType) -> Self {
        Self {
            result_type,
            details: String::new(),
            output: String::new(),
            retry: Retry::No,
            secure: false,
            connect_error: false,
            suppress_bounce: false,
            log_id: generate_log_id(),
            time: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.time = Some((elapsed.as_secs_f64() * 100.0).round() / 100.0);
    }
}

/// Eight random uppercase alphanumerics, used to correlate log lines with a
/// delivery record.
#[must_use]
pub fn generate_log_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(LOG_ID_LENGTH)
        .map(|byte| char::from(byte).to_ascii_uppercase())
        .collect()
}
