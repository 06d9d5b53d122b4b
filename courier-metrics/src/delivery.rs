//! Delivery outcome metrics
//!
//! Tracks what senders report back:
//! - Results by sender kind and outcome
//! - Time taken by each send

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};

use crate::meter;

#[derive(Debug)]
pub struct DeliveryMetrics {
    results: Counter<u64>,
    duration: Histogram<f64>,
}

impl DeliveryMetrics {
    pub(crate) fn new() -> Self {
        let meter = meter();

        Self {
            results: meter
                .u64_counter("courier.delivery.results.total")
                .with_description("Send results by sender and outcome")
                .build(),
            duration: meter
                .f64_histogram("courier.delivery.duration.seconds")
                .with_description("Time taken to hand a message to its next hop")
                .with_unit("s")
                .build(),
        }
    }

    /// Records a send outcome (`Sent`, `SoftFail`, `HardFail`) for `sender`.
    pub fn record_result(&self, sender: &'static str, outcome: &'static str, seconds: f64) {
        let attributes = [
            KeyValue::new("sender", sender),
            KeyValue::new("outcome", outcome),
        ];
        self.results.add(1, &attributes);
        self.duration.record(seconds, &attributes);
    }
}
