// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system for the Address Range Scrub engine.
//!
//! # Metrics format
//! The metrics are flushed in JSON when requested by nvfw::logger::metrics::METRICS.write().
//!
//! ## JSON example with metrics:
//! ```json
//!  "ars": {
//!     "dispatch_count": "SharedIncMetric",
//!     "blocks_scanned": "SharedIncMetric",
//!     "faulty_lines": "SharedIncMetric",
//!     ...
//!  }
//! }
//! ```
//! There is one scrub engine per platform, so `ars` is a flat aggregate.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::logger::SharedIncMetric;

/// Stores aggregated scrub engine metrics.
pub(super) static METRICS: ArsMetrics = ArsMetrics::new();

/// Called by METRICS.flush(), this function facilitates serialization of scrub metrics.
pub fn flush_metrics<S: Serializer>(serializer: S) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_map(Some(1))?;
    seq.serialize_entry("ars", &METRICS)?;
    seq.end()
}

/// Scrub engine associated metrics.
#[derive(Debug, Serialize)]
pub(super) struct ArsMetrics {
    /// Number of software interrupt dispatches handled.
    pub dispatch_count: SharedIncMetric,
    /// Number of scans started.
    pub start_count: SharedIncMetric,
    /// Number of requests rejected because a scan was in progress.
    pub busy_rejections: SharedIncMetric,
    /// Number of Query-Capabilities requests served.
    pub query_caps_count: SharedIncMetric,
    /// Number of Query-Status requests served.
    pub query_status_count: SharedIncMetric,
    /// Number of Clear-Error requests served.
    pub clear_error_count: SharedIncMetric,
    /// Number of Translate-SPA requests served.
    pub translate_count: SharedIncMetric,
    /// Number of requests with an unknown function code.
    pub unknown_function_count: SharedIncMetric,
    /// Number of down-counter continuations handled.
    pub continuation_count: SharedIncMetric,
    /// Number of continuations that fired with no scan in progress.
    pub spurious_continuations: SharedIncMetric,
    /// Number of blocks probed.
    pub blocks_scanned: SharedIncMetric,
    /// Number of faulty cache lines localized.
    pub faulty_lines: SharedIncMetric,
    /// Number of faulty lines coalesced into an existing record.
    pub records_merged: SharedIncMetric,
    /// Number of records dropped because the record array was full.
    pub record_overflows: SharedIncMetric,
    /// Number of scans that reached Complete.
    pub scans_completed: SharedIncMetric,
    /// Number of scans that stopped prematurely.
    pub scans_stopped: SharedIncMetric,
    /// Number of failures while handling a wakeup.
    pub event_fails: SharedIncMetric,
}
impl ArsMetrics {
    /// Const default construction.
    const fn new() -> Self {
        Self {
            dispatch_count: SharedIncMetric::new(),
            start_count: SharedIncMetric::new(),
            busy_rejections: SharedIncMetric::new(),
            query_caps_count: SharedIncMetric::new(),
            query_status_count: SharedIncMetric::new(),
            clear_error_count: SharedIncMetric::new(),
            translate_count: SharedIncMetric::new(),
            unknown_function_count: SharedIncMetric::new(),
            continuation_count: SharedIncMetric::new(),
            spurious_continuations: SharedIncMetric::new(),
            blocks_scanned: SharedIncMetric::new(),
            faulty_lines: SharedIncMetric::new(),
            records_merged: SharedIncMetric::new(),
            record_overflows: SharedIncMetric::new(),
            scans_completed: SharedIncMetric::new(),
            scans_stopped: SharedIncMetric::new(),
            event_fails: SharedIncMetric::new(),
        }
    }
}

#[cfg(test)]
/// Tests for the scrub engine metrics.
pub mod tests {
    use super::*;
    use crate::logger::IncMetric;

    #[test]
    fn test_ars_metrics() {
        let local: ArsMetrics = ArsMetrics::new();
        let local_json: String = serde_json::to_string(&local).unwrap();
        serde_json::to_string(&METRICS).unwrap();
        let global_json: String = serde_json::to_string(&METRICS).unwrap();
        assert_eq!(local_json, global_json);
        local.blocks_scanned.inc();
        assert_eq!(local.blocks_scanned.count(), 1);
    }
}
