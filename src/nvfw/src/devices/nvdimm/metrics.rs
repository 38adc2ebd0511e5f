// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system for the NVDIMM command engine.
//!
//! # Metrics format
//! The metrics are flushed in JSON when requested by nvfw::logger::metrics::METRICS.write().
//!
//! ## JSON example with metrics:
//! ```json
//!  "nvdimm": {
//!     "restore_count": "SharedIncMetric",
//!     "restore_fails": "SharedIncMetric",
//!     "commands_issued": "SharedIncMetric",
//!     ...
//!  }
//! }
//! ```
//! All NVDIMMs share one aggregate structure; per-module failures are
//! attributable from the log, which carries the module index.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::logger::SharedIncMetric;

/// Stores aggregated command engine metrics.
pub(super) static METRICS: NvdimmDeviceMetrics = NvdimmDeviceMetrics::new();

/// Called by METRICS.flush(), this function facilitates serialization of command engine metrics.
pub fn flush_metrics<S: Serializer>(serializer: S) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_map(Some(1))?;
    seq.serialize_entry("nvdimm", &METRICS)?;
    seq.end()
}

/// NVDIMM command engine associated metrics.
#[derive(Debug, Serialize)]
pub(super) struct NvdimmDeviceMetrics {
    /// Number of restore workflows started.
    pub restore_count: SharedIncMetric,
    /// Number of restore workflows that failed.
    pub restore_fails: SharedIncMetric,
    /// Number of arm workflows started.
    pub arm_count: SharedIncMetric,
    /// Number of arm workflows that failed.
    pub arm_fails: SharedIncMetric,
    /// Number of abort workflows started.
    pub abort_count: SharedIncMetric,
    /// Number of abort workflows that failed.
    pub abort_fails: SharedIncMetric,
    /// Number of workflows that exhausted their timeout budget.
    pub workflow_timeouts: SharedIncMetric,
    /// Number of start/abort commands written, including per-tick re-issues.
    pub commands_issued: SharedIncMetric,
    /// Number of register transport failures.
    pub transport_errors: SharedIncMetric,
}
impl NvdimmDeviceMetrics {
    /// Const default construction.
    const fn new() -> Self {
        Self {
            restore_count: SharedIncMetric::new(),
            restore_fails: SharedIncMetric::new(),
            arm_count: SharedIncMetric::new(),
            arm_fails: SharedIncMetric::new(),
            abort_count: SharedIncMetric::new(),
            abort_fails: SharedIncMetric::new(),
            workflow_timeouts: SharedIncMetric::new(),
            commands_issued: SharedIncMetric::new(),
            transport_errors: SharedIncMetric::new(),
        }
    }
}
