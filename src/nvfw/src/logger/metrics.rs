// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system.
//!
//! # Metrics format
//! The metrics are flushed in JSON whenever [`METRICS.write()`](Metrics::write)
//! is called. The first field is always the timestamp, followed by the JSON
//! representation of the structures representing each component on which we
//! are capturing specific metrics.
//!
//! ## JSON example with metrics:
//! ```json
//! {
//!  "utc_timestamp_ms": 1541591155180,
//!  "boot": {
//!    "dimms_probed": 2,
//!    "dimms_armed": 2
//!  },
//!  "nvdimm": {
//!    "restore_count": 2,
//!    "commands_issued": 14
//!  }
//! }
//! ```
//!
//! # Design
//! The main design goals of this system are:
//! * Use lockless operations, preferably ones that don't require anything other than simple
//!   reads/writes being atomic.
//! * Exploit interior mutability and atomics being Sync to allow all methods (including the ones
//!   which are effectively mutable) to be callable on a global non-mut static.
//! * Rely on `serde` to provide the actual serialization for writing the metrics.
//!
//! The system implements 2 types of metrics:
//! * Shared Incremental Metrics (SharedIncMetrics) - dedicated for the metrics which need a counter
//!   (i.e the number of times a scrub continuation fired). These metrics are reset upon flush.
//! * Shared Store Metrics (SharedStoreMetrics) - are targeted at keeping a persistent value, it is
//!   not intended to act as a counter (i.e boot wall time for example).
//!
//! `SharedIncMetric` stores two values (current and previous) and computes the delta between them
//! at flush time, so the flushing thread never writes the counters the subsystems increment.

use std::fmt::Debug;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::{Serialize, Serializer};

use super::FwLineWriter;
use crate::devices::nvdimm::metrics as nvdimm_metrics;
use crate::scrub::metrics as scrub_metrics;
use crate::utils::time::{ClockType, get_time_ns};

/// Static instance used for handling metrics.
pub static METRICS: Metrics<NvfwMetrics, FwLineWriter> =
    Metrics::<NvfwMetrics, FwLineWriter>::new(NvfwMetrics::new());

/// Metrics system.
// All member fields have types which are Sync, and exhibit interior mutability, so
// we can call operations on metrics using a non-mut static global variable.
#[derive(Debug)]
pub struct Metrics<T: Serialize, M: Write + Send> {
    // Metrics will get flushed here.
    metrics_buf: OnceLock<Mutex<M>>,
    /// The metrics themselves.
    pub app_metrics: T,
}

impl<T: Serialize + Debug, M: Write + Send + Debug> Metrics<T, M> {
    /// Creates a new instance of the current metrics.
    pub const fn new(app_metrics: T) -> Metrics<T, M> {
        Metrics {
            metrics_buf: OnceLock::new(),
            app_metrics,
        }
    }

    /// Initialize the metrics system (once and only once).
    /// Every call made after the first will have no effect besides returning `Ok` or `Err`.
    pub fn init(&self, metrics_dest: M) -> Result<(), MetricsError> {
        self.metrics_buf
            .set(Mutex::new(metrics_dest))
            .map_err(|_| MetricsError::AlreadyInitialized)
    }

    /// Writes metrics to the destination provided upon initialization.
    ///
    /// Returns `Ok(true)` if the metrics system was initialized and the
    /// metrics were written, `Ok(false)` if it was not yet initialized, and
    /// an error if the write failed.
    pub fn write(&self) -> Result<bool, MetricsError> {
        if let Some(lock) = self.metrics_buf.get() {
            match serde_json::to_string(&self.app_metrics) {
                Ok(msg) => {
                    if let Ok(mut guard) = lock.lock() {
                        // No need to explicitly call flush because the underlying LineWriter
                        // flushes automatically whenever a newline is detected (and we always
                        // end the current write with a newline).
                        guard
                            .write_all(format!("{msg}\n",).as_bytes())
                            .map_err(MetricsError::Write)
                            .map(|_| true)
                    } else {
                        // There is no way to push metrics if the destination lock got poisoned.
                        panic!(
                            "Failed to write to the provided metrics destination due to poisoned \
                             lock"
                        );
                    }
                }
                Err(err) => Err(MetricsError::Serde(err.to_string())),
            }
        } else {
            // If the metrics are not initialized, no error is thrown but we do let the user know
            // that metrics were not written.
            Ok(false)
        }
    }
}

impl<T: Serialize + Debug, M: Write + Send + Debug> Deref for Metrics<T, M> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.app_metrics
    }
}

/// Describes the errors which may occur while handling metrics scenarios.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// {0}
    NeverInitialized(String),
    /// Reinitialization of metrics not allowed.
    AlreadyInitialized,
    /// {0}
    Serde(String),
    /// Failed to write metrics: {0}
    Write(std::io::Error),
}

/// Used for defining new types of metrics that act as a counter (i.e they are continuously updated
/// by incrementing their value).
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
}

/// Used for defining new types of metrics that do not need a counter and act as a persistent
/// indicator.
pub trait StoreMetric {
    /// Returns current value of the counter.
    fn fetch(&self) -> u64;
    /// Stores `value` to the current counter.
    fn store(&self, value: u64);
}

/// Representation of a metric that is expected to be incremented from more than one thread, so more
/// synchronization is necessary.
// We keep two values for each metric to be able to reset counters on flush:
// 1st member - current value being updated
// 2nd member - old value that gets the current value whenever metrics is flushed to disk
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);

impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

/// Representation of a metric that is expected to hold a value that can be accessed
/// from more than one thread, so more synchronization is necessary.
#[derive(Debug, Default)]
pub struct SharedStoreMetric(AtomicU64);

impl SharedStoreMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    // The order is Relaxed, but the actual instruction is a fetch_add which is atomic across
    // threads regardless.
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl StoreMetric for SharedStoreMetric {
    fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn store(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

impl Serialize for SharedIncMetric {
    /// Reset counters of each metric. Here we suppose that Serialize's goal is to help with the
    /// flushing of metrics.
    /// !!! Any print of the metrics will also reset them. Use with caution !!!
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

impl Serialize for SharedStoreMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0.load(Ordering::Relaxed))
    }
}

// The sole purpose of this struct is to produce an UTC timestamp when an instance is serialized.
#[derive(Debug, Default)]
struct SerializeToUtcTimestampMs;

impl SerializeToUtcTimestampMs {
    /// Const default construction.
    pub const fn new() -> Self {
        SerializeToUtcTimestampMs
    }
}

impl Serialize for SerializeToUtcTimestampMs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer
            .serialize_i64(i64::try_from(get_time_ns(ClockType::Real) / 1_000_000).unwrap())
    }
}

macro_rules! create_serialize_proxy {
    // By using the below structure in NvfwMetrics it is easy to serialise the subsystem
    // metrics kept in $metric_mod as part of the same json object as NvfwMetrics.
    ($proxy_struct:ident, $metric_mod:ident) => {
        /// Proxy serializing the subsystem metrics module.
        #[derive(Default, Debug)]
        pub struct $proxy_struct;

        impl Serialize for $proxy_struct {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                $metric_mod::flush_metrics(serializer)
            }
        }
    };
}

create_serialize_proxy!(NvdimmMetricsSerializeProxy, nvdimm_metrics);
create_serialize_proxy!(ArsMetricsSerializeProxy, scrub_metrics);

/// Metrics of the boot orchestration.
#[derive(Debug, Default, Serialize)]
pub struct BootMetrics {
    /// Number of DIMM slots probed.
    pub dimms_probed: SharedIncMetric,
    /// Number of configured DIMMs that never answered probing.
    pub probe_fails: SharedIncMetric,
    /// Number of DIMMs whose restore workflow succeeded.
    pub dimms_restored: SharedIncMetric,
    /// Number of DIMMs whose arm workflow succeeded.
    pub dimms_armed: SharedIncMetric,
    /// Number of failed restore workflows.
    pub restore_fails: SharedIncMetric,
    /// Number of failed arm workflows.
    pub arm_fails: SharedIncMetric,
    /// Number of times the platform watchdog was enabled.
    pub watchdog_enables: SharedIncMetric,
    /// Number of failed platform watchdog enables.
    pub watchdog_fails: SharedIncMetric,
    /// Boot orchestration wall time in microseconds.
    pub boot_time_us: SharedStoreMetric,
}

impl BootMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            dimms_probed: SharedIncMetric::new(),
            probe_fails: SharedIncMetric::new(),
            dimms_restored: SharedIncMetric::new(),
            dimms_armed: SharedIncMetric::new(),
            restore_fails: SharedIncMetric::new(),
            arm_fails: SharedIncMetric::new(),
            watchdog_enables: SharedIncMetric::new(),
            watchdog_fails: SharedIncMetric::new(),
            boot_time_us: SharedStoreMetric::new(),
        }
    }
}

/// Metrics for the logging subsystem.
#[derive(Debug, Default, Serialize)]
pub struct LoggerSystemMetrics {
    /// Number of misses on flushing metrics.
    pub missed_metrics_count: SharedIncMetric,
    /// Number of errors during metrics handling.
    pub metrics_fails: SharedIncMetric,
    /// Number of misses on logging human readable content.
    pub missed_log_count: SharedIncMetric,
    /// Number of errors while trying to log human readable content.
    pub log_fails: SharedIncMetric,
}

impl LoggerSystemMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            missed_metrics_count: SharedIncMetric::new(),
            metrics_fails: SharedIncMetric::new(),
            missed_log_count: SharedIncMetric::new(),
            log_fails: SharedIncMetric::new(),
        }
    }
}

/// Structure storing all metrics while enforcing serialization support on them.
#[derive(Debug, Default, Serialize)]
pub struct NvfwMetrics {
    utc_timestamp_ms: SerializeToUtcTimestampMs,
    /// Boot orchestration metrics.
    pub boot: BootMetrics,
    /// Logging related metrics.
    pub logger: LoggerSystemMetrics,
    #[serde(flatten)]
    /// NVDIMM command engine metrics.
    pub nvdimm_ser: NvdimmMetricsSerializeProxy,
    #[serde(flatten)]
    /// Address Range Scrub metrics.
    pub ars_ser: ArsMetricsSerializeProxy,
}

impl NvfwMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            utc_timestamp_ms: SerializeToUtcTimestampMs::new(),
            boot: BootMetrics::new(),
            logger: LoggerSystemMetrics::new(),
            nvdimm_ser: NvdimmMetricsSerializeProxy {},
            ars_ser: ArsMetricsSerializeProxy {},
        }
    }
}
