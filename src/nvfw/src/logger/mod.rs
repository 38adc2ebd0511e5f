// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Firmware logging and metrics collection.

mod logging;
mod metrics;

pub use log::Level::*;
pub use log::{warn, *};
pub use logging::{
    DEFAULT_INSTANCE_ID, DEFAULT_LEVEL, INSTANCE_ID, LOGGER, LogFilter, LogFormat, Logger,
    LoggerConfig, LoggerConfiguration, LoggerInitError, LoggerUpdateError,
};
pub use metrics::{
    BootMetrics, IncMetric, METRICS, Metrics, MetricsError, NvfwMetrics, SharedIncMetric,
    SharedStoreMetric, StoreMetric,
};

/// Alias for `std::io::LineWriter<std::fs::File>`.
pub type FwLineWriter = std::io::LineWriter<std::fs::File>;
