// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Platform firmware services for NVDIMM-backed memory: the boot-time
//! save/restore command engine, the Address Range Scrub engine behind the
//! shared descriptor region, and the plumbing both need (logging, metrics,
//! platform configuration, system memory access).
#![deny(missing_docs)]

/// Boot orchestration: probe DIMMs, run the restore/arm sweep, publish the
/// shared descriptor region and attach the scrub engine.
pub mod builder;
/// Hardware devices driven by the firmware.
#[allow(missing_docs)]
pub mod devices;
/// Platform description consumed at boot.
pub mod fw_config;
/// Logging and metrics.
pub mod logger;
/// System physical memory as the firmware sees it.
pub mod mem;
/// Address Range Scrub service.
pub mod scrub;
/// Simulated hardware collaborators used by the demo binary and tests.
#[allow(missing_docs)]
pub mod sim;
/// Misc helpers.
pub mod utils;

use std::sync::{Arc, Mutex};

use event_manager::{EventManager as BaseEventManager, MutEventSubscriber};

/// Shorthand type for the EventManager flavour used by the firmware.
pub type EventManager = BaseEventManager<Arc<Mutex<dyn MutEventSubscriber>>>;
