//! raidline: command engine for RAID host-bus adapters.
//!
//! One [`Adapter`] owns a fixed pool of command blocks, a submission and
//! completion transport, an interrupt dispatcher and a controller thread
//! that drives reset, bring-up and shutdown through an explicit state
//! machine. A heartbeat watchdog turns silent firmware lockups into
//! resets, and a reconciler keeps the device table in step with what the
//! firmware reports.
//!
//! Hardware is reached only through the [`Hardware`] trait. The [`sim`]
//! module provides an in-process adapter model.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use raidline::sim::{SimAdapter, SimConfig};
//! use raidline::{Adapter, AdapterId, Config, DeviceInfo, Operation, UnitHandle, UnitHost};
//! use protocol_ciss::LunAddress;
//!
//! struct Host;
//!
//! impl UnitHost for Host {
//!     fn attach(&self, _adapter: AdapterId, device: &DeviceInfo) -> Option<UnitHandle> {
//!         Some(UnitHandle(device.slot as u64))
//!     }
//!     fn changed(&self, _unit: UnitHandle, _device: &DeviceInfo) {}
//!     fn detach(&self, _unit: UnitHandle) {}
//! }
//!
//! fn main() -> Result<(), raidline::Error> {
//!     let sim = SimAdapter::new(SimConfig::default());
//!     let adapter = Adapter::new(AdapterId(0), sim, Config::default(), Arc::new(Host))?;
//!     adapter.start()?;
//!
//!     // TEST UNIT READY
//!     let op = Operation::new(LunAddress::logical(0), &[0x00]);
//!     adapter
//!         .submit(op, |completion| println!("done: {:?}", completion.status))
//!         .ok();
//!
//!     adapter.shutdown()?;
//!     Ok(())
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod adapter;
pub(crate) mod controller;
pub(crate) mod interrupt;
pub(crate) mod metrics;
pub(crate) mod ring;
pub(crate) mod timeout;
pub(crate) mod transport;

// ── Public modules ──────────────────────────────────────────────────────
pub mod command;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hw;
pub mod pool;
pub mod reconcile;
pub mod registry;
pub mod sim;
pub mod state;
pub mod watchdog;

// ── Re-exports: adapter ─────────────────────────────────────────────────

/// A running adapter.
pub use adapter::Adapter;
/// Registry-assigned adapter number.
pub use adapter::AdapterId;
/// Lowest-free-id adapter registry.
pub use registry::AdapterRegistry;

// ── Re-exports: configuration and errors ────────────────────────────────

pub use config::{Config, ConfigBuilder};
pub use error::{Error, SubmitError};

// ── Re-exports: commands ────────────────────────────────────────────────

/// Completion delivered to a submit callback.
pub use command::Completion;
/// A SCSI operation to submit.
pub use command::Operation;

// ── Re-exports: lifecycle ───────────────────────────────────────────────

pub use state::{ControllerState, Event, IllegalTransition, ResetReason, transition};

// ── Re-exports: hardware seam ───────────────────────────────────────────

pub use hw::{Hardware, HostMemory, InterruptLine};
/// How interrupts are delivered.
pub use interrupt::InterruptMode;
/// Whether an interrupt belonged to the adapter.
pub use interrupt::IrqReturn;
/// Negotiated submission/completion transport.
pub use transport::TransportMode;
/// Fetch-bucket table for performant submissions.
pub use fetch::BucketTable;

// ── Re-exports: devices ─────────────────────────────────────────────────

pub use reconcile::{
    DeviceAttributes, DeviceKind, DeviceInfo, PendingChange, ReconcileReport, UnitHandle, UnitHost,
};

// ── Re-exports: metrics ─────────────────────────────────────────────────

/// Point-in-time copy of one adapter's counters.
pub use metrics::StatsSnapshot;
