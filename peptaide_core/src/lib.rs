#![forbid(unsafe_code)]

//! Core domain model and dose-estimation logic for Peptaide.
//!
//! This crate provides:
//! - Domain types (distributions, formulations, vials, cycles, events)
//! - Dose text parsing, unit canonicalization and canonical dose
//! - Model snapshots, hash-derived seeds and Monte Carlo simulation
//! - Cycle inference (online and batch) and event recording
//! - File-backed collaborators (reference catalog, event log, cycle ledger)

pub mod types;
pub mod error;
pub mod units;
pub mod dose;
pub mod rng;
pub mod distribution;
pub mod repository;
pub mod snapshot;
pub mod seed;
pub mod simulation;
pub mod cycles;
pub mod recorder;
pub mod import;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod wal;
pub mod state;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use catalog::{build_demo_catalog, ReferenceCatalog};
pub use config::Config;
pub use recorder::{EventRecorder, LogRequest, PreparedEvent, RecordedEvent};
pub use repository::{CycleStore, EventStore, Inventory, MemoryStore, ReferenceData};
pub use snapshot::CanonicalModelSnapshot;
pub use state::CycleLedger;
pub use wal::JsonlEventLog;
