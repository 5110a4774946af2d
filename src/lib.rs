//! Blood donation fulfillment and appointment capacity engine.
//!
//! Demands for blood are matched against stock or fulfilled through a
//! donor's donation; donors book appointments against per-slot capacity.
//! `DonationService` wires the engines together over one in-memory store.

pub mod appointment;
pub mod capacity;
pub mod compatibility;
pub mod config;
pub mod directory;
pub mod error;
pub mod inventory;
pub mod models;
pub mod notify;
pub mod review;
pub mod service;
pub mod store;
pub mod workflow;

pub use appointment::{AppointmentRequestEngine, StaffDecision};
pub use capacity::{AdjustOutcome, AppointmentCapacityLedger};
pub use config::{load_config, EngineConfig};
pub use error::{FulfillmentError, Result};
pub use inventory::InventoryAllocator;
pub use service::DonationService;
pub use workflow::WorkflowEngine;
