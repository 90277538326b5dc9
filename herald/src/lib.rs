//! herald library crate.
//!
//! Durable multi-channel notification delivery: a SQLite-backed record
//! store with an explicit status state machine, a polling queue scheduler
//! with retry, deduplication and crash recovery, and interchangeable
//! queue, inline and broker-relay transports behind one service facade.

pub mod attachments;
pub mod channels;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod service;
pub mod templates;
pub mod transport;

pub use error::{Error, Result};
pub use service::{NotificationService, ServiceDeps, SubmitHandle};
