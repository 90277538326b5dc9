//! Repository layer for database access.
//!
//! Repositories hide SQL behind async traits so the scheduler and service
//! can be exercised against any store implementation.

pub mod notification;

pub use notification::*;
