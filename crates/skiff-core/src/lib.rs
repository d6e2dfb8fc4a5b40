//! Skiff core library
//!
//! Host-side state and policy for the Skiff cloud console:
//! - SQLite storage with versioned migrations
//! - AES-GCM vault for plugin instance configuration
//! - Payment provider registry and notify dispatch
//! - Refund valuation and wallet settlement

pub mod billing;
pub mod config;
pub mod error;
pub mod events;
pub mod payment;
pub mod security;
pub mod storage;

pub use error::{Error, Result};
