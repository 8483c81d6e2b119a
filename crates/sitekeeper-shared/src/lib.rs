//! Shared types for the SiteKeeper Master Action orchestration engine.
//!
//! This crate holds the pieces every other crate in the workspace needs:
//! the error taxonomy (`error`), layered configuration (`config`), and the
//! Master<->Slave wire message contract (`wire`).

pub mod config;
pub mod error;
pub mod wire;

pub use config::SiteKeeperConfig;
pub use error::{SiteKeeperError, SiteKeeperResult};
