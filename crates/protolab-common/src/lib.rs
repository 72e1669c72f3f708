//! Protolab Common - Shared Types and Utilities
//!
//! Foundational types, error handling, and utilities used by the protocol
//! simulation engines and the scenario runner.
//!
//! Key Features:
//! - Unified error type with user/system classification
//! - Configuration structures for every engine, loadable from TOML
//! - Shared enumerations (protocol catalogue, consistency levels)
//! - Hashing and time helpers
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::SimulationConfig;
pub use error::{ProtolabError, Result};
pub use types::*;
