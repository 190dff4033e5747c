//! # underwrite-core
//!
//! Core types, traits, and abstractions for the loan-document extraction
//! pipeline.
//!
//! This crate provides the domain model, the document status state machine,
//! the error taxonomy and the collaborator traits that the other underwrite
//! crates depend on.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod status;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{ExtractionConfig, MatchConfig, QueueConfig};
pub use error::{Error, ExtractionFailure, OracleError, PartialExtractionWarning, Result};
pub use models::*;
pub use status::{DocumentStatus, StatusEvent};
pub use traits::*;
