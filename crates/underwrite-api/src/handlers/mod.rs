//! HTTP handlers for underwrite-api.

pub mod borrowers;
pub mod documents;
pub mod health;
