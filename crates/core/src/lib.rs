//! Shared domain types for metascan.
//!
//! Job requests, entity names and scopes, the aggregated metadata
//! result, and the user notification boundary used by the submission
//! and correlation layers.

pub mod entity;
pub mod error;
pub mod metadata;
pub mod notify;
pub mod types;
