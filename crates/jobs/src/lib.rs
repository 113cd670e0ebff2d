//! Job submission, tracking and result correlation for metascan.
//!
//! - [`api`] -- the [`JobService`](api::JobService) seam and its HTTP client.
//! - [`tracker`] -- the set of job ids a session awaits.
//! - [`submitter`] -- submit and track.
//! - [`correlator`] -- match completion events to tracked jobs and merge results.
//! - [`config`] -- environment configuration.
//! - [`session`] -- the context object tying it all together.

pub mod api;
pub mod config;
pub mod correlator;
pub mod session;
pub mod submitter;
pub mod tracker;

pub use config::{ConfigError, SessionConfig};
pub use session::MetadataSession;
