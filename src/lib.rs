//! Client-side state synchronization for the certificate console: polled
//! sources folded into a bounded notification feed, optimistic job status
//! reconciled against the backend, and collaboration invitations.

pub mod aggregator;
pub mod backend;
pub mod collaboration;
pub mod config;
pub mod cue;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod model;
pub mod reconciler;
pub mod scheduler;

pub use engine::{EngineOptions, SyncEngine};
pub use error::ActionError;
