//! Cinder Core
//!
//! Core domain types, traits, and error handling for Cinder.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: the immutable build graph, the mutable job
//! record, and the ports through which storage and event delivery are reached.

pub mod agent;
pub mod error;
pub mod events;
pub mod graph;
pub mod ids;
pub mod job;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
