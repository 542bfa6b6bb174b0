//! # troupe-core
//!
//! Core types for the Troupe agent coordination runtime.
//!
//! Troupe drives a small cast of autonomous agents (a Coder, an Architect, a
//! Product-Manager) from a story to merged code. Every agent owns a finite
//! state machine; a central dispatcher routes typed messages between them.
//!
//! ## What lives here
//!
//! - Agent identity and agent kinds
//! - The immutable message envelope and its typed request payloads
//! - The shared three-way review decision
//! - State-change notifications
//! - The unified error type and configuration

#![allow(dead_code)]

pub mod config;
mod error;
pub mod fail_open;
mod message;
mod types;

pub use config::{
    AgentsConfig, DispatcherConfig, LoggingConfig, ModelLimits, TroupeConfig,
};
pub use error::{with_deadline, Result, TroupeError};
pub use message::*;
pub use types::*;
