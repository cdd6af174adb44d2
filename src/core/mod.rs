//! Core module containing the session engine
//!
//! This module provides:
//! - Device registry and port classification
//! - Port discovery with attach/detach diffing
//! - Serial transport and the port seams it is opened through
//! - Sessions with independent read and write loops
//! - Command dispatch with response matching and timeouts
//! - Command macros and favorites
//! - Data pipeline turning lines into metric samples
//! - Scripting engine for automation tasks
//! - Event bus shared by all of the above
//! - Simulated devices for tests and demos

pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod framing;
pub mod macros;
pub mod matcher;
pub mod pipeline;
pub mod registry;
pub mod script;
pub mod session;
pub mod simulator;
pub mod state_machine;
pub mod transport;
pub mod waiters;
