//! rezero: agent-driven security scan engine.
//!
//! A scan runs an autonomous tool-calling model conversation against a
//! target (a codebase snapshot or a live web application), relays every
//! step of the conversation to a durable action store, and always
//! terminates in a structured vulnerability report or an explicit
//! failure. Two harnesses drive the conversation: a synchronous turn
//! loop over a messages API, and a streaming consumer of a session
//! control plane's event feed.

pub mod compiler;
pub mod config;
pub mod error;
pub mod gate;
pub mod harness;
pub mod llm;
pub mod model;
pub mod relay;
pub mod scan;
pub mod session;
pub mod tools;

pub use config::Config;
pub use model::{Finding, Report, ScanSession, ScanStatus, ScanTarget};
pub use scan::ScanRunner;
