//! mailforge: a high-throughput, extensible SMTP server platform.
//!
//! The crates compose as: `mailforge-smtp` accepts and runs sessions,
//! `mailforge-spam` scores what they receive, `mailforge-store` persists
//! it, and `mailforge-relay` queues and forwards the rest. This crate owns
//! the configuration surface and wires the pieces into a runnable server.

pub mod config;
pub mod server;

pub use config::Config;
pub use server::{BoundServer, BuildError, Server};
