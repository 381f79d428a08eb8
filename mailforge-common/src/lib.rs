pub mod address;
pub mod envelope;
pub mod events;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod status;

pub use tracing;

/// Broadcast signal used to coordinate shutdown across listeners, sessions
/// and delivery workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
