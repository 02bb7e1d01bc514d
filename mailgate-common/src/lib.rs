pub mod config;
pub mod error;
pub mod fsm;
pub mod logging;
pub mod observe;
pub mod request;

pub use fsm::FiniteStateMachine;
pub use observe::{Counter, Gauge, Histogram, NoopObserver, Observer, RecordingObserver};
pub use request::{AuthCredential, EmailRequest, Validation};
pub use tracing;

/// Broadcast to every long-running task of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting new work and return.
    Shutdown,
}
