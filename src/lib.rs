pub mod config;
pub mod context;
pub mod location;
pub mod logger;
pub mod signal;

pub use context::gate::CompletionGate;
pub use context::snapshot::ContextSnapshot;
pub use context::{ContextBuilder, ContextError, EventContext, EventError, FlowIdentity, Response};
pub use signal::{Signal, SignalError};
