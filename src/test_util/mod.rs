//! Recording implementations of the collaborator traits. They are used for testing the session
//!  machinery itself, and they are exported for testing code that builds on it (e.g. custom
//!  binders or dispatchers).

pub mod binder;
pub mod channel;
pub mod sending;

pub use binder::{RecordingBinder, RecordingRequestContext};
pub use channel::RecordingChannel;
pub use sending::{RecordingFaultHandler, RecordingSendHandler, SentAttempt};
