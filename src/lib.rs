pub mod collector;
pub mod config;
pub mod credentials;
pub mod error;
pub mod registry;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod transcoder;
pub mod web;

#[cfg(test)]
mod test_support;

pub use credentials::Credentials;
pub use error::SessionError;
pub use registry::SessionRegistry;
pub use session::{SessionInfo, SessionStatus, StartOutcome};
pub use transcoder::Quality;
