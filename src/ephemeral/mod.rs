//! Ephemeral payment servers
//!
//! Every `/create` request gets its own SSH listener on a random port with a
//! freshly generated host key. The lifecycle manager owns that listener until
//! it is told to stop or accepting fails.
//!
//! ```text
//! Accepting -> Draining -> Terminating -> Done
//!     \____________________/
//!        (accept failure)
//! ```

pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod listener;
pub mod outcome;
pub mod registry;
pub mod tracker;

use thiserror::Error;

pub use events::ServerEvent;
pub use registry::{ConnectionDescriptor, ProvisionSettings, ServerRegistry, ServerStatus};

/// Failures while standing up a new ephemeral server. None of these leave a
/// partially started server behind.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to generate server key")]
    KeyGeneration,
    #[error("failed to derive server public key: {0}")]
    PublicKey(#[source] russh_keys::Error),
    #[error("failed to listen: {0}")]
    Bind(#[source] std::io::Error),
}
