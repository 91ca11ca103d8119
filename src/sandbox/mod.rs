//! Ephemeral compute sandboxes.
//!
//! [`SandboxProvider`] abstracts the remote platform; [`SandboxSession`]
//! owns the lifecycle of one sandbox on top of it.

mod http;
mod memory;
mod provider;
mod session;

pub use http::HttpSandboxProvider;
pub use memory::MemorySandboxProvider;
pub use provider::{CommandOutput, ProvisionRequest, RemoteStatus, SandboxInfo, SandboxProvider};
pub use session::{SandboxSession, SandboxStatus, SessionSnapshot, WriteReport};
