//! Cluster topology: hosts, the host registry and the control connection
//! seam.

pub mod control;
pub mod host;
pub mod resolve;

pub use control::{ControlConnection, ControlHandle};
pub use host::{Host, HostRegistry, HostState};
pub use resolve::KnownNode;
