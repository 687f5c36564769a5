//! Pluggable policies consulted by the session.

pub mod load_balancing;
pub mod reconnect;
