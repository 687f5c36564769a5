//! Connection seam and the worker pool built on top of it.

pub mod connection;
pub(crate) mod worker;
