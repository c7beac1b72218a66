//! Graceful shutdown handling.

pub mod coordinator;

pub use coordinator::{shutdown_signal, ShutdownCoordinator};
