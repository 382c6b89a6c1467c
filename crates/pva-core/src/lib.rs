//! Shared PV Access runtime pieces.
//!
//! Everything here is used by both the client and the server runtimes:
//! typed configuration, the deterministic-test [`env::Environment`]
//! abstraction, server GUIDs, and the monitor FIFO that backs
//! subscriptions on both ends of a connection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod env;
pub mod guid;
pub mod monitor;

pub use config::{ClientConfig, ServerConfig};
pub use env::{Environment, SystemEnv};
pub use guid::Guid;
pub use monitor::{FifoConfig, FifoError, FifoNotifications, FifoState, FifoStats,
                  MonitorElement, MonitorFifo};
