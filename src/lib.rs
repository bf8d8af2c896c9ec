//! mirrorsync Library
//!
//! This module exposes the mirrorsync components for use in integration
//! tests and as a library.

pub mod config;
pub mod error;
pub mod master;
pub mod protocol;
pub mod slave;
pub mod transport;
pub mod watcher;
pub mod webserver;

// Re-export commonly used types
pub use config::{Config, MonitorPath, Role, WebConfig};
pub use error::SyncError;
pub use master::Master;
pub use protocol::{Op, SyncPacket};
pub use slave::Slave;
pub use transport::{PacketHandler, QuicTransport};
pub use watcher::{FileEvent, FileWatcher};
