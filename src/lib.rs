//! # livesync - push local edits to a running app
//!
//! Client side of the livesync protocol: an agent inside the application on
//! the device listens on a local abstract socket, adb forwards a TCP port to
//! it, and this crate streams file creates and deletes over that socket,
//! followed by do-sync requests whose completion the agent reports back.
//!
//! ```no_run
//! # async fn run() -> livesync::Result<()> {
//! use livesync::{Config, LiveSync};
//!
//! let engine = LiveSync::new(Config::new("com.example.app", "/work/app"));
//! engine.connect().await?;
//! engine.send_directory("/work/app/src".as_ref()).await?;
//! engine.send_sync(None, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod files;
pub mod operations;
pub mod protocol;
pub mod transfer;
pub mod tunnel;
#[cfg(feature = "watch")]
pub mod watch;

pub use config::{Config, TunnelConfig};
pub use connection::{ConnectionId, ConnectionInfo, ConnectionState, RetryPolicy};
pub use error::{Error, Result};
pub use protocol::{Handshake, OperationId, Report};
pub use transfer::LiveSync;
pub use tunnel::{AdbTunnel, DirectTunnel, ForwardRule, Tunnel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
