#![forbid(unsafe_code)]
//! Remote filesystem access over a single stream connection.
//!
//! A [`Client`] issues filesystem and open-file operations (chmod, mkdir,
//! rename, read, write, seek, stat, readdir, ...) which a server executes by
//! delegating to an implementation of [`fs::Filesystem`]. Results and errors
//! travel over a small synchronous binary protocol.
//!
//! # Getting Started
//!
//! On the server side:
//!
//! 1. Implement [`fs::File`] for your open-file type
//! 2. Implement [`fs::Filesystem`] for your filesystem type
//! 3. Start the server with [`srv::srv_async`] or a configured [`srv::Server`]
//!
//! On the client side, [`Client::dial`] the server and call its methods.
//!
//! ```no_run
//! use netfs::{Client, FileMode};
//!
//! #[tokio::main]
//! async fn main() -> netfs::Result<()> {
//!     let client = Client::dial("tcp!127.0.0.1!7070").await?;
//!     client.mkdir("logs", FileMode::from_perm(0o755)).await?;
//!
//!     let file = client.create("logs/today").await?;
//!     file.write_str("hello\n").await?.into_result()?;
//!     file.close().await?;
//!
//!     client.close().await
//! }
//! ```
//!
//! # Protocol Details
//!
//! Every frame starts with a kind byte: `INIT`, `REQUEST` or `RESPONSE`.
//! Both sides open with `INIT` followed by the protocol version and drop the
//! link if the versions differ. Requests and responses then carry an opcode
//! byte and a payload whose fields are written in a fixed order. All
//! integers are big-endian; byte strings, text and lists carry a `u32`
//! length prefix. There is no framing beyond that.
//!
//! Exactly one request is outstanding per connection and responses echo the
//! opcode of the request they answer.
//!
//! ## Fid Management
//!
//! A fid is a connection-scoped `u32` handle the server assigns to every
//! file opened through `create`, `open` or `open_file`.
//!
//! **Important invariants:**
//! - fid 0 never names a file; it is returned when an open fails
//! - fids grow strictly and are never reused within a connection
//! - Using an unknown fid is a protocol violation that ends the connection
//! - Files still open when a connection ends are closed by the server
//!
//! # Error Handling
//!
//! Filesystem errors ([`FsError`]) are values on the wire: the connection
//! stays usable and the client sees them as [`Error::Remote`]. End of file is
//! its own [`FsError::Eof`] rather than text. Stream failures, timeouts and
//! malformed frames end the connection.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!7070"`) or `"host:port"`
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/netfs.sock!0"`)
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod fcall;
pub mod fs;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::client::{Client, RemoteFile};
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::error::{Error, FsError, Partial};
pub use crate::fcall::*;
pub use crate::utils::Result;
