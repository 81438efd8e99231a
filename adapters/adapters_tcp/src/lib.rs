//! Adapters Layer: TCP Socket Handles and Streams
//!
//! Provides blocking TCP/IPv4 networking built on owning socket handles.
//! This crate implements socket operations using Rust's standard library and
//! the `socket2` crate, and reports every failure as a [`NetworkError`].
//!
//! ## Overview
//!
//! The `adapters_tcp` crate provides:
//! - **Handles**: [`Handle`] owns one socket descriptor and closes it on drop
//! - **Socket operations**: create, connect, listen, accept, send, recv, close
//! - **Complete transfers**: `send_all`/`recv_all` resume after partial transfers
//! - **Streams**: [`Stream`] layers buffered `Read`/`BufRead`/`Write` over a handle
//!
//! No framing is imposed: callers define their own message boundaries on top
//! of `send_all`, `recv_all` and `read_alloc`, or read lines from a [`Stream`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use adapters_tcp::{Handle, NetworkError};
//!
//! fn ping(host: &str, port: u16) -> Result<Vec<u8>, NetworkError> {
//!     let mut handle = Handle::create()?;
//!     handle.connect(host, port)?;
//!     handle.send_all(b"ping")?;
//!     handle.read_alloc(4)
//! }
//! ```
//!
//! ## Architecture
//!
//! This crate is part of the adapters layer. It has no dependency on other
//! workspace crates; higher layers build clients and servers on it.

pub mod error;
pub mod handle;
pub mod init;
pub mod stream;
pub mod transfer;

pub use error::{NetworkError, Operation};
pub use handle::{Handle, INVALID_DESCRIPTOR, LISTEN_BACKLOG};
pub use stream::{Stream, STREAM_BUFFER_SIZE};
pub use transfer::Transfer;
