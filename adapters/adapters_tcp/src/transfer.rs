//! Transfer Module
//!
//! Single-attempt byte transfer and the loops that turn partial transfers into
//! complete ones. A transport may move fewer bytes than requested and still
//! report success; [`send_all`] and [`recv_all`] keep going on the remaining
//! tail until the whole buffer is done. A failed attempt always aborts.

use crate::error::NetworkError;

/// Single-attempt transport operations
///
/// Implementors perform exactly one transport call per method. A return of
/// `Ok(n)` with `n < buf.len()` is a partial transfer, not an error. A
/// transport that moved zero bytes for a non-empty buffer must report
/// [`NetworkError::ConnectionClosed`] instead of `Ok(0)`.
#[cfg_attr(test, mockall::automock)]
pub trait Transfer {
    /// Send up to `buf.len()` bytes, returning how many were sent
    fn send_once(&self, buf: &[u8]) -> Result<usize, NetworkError>;

    /// Receive up to `buf.len()` bytes, returning how many were filled
    fn recv_once(&self, buf: &mut [u8]) -> Result<usize, NetworkError>;
}

/// Send the whole of `buf`
///
/// Blocks until every byte is handed to the transport. An empty buffer
/// returns immediately without touching the transport.
pub fn send_all<T: Transfer + ?Sized>(transport: &T, buf: &[u8]) -> Result<(), NetworkError> {
    let mut off = 0;
    while off != buf.len() {
        off += transport.send_once(&buf[off..])?;
    }
    Ok(())
}

/// Fill the whole of `buf`
///
/// Blocks until exactly `buf.len()` bytes have been received.
pub fn recv_all<T: Transfer + ?Sized>(transport: &T, buf: &mut [u8]) -> Result<(), NetworkError> {
    let mut off = 0;
    while off != buf.len() {
        off += transport.recv_once(&mut buf[off..])?;
    }
    Ok(())
}
