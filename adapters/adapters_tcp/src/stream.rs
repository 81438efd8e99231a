//! Stream Module
//!
//! Presents a connected [`Handle`] as a buffered, bidirectional byte stream.
//! [`Stream`] implements [`Read`], [`BufRead`] and [`Write`], so line-based
//! helpers such as `read_line` work directly on a socket.
//!
//! Teardown order is fixed: pending output is flushed and the buffers are
//! released first, then the handle is shut down, then its descriptor closed.

use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::mem;

use crate::error::NetworkError;
use crate::handle::Handle;

/// Default size of both the input and output buffer
pub const STREAM_BUFFER_SIZE: usize = 8 * 1024;

/// Buffering adapter between the stream surface and the handle
#[derive(Default)]
struct Buffer {
    input: Box<[u8]>,
    pos: usize,
    filled: usize,
    output: Vec<u8>,
}

impl Buffer {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            input: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            filled: 0,
            output: Vec::with_capacity(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.input.len()
    }

    fn is_drained(&self) -> bool {
        self.pos >= self.filled
    }
}

/// Buffered bidirectional stream over an owned [`Handle`]
///
/// Writes are buffered until the output buffer fills, [`Write::flush`] is
/// called, a read has to go to the socket, or the stream is dropped. Reads
/// come from the input buffer and refill it with a single receive when it
/// runs dry; pending output is flushed before that receive, so a request
/// written to the stream always reaches the peer before the reply is awaited.
///
/// End of stream is reported through `Read` as `Ok(0)` and additionally
/// recorded, so a later [`Stream::check_connection`] reports it.
pub struct Stream {
    handle: Handle,
    buffer: Buffer,
    failure: Option<NetworkError>,
}

impl Stream {
    /// Take ownership of `handle` with buffers of [`STREAM_BUFFER_SIZE`]
    pub fn new(handle: Handle) -> Self {
        Self::with_capacity(STREAM_BUFFER_SIZE, handle)
    }

    /// Take ownership of `handle` with buffers of `capacity` bytes
    ///
    /// # Arguments
    ///
    /// * `capacity` - Size of the input and of the output buffer; at least 1
    /// * `handle` - Connected handle the stream takes over
    pub fn with_capacity(capacity: usize, handle: Handle) -> Self {
        tracing::debug!(fd = handle.descriptor(), capacity, "stream opened");
        Self {
            handle,
            buffer: Buffer::with_capacity(capacity),
            failure: None,
        }
    }

    /// Report the failure state of the stream
    ///
    /// Returns the last error seen by the buffering layer: a failed
    /// receive, send or flush, or [`NetworkError::ConnectionClosed`] once a
    /// read reached end of stream. This is best effort; a failure the
    /// stream has not run into yet is not detected.
    pub fn check_connection(&self) -> Result<(), NetworkError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// The owned handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Flush pending output and give the handle back
    ///
    /// Buffered input that was not read yet is discarded.
    ///
    /// # Returns
    ///
    /// * `Ok(Handle)` - The connected handle, still open
    /// * `Err(NetworkError)` - Flushing failed; the stream was torn down
    pub fn into_handle(mut self) -> Result<Handle, NetworkError> {
        self.flush_output()?;
        // The sentinel left behind makes the stream's own teardown a no-op.
        Ok(mem::take(&mut self.handle))
    }

    fn record<T>(&mut self, result: Result<T, NetworkError>) -> Result<T, NetworkError> {
        if let Err(err) = &result {
            self.failure = Some(err.clone());
        }
        result
    }

    fn flush_output(&mut self) -> Result<(), NetworkError> {
        if self.buffer.output.is_empty() {
            return Ok(());
        }
        let result = self.handle.send_all(&self.buffer.output);
        // Unsent bytes are dropped once a flush fails; the stream is failed.
        self.buffer.output.clear();
        self.record(result)
    }

    fn receive(&mut self, direct: Option<&mut [u8]>) -> io::Result<usize> {
        let result = match direct {
            Some(out) => self.handle.recv_once(out),
            None => self.handle.recv_once(&mut self.buffer.input),
        };
        match self.record(result) {
            Ok(n) => Ok(n),
            Err(NetworkError::ConnectionClosed { .. }) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        // Large reads with nothing buffered skip the copy.
        if self.buffer.is_drained() && out.len() >= self.buffer.capacity() {
            self.flush_output()?;
            return self.receive(Some(out));
        }
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for Stream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buffer.is_drained() {
            self.flush_output()?;
            let n = self.receive(None)?;
            self.buffer.pos = 0;
            self.buffer.filled = n;
        }
        Ok(&self.buffer.input[self.buffer.pos..self.buffer.filled])
    }

    fn consume(&mut self, amt: usize) {
        self.buffer.pos = (self.buffer.pos + amt).min(self.buffer.filled);
    }
}

impl Write for Stream {
    /// Buffer `data`, or send it directly when it fills the buffer on its own
    ///
    /// A direct send that fails part way returns the count that did go out;
    /// the failure is recorded for [`Stream::check_connection`] and the next
    /// write reports it.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buffer.output.len() + data.len() > self.buffer.capacity() {
            self.flush_output()?;
        }
        if data.len() < self.buffer.capacity() {
            self.buffer.output.extend_from_slice(data);
            return Ok(data.len());
        }

        let mut sent = 0;
        while sent < data.len() {
            match self.handle.send_once(&data[sent..]) {
                Ok(n) => sent += n,
                Err(err) => {
                    self.failure = Some(err.clone());
                    if sent == 0 {
                        return Err(err.into());
                    }
                    break;
                }
            }
        }
        Ok(sent)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_output().map_err(io::Error::from)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.flush_output() {
            tracing::warn!(fd = self.handle.descriptor(), error = %err, "dropping unflushed stream output");
        }
        // Release the buffering layer before the descriptor is shut down.
        drop(mem::take(&mut self.buffer));
        self.handle.close();
        tracing::debug!(fd = self.handle.descriptor(), "stream closed");
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("buffered_input", &(self.buffer.filled - self.buffer.pos))
            .field("pending_output", &self.buffer.output.len())
            .field("failure", &self.failure)
            .finish()
    }
}

impl From<Handle> for Stream {
    fn from(handle: Handle) -> Self {
        Stream::new(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Operation;
    use std::thread;
    use std::time::Duration;

    fn connected_pair() -> (Handle, Handle) {
        let mut listener = Handle::create().unwrap();
        listener.listen(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = Handle::create().unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let server = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_stream_reads_lines() {
        let (client, server) = connected_pair();
        client.send_all(b"first\nsecond\n").unwrap();
        drop(client);

        let mut stream = Stream::new(server);
        let mut line = String::new();
        stream.read_line(&mut line).unwrap();
        assert_eq!(line, "first\n");
        assert!(stream.check_connection().is_ok());

        line.clear();
        stream.read_line(&mut line).unwrap();
        assert_eq!(line, "second\n");

        line.clear();
        assert_eq!(stream.read_line(&mut line).unwrap(), 0);
        assert_eq!(
            stream.check_connection(),
            Err(NetworkError::ConnectionClosed { op: Operation::Recv })
        );
    }

    #[test]
    fn test_stream_buffers_writes_until_flush() {
        let (client, server) = connected_pair();
        let mut stream = Stream::new(client);

        stream.write_all(b"buffered").unwrap();
        assert!(format!("{:?}", stream).contains("pending_output: 8"));

        stream.flush().unwrap();
        assert_eq!(server.read_alloc(8).unwrap(), b"buffered");
        assert!(stream.check_connection().is_ok());
    }

    #[test]
    fn test_stream_flushes_when_buffer_fills() {
        let (client, server) = connected_pair();
        let mut stream = Stream::with_capacity(4, client);

        stream.write_all(b"ab").unwrap();
        stream.write_all(b"cde").unwrap();
        // "ab" had to go out to make room for "cde".
        assert_eq!(server.read_alloc(2).unwrap(), b"ab");

        stream.write_all(b"0123456789").unwrap();
        assert_eq!(server.read_alloc(13).unwrap(), b"cde0123456789");
    }

    /// Client side whose receives give up instead of hanging the test
    fn with_read_timeout(handle: Handle) -> Handle {
        let socket = handle.into_socket().unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Handle::from(socket)
    }

    fn echo(server: Handle, len: usize) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let request = server.read_alloc(len).unwrap();
            server.send_all(&request).unwrap();
        })
    }

    #[test]
    fn test_stream_read_flushes_pending_output() {
        let (client, server) = connected_pair();
        let peer = echo(server, 5);

        let mut stream = Stream::new(with_read_timeout(client));
        stream.write_all(b"ping\n").unwrap();

        let mut line = String::new();
        stream.read_line(&mut line).unwrap();
        assert_eq!(line, "ping\n");
        assert!(stream.check_connection().is_ok());
        peer.join().unwrap();
    }

    #[test]
    fn test_stream_large_read_flushes_pending_output() {
        let (client, server) = connected_pair();
        let peer = echo(server, 4);

        let mut stream = Stream::with_capacity(16, with_read_timeout(client));
        stream.write_all(b"ping").unwrap();

        let mut buf = [0u8; 64];
        let mut received = 0;
        while received < 4 {
            received += stream.read(&mut buf[received..]).unwrap();
        }
        assert_eq!(&buf[..4], b"ping");
        peer.join().unwrap();
    }

    #[test]
    fn test_stream_large_write_reports_partial_send() {
        let (client, server) = connected_pair();
        drop(server);
        let mut stream = Stream::with_capacity(8, client);

        // The departed peer answers the first segment with a reset, which
        // interrupts the send after part of the payload was taken.
        let payload = vec![0u8; 16 * 1024 * 1024];
        let written = stream.write(&payload).unwrap();
        assert!(written > 0 && written < payload.len());

        let err = stream.check_connection().unwrap_err();
        assert_eq!(err.operation(), Some(Operation::Send));
        assert!(stream.write(&payload[written..]).is_err());
    }

    #[test]
    fn test_stream_drop_flushes_then_shuts_down() {
        let (client, server) = connected_pair();
        let mut stream = Stream::new(client);
        stream.write_all(b"last words").unwrap();
        drop(stream);

        assert_eq!(server.read_alloc(10).unwrap(), b"last words");
        let mut buf = [0u8; 1];
        assert!(server.recv_once(&mut buf).unwrap_err().is_connection_closed());
    }

    #[test]
    fn test_stream_large_read_bypasses_buffer() {
        let (client, server) = connected_pair();
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 239) as u8).collect();

        thread::scope(|scope| {
            scope.spawn(|| {
                client.send_all(&payload).unwrap();
                client.close();
            });

            let mut stream = Stream::with_capacity(16, server);
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            assert_eq!(received, payload);
        });
    }

    #[test]
    fn test_stream_records_send_failure() {
        let (client, server) = connected_pair();
        drop(server);
        let mut stream = Stream::with_capacity(8, client);

        let chunk = [0u8; 64];
        let mut failed = false;
        for _ in 0..1000 {
            if stream.write_all(&chunk).is_err() {
                failed = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(failed);

        let err = stream.check_connection().unwrap_err();
        assert_eq!(err.operation(), Some(Operation::Send));
        assert!(err.os_code().is_some());
    }

    #[test]
    fn test_into_handle_flushes_and_keeps_connection() {
        let (client, server) = connected_pair();
        let mut stream = Stream::new(client);
        stream.write_all(b"before").unwrap();

        let handle = stream.into_handle().unwrap();
        assert!(handle.is_valid());
        handle.send_all(b"after").unwrap();
        assert_eq!(server.read_alloc(11).unwrap(), b"beforeafter");
    }

    #[test]
    fn test_stream_moves_with_its_handle() {
        let (client, server) = connected_pair();
        let fd = client.descriptor();
        let stream = Stream::from(client);

        let mut moved = thread::spawn(move || stream).join().unwrap();
        assert_eq!(moved.handle().descriptor(), fd);

        moved.write_all(b"moved").unwrap();
        moved.flush().unwrap();
        assert_eq!(server.read_alloc(5).unwrap(), b"moved");
    }
}
