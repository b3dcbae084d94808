//! Request/response transport over a bridge connection.
//!
//! Exactly one exchange is in flight at a time: a command is written in
//! full, then bytes are accumulated until the expected length arrives or the
//! exchange's [`CancelToken`] fires. A fired token releases the reader and a
//! fresh one is installed before the next exchange, so the connection is
//! always reusable afterwards.
//!
//! The transport never fails an exchange. It reports what it received and
//! whether the exchange completed; turning a short reply into an error is the
//! protocol layer's job.

use std::io::ErrorKind;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::port::Port;

/// Upper bound for a single blocking read, so tokens are polled regularly.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// State of the read side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// A reader is installed and owns the receive cursor.
    Active,
    /// The reader was released (cancelled exchange or closed connection).
    Released,
}

/// How an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The expected number of bytes arrived.
    Complete,
    /// The token fired first; the reply may be short or empty.
    Cancelled,
}

/// Bytes accumulated by one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Received bytes, at most the expected length.
    pub bytes: Vec<u8>,
    /// How the exchange ended.
    pub outcome: ExchangeOutcome,
}

impl Response {
    /// First byte of the reply, the acknowledgement code.
    pub fn status(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Number of bytes received.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Transport owning a bridge connection.
pub struct Transport<P: Port> {
    port: P,
    reader: ReaderState,
    writer_open: bool,
}

impl<P: Port> Transport<P> {
    /// Take ownership of an open port.
    pub fn new(mut port: P) -> Self {
        if port.timeout() > POLL_INTERVAL {
            if let Err(e) = port.set_timeout(POLL_INTERVAL) {
                warn!("Could not shorten read timeout on {}: {e}", port.name());
            }
        }
        Self {
            port,
            reader: ReaderState::Active,
            writer_open: true,
        }
    }

    /// Current reader state.
    pub fn reader_state(&self) -> ReaderState {
        self.reader
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Discard reader state and buffered bytes, starting a fresh cursor.
    ///
    /// Call once before the first exchange: the bridge prints noise while
    /// it boots.
    pub fn clear_buffer(&mut self) -> Result<()> {
        self.reader = ReaderState::Released;
        self.reacquire_reader()
    }

    /// Send `command` and collect up to `expected_len` reply bytes within `timeout`.
    pub fn write_and_wait(&mut self, command: &[u8], expected_len: usize, timeout: Duration) -> Response {
        self.exchange(command, expected_len, &CancelToken::with_deadline(timeout))
    }

    /// Like [`Transport::write_and_wait`], bounded by a caller-supplied token.
    pub fn exchange(&mut self, command: &[u8], expected_len: usize, token: &CancelToken) -> Response {
        let mut bytes = Vec::with_capacity(expected_len);

        if !self.writer_open {
            warn!("Exchange on closed connection");
            return Response {
                bytes,
                outcome: ExchangeOutcome::Cancelled,
            };
        }
        if self.reader == ReaderState::Released {
            if let Err(e) = self.reacquire_reader() {
                warn!("Reader reacquisition failed: {e}");
            }
        }

        trace!("TX {command:02X?}");
        if let Err(e) = self.port.write_all_bytes(command) {
            warn!("Write failed: {e}");
            self.release_reader();
            return Response {
                bytes,
                outcome: ExchangeOutcome::Cancelled,
            };
        }

        let mut buf = [0u8; 256];
        while bytes.len() < expected_len {
            if token.is_cancelled() {
                debug!(
                    "Exchange timed out with {}/{} bytes",
                    bytes.len(),
                    expected_len
                );
                self.release_reader();
                break;
            }
            let want = (expected_len - bytes.len()).min(buf.len());
            match self.port.read(&mut buf[..want]) {
                Ok(n) => bytes.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {},
                Err(e) => {
                    warn!("Read failed: {e}");
                    self.release_reader();
                    break;
                },
            }
        }
        trace!("RX {bytes:02X?}");

        let outcome = if self.reader == ReaderState::Released {
            // Install a fresh reader right away so the next exchange starts clean
            if let Err(e) = self.reacquire_reader() {
                warn!("Reader reacquisition failed: {e}");
            }
            ExchangeOutcome::Cancelled
        } else {
            ExchangeOutcome::Complete
        };

        Response { bytes, outcome }
    }

    /// Release reader and writer and close the connection.
    ///
    /// Safe to call after a cancelled exchange or a previous close.
    pub fn close(&mut self) -> Result<()> {
        self.reader = ReaderState::Released;
        self.writer_open = false;
        self.port.close()
    }

    /// Consume the transport and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    fn release_reader(&mut self) {
        self.reader = ReaderState::Released;
    }

    fn reacquire_reader(&mut self) -> Result<()> {
        // Late bytes of the abandoned reply belong to the old reader
        self.port.clear_input()?;
        self.reader = ReaderState::Active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    const SHORT: Duration = Duration::from_millis(30);

    #[test]
    fn test_clear_buffer_discards_boot_noise() {
        let (port, handle) = MockPort::new(1_000_000);
        handle.push_rx(b"boot noise");
        let mut transport = Transport::new(port);

        transport.clear_buffer().unwrap();
        handle.queue_reply(&[0x8F]);

        let response = transport.write_and_wait(&[0x0F, 0x00], 1, SHORT);
        assert_eq!(response.bytes, vec![0x8F]);
        assert_eq!(response.outcome, ExchangeOutcome::Complete);
    }

    #[test]
    fn test_full_reply_is_truncated_to_expected_length() {
        let (port, handle) = MockPort::new(1_000_000);
        let mut transport = Transport::new(port);
        handle.queue_reply(&[0x88, 0x01, 0x02, 0x00, 0xAA, 0xBB]);

        let response = transport.write_and_wait(&[0x08, 0x00], 4, SHORT);
        assert_eq!(response.bytes, vec![0x88, 0x01, 0x02, 0x00]);
        assert_eq!(response.outcome, ExchangeOutcome::Complete);
        assert_eq!(transport.reader_state(), ReaderState::Active);
    }

    #[test]
    fn test_short_reply_times_out_and_reacquires_reader() {
        let (port, handle) = MockPort::new(1_000_000);
        let mut transport = Transport::new(port);
        handle.queue_reply(&[0x85, 0x01]);

        let response = transport.write_and_wait(&[0x05, 0x05, 0x04, 0, 0, 0, 0], 5, SHORT);
        assert_eq!(response.bytes, vec![0x85, 0x01]);
        assert_eq!(response.outcome, ExchangeOutcome::Cancelled);
        assert_eq!(transport.reader_state(), ReaderState::Active);
        assert!(handle.events().contains(&"clear_input".to_string()));

        // The connection is usable again
        handle.queue_reply(&[0x8F]);
        let response = transport.write_and_wait(&[0x0F, 0x00], 1, SHORT);
        assert_eq!(response.bytes, vec![0x8F]);
    }

    #[test]
    fn test_silence_returns_empty_response() {
        let (port, _handle) = MockPort::new(1_000_000);
        let mut transport = Transport::new(port);

        let response = transport.write_and_wait(&[0x0F, 0x00], 1, SHORT);
        assert!(response.is_empty());
        assert_eq!(response.status(), None);
        assert_eq!(response.outcome, ExchangeOutcome::Cancelled);
    }

    #[test]
    fn test_command_written_in_full() {
        let (port, handle) = MockPort::new(1_000_000);
        let mut transport = Transport::new(port);
        handle.queue_reply(&[0x83]);

        let command = [0x03, 0x07, 0x02, 0x00, 0x12, 0x34, 0x48, 0x01, 0x01];
        transport.write_and_wait(&command, 1, SHORT);
        assert_eq!(handle.written(), vec![command.to_vec()]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (port, handle) = MockPort::new(1_000_000);
        let mut transport = Transport::new(port);

        // Leave the reader released by a timed-out exchange first
        transport.write_and_wait(&[0x0F, 0x00], 1, Duration::from_millis(5));
        transport.close().unwrap();
        transport.close().unwrap();
        assert!(handle.is_closed());
        assert_eq!(transport.reader_state(), ReaderState::Released);

        let response = transport.write_and_wait(&[0x0F, 0x00], 1, SHORT);
        assert!(response.is_empty());
    }
}
