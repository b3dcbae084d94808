//! Cooperative cancellation for exchanges and flash attempts.
//!
//! A [`CancelToken`] fires when it is cancelled explicitly, when its deadline
//! passes, or when the embedding application reports an interrupt. Nothing
//! is torn down asynchronously: the code doing I/O polls the token between
//! reads and moves to its cancelled state itself.
//!
//! [`CancellablePort`] applies a token to a [`Port`] handed to code we do not
//! control (the bridge flasher), so that an expired deadline surfaces there
//! as a failed read.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::port::Port;

/// Cancellation signal shared between an owner and the code it drives.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that only fires when cancelled or interrupted.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A token that also fires once `timeout` has elapsed from now.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Fire the token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether the deadline (if any) has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether the token has fired for any reason.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.is_expired() || crate::is_interrupted_requested()
    }

    /// Time left until the deadline, `None` for tokens without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err(Error::Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Whether an I/O error is the one [`CancellablePort`] reports on cancellation.
pub fn is_cancelled_io(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::ConnectionAborted
}

/// A port whose reads fail once its token fires.
pub struct CancellablePort<P: Port> {
    inner: P,
    token: CancelToken,
}

impl<P: Port> CancellablePort<P> {
    /// Wrap `inner`, binding it to `token`.
    pub fn new(inner: P, token: CancelToken) -> Self {
        Self { inner, token }
    }

    /// The token bound to this port.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Unwrap the underlying port.
    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: Port> Read for CancellablePort<P> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "read cancelled",
            ));
        }
        self.inner.read(buf)
    }
}

impl<P: Port> Write for CancellablePort<P> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<P: Port> Port for CancellablePort<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.inner.set_baud_rate(baud_rate)
    }

    fn baud_rate(&self) -> u32 {
        self.inner.baud_rate()
    }

    fn clear_input(&mut self) -> Result<()> {
        self.inner.clear_input()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.inner.clear_buffers()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.inner.set_dtr(level)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.inner.set_rts(level)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    #[test]
    fn test_token_fires_on_cancel() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(observer.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_token_fires_on_deadline() {
        let token = CancelToken::with_deadline(Duration::from_millis(5));
        assert!(token.remaining().is_some());
        std::thread::sleep(Duration::from_millis(10));
        assert!(token.is_expired());
        assert!(token.is_cancelled());
        assert_eq!(token.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_cancelled_port_aborts_reads() {
        let (port, handle) = MockPort::new(115200);
        handle.push_rx(&[0x14, 0x10]);
        let token = CancelToken::new();
        let mut port = CancellablePort::new(port, token.clone());

        let mut buf = [0u8; 1];
        assert_eq!(port.read(&mut buf).unwrap(), 1);

        token.cancel();
        let err = port.read(&mut buf).unwrap_err();
        assert!(is_cancelled_io(&err));

        // Writes still go through so the owner can clean up
        port.write_all_bytes(&[0x51, 0x20]).unwrap();
        assert_eq!(handle.written(), vec![vec![0x51, 0x20]]);
    }
}
