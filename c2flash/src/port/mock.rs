//! In-memory port double for unit tests.
//!
//! Reads and writes are independent: every `write` call records the frame
//! and moves the next queued reply into the receive buffer, which is how the
//! bridge answers one command at a time. An empty receive buffer reads as
//! `TimedOut`, like a serial device with nothing to say.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::Port;
use crate::error::Result;

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub rx: VecDeque<u8>,
    pub replies: VecDeque<Vec<u8>>,
    pub written: Vec<Vec<u8>>,
    pub events: Vec<String>,
    pub closed: bool,
}

/// Inspection handle shared with a [`MockPort`].
#[derive(Debug, Clone, Default)]
pub(crate) struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    /// Bytes already waiting before any command is sent.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes);
    }

    /// Reply delivered after the next write.
    pub fn queue_reply(&self, bytes: &[u8]) {
        self.state().replies.push_back(bytes.to_vec());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Scripted serial port.
pub(crate) struct MockPort {
    handle: MockHandle,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl MockPort {
    pub fn new(baud_rate: u32) -> (Self, MockHandle) {
        Self::with_handle(baud_rate, MockHandle::default())
    }

    pub fn with_handle(baud_rate: u32, handle: MockHandle) -> (Self, MockHandle) {
        // Shows TX/RX traces of failing tests under RUST_LOG=trace
        let _ = env_logger::builder()
            .is_test(true)
            .try_init();
        handle.state().events.push(format!("open {baud_rate}"));
        handle.state().closed = false;
        let port = Self {
            handle: handle.clone(),
            name: "mock".into(),
            timeout: Duration::from_millis(1),
            baud_rate,
        };
        (port, handle)
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.handle.state();
        if state.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        if state.rx.is_empty() {
            drop(state);
            thread::sleep(self.timeout);
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.handle.state();
        if state.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        state.written.push(buf.to_vec());
        if let Some(reply) = state.replies.pop_front() {
            state.rx.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut state = self.handle.state();
        state.rx.clear();
        state.events.push("clear_input".into());
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.handle.state();
        state.rx.clear();
        state.events.push("clear_buffers".into());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.handle.state().events.push(format!("dtr {level}"));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.handle.state().events.push(format!("rts {level}"));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.handle.state();
        if !state.closed {
            state.closed = true;
            let baud = self.baud_rate;
            state.events.push(format!("close {baud}"));
        }
        Ok(())
    }
}
