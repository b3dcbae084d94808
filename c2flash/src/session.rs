//! Programming session: connect, identify, read, erase and write a target.
//!
//! [`Programmer`] drives a [`C2Client`]; everything the operator sees
//! (device info, memory chunks, accumulated errors) lives in a [`Session`]
//! that the caller owns and passes to each operation.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::hex::{HexImage, dump_chunks};
use crate::port::{PROTOCOL_BAUD, Port};
use crate::protocol::c2::{C2Client, C2Command, DEFAULT_TIMEOUT, DeviceInfo};

/// Default first address of a memory read.
pub const DEFAULT_READ_START: u32 = 0x0000;

/// Default end (exclusive) of a memory read.
pub const DEFAULT_READ_SIZE: u32 = 0x37FF;

/// Default bytes per read request.
pub const DEFAULT_READ_CHUNK: usize = 0x10;

/// Delay after opening the port; the bridge reboots when the port opens.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(2000);

/// Protocol connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Baud rate of the bridge protocol.
    pub baud_rate: u32,
    /// Reply timeout of one exchange.
    pub timeout: Duration,
    /// Wait after opening the port before the first exchange.
    pub settle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            baud_rate: PROTOCOL_BAUD,
            timeout: DEFAULT_TIMEOUT,
            settle: DEFAULT_SETTLE,
        }
    }
}

/// Bytes read from one address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryChunk {
    /// 24-bit start address.
    pub address: u32,
    /// Bytes read.
    pub data: Vec<u8>,
}

/// Range and granularity of a memory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPlan {
    /// First address.
    pub start: u32,
    /// End address (exclusive) of the loop; the last chunk may run past it.
    pub size: u32,
    /// Bytes per request.
    pub chunk: usize,
}

impl Default for ReadPlan {
    fn default() -> Self {
        Self {
            start: DEFAULT_READ_START,
            size: DEFAULT_READ_SIZE,
            chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl ReadPlan {
    /// Start address of every chunk, in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = u32> {
        // A zero step would never advance
        let step = self.chunk.max(1);
        (self.start..self.size).step_by(step)
    }

    /// Number of read requests the plan issues.
    pub fn chunk_count(&self) -> usize {
        self.addresses().count()
    }

    /// Check every request against the wire limits before anything is sent.
    pub fn validate(&self) -> Result<()> {
        if self.start >= self.size {
            return Err(Error::Config(format!(
                "empty read range 0x{:X}..0x{:X}",
                self.start, self.size
            )));
        }
        let last = self.addresses().last().unwrap_or(self.start);
        C2Command::read(self.start, self.chunk)?;
        C2Command::read(last, self.chunk)?;
        Ok(())
    }
}

/// What the operator sees of the current target.
#[derive(Debug, Default)]
pub struct Session {
    device_info: Option<DeviceInfo>,
    chunks: VecDeque<MemoryChunk>,
    errors: VecDeque<Error>,
}

impl Session {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Device info from the last successful INFO exchange.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info
    }

    /// Record the target's identification.
    pub fn set_device_info(&mut self, info: Option<DeviceInfo>) {
        self.device_info = info;
    }

    /// Chunks read so far, newest first.
    pub fn chunks(&self) -> impl Iterator<Item = &MemoryChunk> {
        self.chunks.iter()
    }

    /// Chunks read so far, ascending by address.
    pub fn sorted_chunks(&self) -> Vec<&MemoryChunk> {
        let mut sorted: Vec<_> = self.chunks.iter().collect();
        sorted.sort_by_key(|c| c.address);
        sorted
    }

    /// Prepend a chunk.
    pub fn push_chunk(&mut self, chunk: MemoryChunk) {
        self.chunks.push_front(chunk);
    }

    /// Forget all chunks.
    pub fn clear_chunks(&mut self) {
        self.chunks.clear();
    }

    /// Errors of the last operation, most recent first.
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.errors.iter()
    }

    /// Number of recorded errors.
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Prepend an error.
    pub fn push_error(&mut self, error: Error) {
        self.errors.push_front(error);
    }

    /// Forget all errors.
    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    /// Reads failed although the target identified itself: the lock byte is
    /// probably set.
    pub fn lock_suspected(&self) -> bool {
        self.device_info
            .is_some_and(|info| info.is_initialized())
            && !self.errors.is_empty()
    }

    /// Chunks as memory-dump text, newest first or sorted by address.
    pub fn dump(&self, sorted: bool) -> String {
        if sorted {
            dump_chunks(
                self.sorted_chunks()
                    .into_iter()
                    .map(|c| (c.address, c.data.as_slice())),
            )
        } else {
            dump_chunks(
                self.chunks
                    .iter()
                    .map(|c| (c.address, c.data.as_slice())),
            )
        }
    }
}

/// Outcome of a memory read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadReport {
    /// Chunks read successfully.
    pub read: usize,
    /// Chunks whose request failed.
    pub failed: usize,
}

/// Outcome of writing an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Records written successfully.
    pub written: usize,
    /// Records with payload in the image.
    pub total: usize,
    /// Records whose write failed.
    pub failed: usize,
}

/// Progress callback: `(done, total)`.
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, usize);

fn check_interrupted() -> Result<()> {
    if crate::is_interrupted_requested() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// High-level programming operations over a connected bridge.
pub struct Programmer<P: Port> {
    client: C2Client<P>,
}

impl<P: Port> Programmer<P> {
    /// Take an open port, let the bridge settle and check for its firmware.
    ///
    /// Fails with [`Error::InterfaceNotDetected`] if the bridge does not
    /// answer PING; the port is closed in that case.
    pub fn connect(port: P, config: &ClientConfig) -> Result<Self> {
        let name = port.name().to_string();
        if !config.settle.is_zero() {
            debug!("Waiting {:?} for the bridge to boot", config.settle);
            thread::sleep(config.settle);
        }

        let mut client = C2Client::with_timeout(port, config.timeout);
        client.clear_buffer()?;
        if !client.ping() {
            warn!("No C2 bridge firmware answering on {name}");
            if let Err(e) = client.close() {
                debug!("Close after failed ping: {e}");
            }
            return Err(Error::InterfaceNotDetected(name));
        }

        info!("C2 interface detected on {name}");
        Ok(Self { client })
    }

    /// Get a mutable reference to the protocol client.
    pub fn client(&mut self) -> &mut C2Client<P> {
        &mut self.client
    }

    /// Initialize the C2 interface and identify the target.
    ///
    /// Returns `Ok(None)` if INFO failed after a successful INIT; an INFO of
    /// 0xFF/0xFF is reported as [`Error::InitializationFailed`].
    pub fn initialize_target(&mut self, session: &mut Session) -> Result<Option<DeviceInfo>> {
        self.client.clear_buffer()?;
        self.client
            .initialize()
            .map_err(|e| Error::InitializationFailed(e.to_string()))?;

        match self.client.get_info() {
            Ok(info) => {
                session.set_device_info(Some(info));
                if !info.is_initialized() {
                    return Err(Error::InitializationFailed(
                        "target answered 0xFF/0xFF".into(),
                    ));
                }
                info!("{info}");
                Ok(Some(info))
            },
            Err(e) => {
                warn!("Failed fetching device info: {e}");
                session.set_device_info(None);
                Ok(None)
            },
        }
    }

    /// Read memory chunk by chunk into `session`.
    ///
    /// A failed chunk is recorded in the session and the loop continues.
    pub fn read_memory(
        &mut self,
        session: &mut Session,
        plan: &ReadPlan,
        progress: ProgressFn<'_>,
    ) -> Result<ReadReport> {
        plan.validate()?;
        session.clear_errors();
        session.clear_chunks();

        let total = plan.chunk_count();
        let mut report = ReadReport::default();
        for (index, address) in plan.addresses().enumerate() {
            check_interrupted()?;
            match self.client.read(address, plan.chunk) {
                Ok(data) => {
                    session.push_chunk(MemoryChunk { address, data });
                    report.read += 1;
                },
                Err(e) => {
                    debug!("{e}");
                    session.push_error(e);
                    report.failed += 1;
                },
            }
            progress(index + 1, total);
        }

        if report.failed > 0 {
            warn!("{} of {total} read requests failed", report.failed);
        }
        Ok(report)
    }

    /// Erase the target flash.
    pub fn erase_target(&mut self, session: &mut Session) -> Result<()> {
        session.clear_errors();
        info!("Erasing target");
        self.client.erase().inspect_err(|e| {
            warn!("Erase failed: {e}");
            session.push_error(e.duplicate());
        })
    }

    /// Erase the target and write every payload record of `image`.
    ///
    /// Refuses an image with malformed lines. Per-record failures are
    /// recorded in the session and do not stop the write.
    pub fn write_image(
        &mut self,
        session: &mut Session,
        image: &HexImage,
        progress: ProgressFn<'_>,
    ) -> Result<WriteReport> {
        if !image.is_valid() {
            return Err(Error::InvalidImage {
                errors: image.errors().to_vec(),
            });
        }
        session.clear_errors();

        let total = image.data_records().count();
        self.client.erase()?;
        info!("Writing {total} records ({} bytes)", image.data_len());

        let mut report = WriteReport {
            total,
            ..WriteReport::default()
        };
        for (index, record) in image.data_records().enumerate() {
            check_interrupted()?;
            match self
                .client
                .write(u32::from(record.address), &record.data)
            {
                Ok(()) => report.written += 1,
                Err(e) => {
                    session.push_error(e);
                    report.failed += 1;
                },
            }
            progress(index + 1, total);
        }
        Ok(report)
    }

    /// Close the connection.
    pub fn disconnect(mut self) -> Result<()> {
        self.client.close()
    }
}

#[cfg(feature = "native")]
impl Programmer<crate::port::NativePort> {
    /// Open a native serial port and connect.
    pub fn open(port_name: &str, config: &ClientConfig) -> Result<Self> {
        let port = crate::port::NativePort::open_simple(port_name, config.baud_rate)?;
        Self::connect(port, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockHandle, MockPort};

    fn fast_config() -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(30),
            settle: Duration::ZERO,
            ..ClientConfig::default()
        }
    }

    fn connected() -> (Programmer<MockPort>, MockHandle) {
        let (port, handle) = MockPort::new(PROTOCOL_BAUD);
        handle.queue_reply(&[0x8F]);
        let programmer = Programmer::connect(port, &fast_config()).unwrap();
        (programmer, handle)
    }

    #[test]
    fn test_read_plan_defaults() {
        let plan = ReadPlan::default();
        assert_eq!(plan.start, 0);
        assert_eq!(plan.size, 0x37FF);
        assert_eq!(plan.chunk, 0x10);
        // 0x37FF is not a multiple of 0x10: the last chunk starts at 0x37F0
        assert_eq!(plan.chunk_count(), 0x380);
        assert_eq!(plan.addresses().last(), Some(0x37F0));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_read_plan_rejects_out_of_range() {
        let plan = ReadPlan {
            start: 0xFF_FF00,
            size: 0x100_0000,
            chunk: 0x20,
        };
        assert!(plan.validate().is_ok());

        let plan = ReadPlan {
            chunk: 0x100,
            ..ReadPlan::default()
        };
        assert!(matches!(
            plan.validate(),
            Err(Error::AddressRangeExceeded { .. })
        ));
        assert!(ReadPlan { start: 5, size: 5, chunk: 1 }.validate().is_err());
    }

    #[test]
    fn test_connect_without_bridge_closes_port() {
        let (port, handle) = MockPort::new(PROTOCOL_BAUD);
        let result = Programmer::connect(port, &fast_config());
        assert!(matches!(result, Err(Error::InterfaceNotDetected(_))));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_initialize_target_records_device_info() {
        let (mut programmer, handle) = connected();
        handle.queue_reply(&[0x81]);
        handle.queue_reply(&[0x88, 0x28, 0x01, 0x00]);

        let mut session = Session::new();
        let info = programmer.initialize_target(&mut session).unwrap();
        assert_eq!(info, Some(DeviceInfo { id: 0x28, revision: 0x01 }));
        assert_eq!(session.device_info(), info);
    }

    #[test]
    fn test_initialize_target_sentinel_fails() {
        let (mut programmer, handle) = connected();
        handle.queue_reply(&[0x81]);
        handle.queue_reply(&[0x88, 0xFF, 0xFF, 0x00]);

        let mut session = Session::new();
        assert!(matches!(
            programmer.initialize_target(&mut session),
            Err(Error::InitializationFailed(_))
        ));
    }

    #[test]
    fn test_initialize_target_info_failure_not_fatal() {
        let (mut programmer, handle) = connected();
        handle.queue_reply(&[0x81]);

        let mut session = Session::new();
        assert_eq!(programmer.initialize_target(&mut session).unwrap(), None);
        assert_eq!(session.device_info(), None);
    }

    #[test]
    fn test_read_memory_collects_newest_first_and_continues_on_error() {
        let (mut programmer, handle) = connected();
        handle.queue_reply(&[0x85, 1, 2, 3, 4]);
        handle.queue_reply(&[0x05]);
        handle.queue_reply(&[0x85, 9, 10, 11, 12]);

        let plan = ReadPlan {
            start: 0,
            size: 12,
            chunk: 4,
        };
        let mut session = Session::new();
        let mut calls = Vec::new();
        let report = programmer
            .read_memory(&mut session, &plan, &mut |done, total| calls.push((done, total)))
            .unwrap();

        assert_eq!(report, ReadReport { read: 2, failed: 1 });
        assert_eq!(calls, vec![(1, 3), (2, 3), (3, 3)]);
        let addresses: Vec<u32> = session.chunks().map(|c| c.address).collect();
        assert_eq!(addresses, vec![8, 0]);
        assert_eq!(session.error_count(), 1);
    }

    /// Read `start..size` in `chunk`-byte requests against scripted replies,
    /// then parse the sorted dump and compare with what was sent.
    fn assert_read_dump_round_trip(start: u32, size: u32, chunk: usize) {
        let (mut programmer, handle) = connected();
        let plan = ReadPlan { start, size, chunk };
        let expected: Vec<(u16, Vec<u8>)> = plan
            .addresses()
            .map(|address| {
                let block: Vec<u8> = (0..chunk)
                    .map(|i| (address as usize + i) as u8)
                    .collect();
                let mut reply = vec![0x85];
                reply.extend_from_slice(&block);
                handle.queue_reply(&reply);
                (address as u16, block)
            })
            .collect();

        let mut session = Session::new();
        let report = programmer
            .read_memory(&mut session, &plan, &mut |_, _| {})
            .unwrap();
        assert_eq!(report.failed, 0, "chunk {chunk}");

        let image = HexImage::parse(&session.dump(true));
        assert!(image.is_valid(), "chunk {chunk}");
        let parsed: Vec<(u16, Vec<u8>)> = image
            .data_records()
            .map(|r| (r.address, r.data.clone()))
            .collect();
        assert_eq!(parsed, expected, "chunk {chunk}");
    }

    #[test]
    fn test_read_then_dump_round_trips_for_every_divisor() {
        for chunk in [1, 2, 3, 4, 6, 8, 12, 24] {
            assert_read_dump_round_trip(0x100, 0x118, chunk);
        }
    }

    #[test]
    fn test_read_then_dump_round_trips_max_chunk() {
        assert_read_dump_round_trip(0, 255 * 2, 255);
    }

    #[test]
    fn test_unsorted_dump_keeps_display_order() {
        let (mut programmer, handle) = connected();
        for i in 0..3u8 {
            let mut reply = vec![0x85];
            reply.extend((0..8).map(|b| i * 8 + b));
            handle.queue_reply(&reply);
        }
        let plan = ReadPlan {
            start: 0x100,
            size: 0x118,
            chunk: 8,
        };
        let mut session = Session::new();
        programmer
            .read_memory(&mut session, &plan, &mut |_, _| {})
            .unwrap();

        let first_line = session.dump(false).lines().next().unwrap().to_string();
        assert!(first_line.starts_with(":08011000"));
    }

    #[test]
    fn test_write_image_erases_then_writes_payload_records() {
        let (mut programmer, handle) = connected();
        handle.queue_reply(&[0x84]);
        handle.queue_reply(&[0x83]);
        handle.queue_reply(&[0x00]);

        let image = HexImage::parse(":0100000011EE\n:02001000AABB00\n:00000001FF\n");
        let mut session = Session::new();
        let report = programmer
            .write_image(&mut session, &image, &mut |_, _| {})
            .unwrap();

        assert_eq!(report, WriteReport { written: 1, total: 2, failed: 1 });
        assert!(matches!(
            session.errors().next(),
            Some(Error::ChecksumError { address: 0x0010 })
        ));
        let written = handle.written();
        // ping, erase, two writes
        assert_eq!(written.len(), 4);
        assert_eq!(written[1], vec![0x04, 0x00]);
        assert_eq!(written[2][0], 0x03);
    }

    #[test]
    fn test_write_image_refuses_malformed_image() {
        let (mut programmer, handle) = connected();
        let image = HexImage::parse(":0100000011EE\nbroken\n");
        let mut session = Session::new();
        assert!(matches!(
            programmer.write_image(&mut session, &image, &mut |_, _| {}),
            Err(Error::InvalidImage { .. })
        ));
        // Only the ping went out
        assert_eq!(handle.written().len(), 1);
    }

    #[test]
    fn test_write_image_aborts_when_erase_fails() {
        let (mut programmer, handle) = connected();
        let image = HexImage::parse(":0100000011EE\n");
        let mut session = Session::new();
        assert!(programmer
            .write_image(&mut session, &image, &mut |_, _| {})
            .is_err());
        assert_eq!(handle.written().len(), 2);
    }

    #[test]
    fn test_erase_target_records_failure() {
        let (mut programmer, handle) = connected();
        let mut session = Session::new();
        session.push_error(Error::Cancelled);

        handle.queue_reply(&[0x04]);
        let result = programmer.erase_target(&mut session);
        assert!(matches!(result, Err(Error::UnexpectedAck { actual: 0x04, .. })));
        assert_eq!(session.error_count(), 1);
        assert!(matches!(
            session.errors().next(),
            Some(Error::UnexpectedAck { actual: 0x04, .. })
        ));

        handle.queue_reply(&[0x84]);
        programmer.erase_target(&mut session).unwrap();
        assert_eq!(session.error_count(), 0);
    }

    #[test]
    fn test_lock_suspected() {
        let mut session = Session::new();
        session.push_error(Error::Cancelled);
        assert!(!session.lock_suspected());
        session.set_device_info(Some(DeviceInfo { id: 1, revision: 0 }));
        assert!(session.lock_suspected());
    }

    #[test]
    fn test_disconnect_closes_port() {
        let (programmer, handle) = connected();
        programmer.disconnect().unwrap();
        assert!(handle.is_closed());
    }
}
