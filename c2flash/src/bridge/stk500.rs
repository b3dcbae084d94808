//! STK500v1 bootloader client (Arduino optiboot).
//!
//! Every command ends with `CRC_EOP` and every answer is framed by
//! `INSYNC ... OK`:
//!
//! ```text
//! host:   | cmd | args... | 0x20 |
//! target: | 0x14 | data... | 0x10 |
//! ```
//!
//! Flash is programmed page by page: LOAD_ADDRESS takes a word address,
//! PROG_PAGE carries one page of bytes.

use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::{Board, BridgeFlasher};
use crate::error::{Error, Result};
use crate::image::hex::HexImage;
use crate::port::Port;

/// STK500v1 command and response bytes.
pub mod cmd {
    /// Get synchronization.
    pub const GET_SYNC: u8 = 0x30;
    /// Enter programming mode.
    pub const ENTER_PROGMODE: u8 = 0x50;
    /// Leave programming mode.
    pub const LEAVE_PROGMODE: u8 = 0x51;
    /// Load word address.
    pub const LOAD_ADDRESS: u8 = 0x55;
    /// Program one page.
    pub const PROG_PAGE: u8 = 0x64;
    /// Read one page.
    pub const READ_PAGE: u8 = 0x74;
    /// Read device signature.
    pub const READ_SIGN: u8 = 0x75;
    /// End of command marker.
    pub const CRC_EOP: u8 = 0x20;
    /// Response start.
    pub const INSYNC: u8 = 0x14;
    /// Response end.
    pub const OK: u8 = 0x10;
    /// Memory type: flash.
    pub const MEM_FLASH: u8 = b'F';
}

/// ATmega328P signature, fitted on Uno and Nano boards.
pub const ATMEGA328P_SIGNATURE: [u8; 3] = [0x1E, 0x95, 0x0F];

/// Flash page size of the ATmega328P.
pub const PAGE_SIZE: usize = 128;

/// STK500v1 settings.
#[derive(Debug, Clone)]
pub struct Stk500Config {
    /// Bytes per PROG_PAGE.
    pub page_size: usize,
    /// GET_SYNC attempts before giving up.
    pub sync_attempts: u32,
    /// Time to wait for one response.
    pub reply_timeout: Duration,
    /// Read every page back after programming.
    pub verify: bool,
}

impl Default for Stk500Config {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            sync_attempts: 10,
            reply_timeout: Duration::from_millis(500),
            verify: true,
        }
    }
}

/// Default [`BridgeFlasher`]: programs the bridge through its STK500v1
/// bootloader.
#[derive(Debug, Clone, Default)]
pub struct Stk500Flasher {
    config: Stk500Config,
}

impl Stk500Flasher {
    /// Create a flasher with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a flasher with custom settings.
    pub fn with_config(config: Stk500Config) -> Self {
        Self { config }
    }

    /// Expected device signature for a board.
    pub fn signature_for(board: Board) -> [u8; 3] {
        match board {
            Board::Uno | Board::Nano => ATMEGA328P_SIGNATURE,
        }
    }

    /// Send a command and read `data_len` bytes between INSYNC and OK.
    fn command(&self, port: &mut dyn Port, frame: &[u8], data_len: usize) -> Result<Vec<u8>> {
        trace!("STK500 TX {frame:02X?}");
        port.write_all_bytes(frame)?;

        let reply = read_exact(port, data_len + 2, self.config.reply_timeout)?;
        trace!("STK500 RX {reply:02X?}");

        if reply.first() != Some(&cmd::INSYNC) || reply.last() != Some(&cmd::OK) {
            return Err(Error::UnexpectedAck {
                op: "stk500",
                expected: cmd::INSYNC,
                actual: reply.first().copied().unwrap_or(0),
                address: 0,
                amount: data_len,
            });
        }
        Ok(reply[1..=data_len].to_vec())
    }

    fn sync(&self, port: &mut dyn Port) -> Result<()> {
        for attempt in 1..=self.config.sync_attempts {
            port.clear_input()?;
            match self.command(port, &[cmd::GET_SYNC, cmd::CRC_EOP], 0) {
                Ok(_) => {
                    debug!("STK500 in sync after {attempt} attempt(s)");
                    return Ok(());
                },
                Err(Error::Io(e)) if e.kind() != ErrorKind::TimedOut => return Err(Error::Io(e)),
                Err(e) => {
                    trace!("Sync attempt {attempt} failed: {e}");
                    thread::sleep(Duration::from_millis(10));
                },
            }
        }
        Err(Error::Timeout(format!(
            "no STK500 sync after {} attempts",
            self.config.sync_attempts
        )))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn load_address(&self, port: &mut dyn Port, byte_address: usize) -> Result<()> {
        let [lo, hi] = ((byte_address / 2) as u16).to_le_bytes();
        self.command(port, &[cmd::LOAD_ADDRESS, lo, hi, cmd::CRC_EOP], 0)
            .map(drop)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn program_page(&self, port: &mut dyn Port, page: &[u8]) -> Result<()> {
        let [hi, lo] = (page.len() as u16).to_be_bytes();
        let mut frame = Vec::with_capacity(page.len() + 5);
        frame.extend_from_slice(&[cmd::PROG_PAGE, hi, lo, cmd::MEM_FLASH]);
        frame.extend_from_slice(page);
        frame.push(cmd::CRC_EOP);
        self.command(port, &frame, 0)
            .map(drop)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_page(&self, port: &mut dyn Port, len: usize) -> Result<Vec<u8>> {
        let [hi, lo] = (len as u16).to_be_bytes();
        self.command(
            port,
            &[cmd::READ_PAGE, hi, lo, cmd::MEM_FLASH, cmd::CRC_EOP],
            len,
        )
    }
}

impl BridgeFlasher for Stk500Flasher {
    fn flash(&mut self, port: &mut dyn Port, image: &HexImage, board: Board) -> Result<bool> {
        let binary = image.to_binary();
        if binary.is_empty() {
            warn!("Bridge image has no data");
            return Ok(false);
        }

        self.sync(port)?;

        let signature = self.command(port, &[cmd::READ_SIGN, cmd::CRC_EOP], 3)?;
        let expected = Self::signature_for(board);
        if signature != expected {
            warn!("Unexpected device signature {signature:02X?} for {board} (expected {expected:02X?})");
            return Ok(false);
        }

        self.command(port, &[cmd::ENTER_PROGMODE, cmd::CRC_EOP], 0)?;

        let page_size = self.config.page_size.max(1);
        info!("Programming {} bytes in {}-byte pages", binary.len(), page_size);
        for (index, page) in binary.chunks(page_size).enumerate() {
            self.load_address(port, index * page_size)?;
            self.program_page(port, page)?;
        }

        if self.config.verify {
            for (index, page) in binary.chunks(page_size).enumerate() {
                self.load_address(port, index * page_size)?;
                let read = self.read_page(port, page.len())?;
                if read != page {
                    warn!("Verify mismatch in page at 0x{:04X}", index * page_size);
                    if let Err(e) = self.command(port, &[cmd::LEAVE_PROGMODE, cmd::CRC_EOP], 0) {
                        debug!("Leaving programming mode after mismatch failed: {e}");
                    }
                    return Ok(false);
                }
            }
            debug!("Verified {} bytes", binary.len());
        }

        self.command(port, &[cmd::LEAVE_PROGMODE, cmd::CRC_EOP], 0)?;
        Ok(true)
    }
}

/// Read exactly `len` bytes or fail once `timeout` has passed.
fn read_exact(port: &mut dyn Port, len: usize, timeout: Duration) -> Result<Vec<u8>> {
    let start = Instant::now();
    let mut reply = Vec::with_capacity(len);
    let mut buf = [0u8; 256];

    while reply.len() < len {
        if start.elapsed() >= timeout {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("STK500 reply: {}/{len} bytes", reply.len()),
            )));
        }
        let want = (len - reply.len()).min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    const OK: [u8; 2] = [cmd::INSYNC, cmd::OK];

    fn quick() -> Stk500Flasher {
        Stk500Flasher::with_config(Stk500Config {
            page_size: 4,
            sync_attempts: 3,
            reply_timeout: Duration::from_millis(30),
            verify: true,
        })
    }

    #[test]
    fn test_flash_programs_pages_and_verifies() {
        let (mut port, handle) = MockPort::new(115_200);
        let image = HexImage::parse(":0600000011223344556600\n:00000001FF\n");

        handle.queue_reply(&OK); // sync
        handle.queue_reply(&[0x14, 0x1E, 0x95, 0x0F, 0x10]); // signature
        handle.queue_reply(&OK); // enter progmode
        for _ in 0..4 {
            handle.queue_reply(&OK); // load address / program page
        }
        handle.queue_reply(&OK);
        handle.queue_reply(&[0x14, 0x11, 0x22, 0x33, 0x44, 0x10]);
        handle.queue_reply(&OK);
        handle.queue_reply(&[0x14, 0x55, 0x66, 0x10]);
        handle.queue_reply(&OK); // leave progmode

        assert!(quick().flash(&mut port, &image, Board::Uno).unwrap());

        let written = handle.written();
        assert_eq!(written[0], vec![0x30, 0x20]);
        assert_eq!(written[3], vec![0x55, 0x00, 0x00, 0x20]);
        assert_eq!(written[4], vec![0x64, 0x00, 0x04, b'F', 0x11, 0x22, 0x33, 0x44, 0x20]);
        // Second page at byte 4, word 2
        assert_eq!(written[5], vec![0x55, 0x02, 0x00, 0x20]);
        assert_eq!(written[6], vec![0x64, 0x00, 0x02, b'F', 0x55, 0x66, 0x20]);
        assert_eq!(written.last().unwrap(), &vec![0x51, 0x20]);
    }

    #[test]
    fn test_verify_mismatch_refuses_and_leaves_progmode() {
        let (mut port, handle) = MockPort::new(115_200);
        let image = HexImage::parse(":0200000011223B\n");

        handle.queue_reply(&OK); // sync
        handle.queue_reply(&[0x14, 0x1E, 0x95, 0x0F, 0x10]); // signature
        handle.queue_reply(&OK); // enter progmode
        handle.queue_reply(&OK); // load address
        handle.queue_reply(&OK); // program page
        handle.queue_reply(&OK); // load address
        handle.queue_reply(&[0x14, 0x11, 0x00, 0x10]); // read back differs
        // No reply to LEAVE_PROGMODE: the failure is only logged

        assert!(!quick().flash(&mut port, &image, Board::Uno).unwrap());
        assert_eq!(handle.written().last().unwrap(), &vec![0x51, 0x20]);
    }

    #[test]
    fn test_wrong_signature_refuses() {
        let (mut port, handle) = MockPort::new(115_200);
        let image = HexImage::parse(":0100000011EE\n");
        handle.queue_reply(&OK);
        handle.queue_reply(&[0x14, 0x1E, 0x98, 0x01, 0x10]);

        assert!(!quick().flash(&mut port, &image, Board::Nano).unwrap());
        assert_eq!(handle.written().len(), 2);
    }

    #[test]
    fn test_no_sync_times_out() {
        let (mut port, handle) = MockPort::new(57_600);
        let image = HexImage::parse(":0100000011EE\n");

        assert!(matches!(
            quick().flash(&mut port, &image, Board::Uno),
            Err(Error::Timeout(_))
        ));
        assert_eq!(handle.written().len(), 3);
    }

    #[test]
    fn test_empty_image_refused() {
        let (mut port, handle) = MockPort::new(115_200);
        assert!(!quick().flash(&mut port, &HexImage::default(), Board::Uno).unwrap());
        assert!(handle.written().is_empty());
    }
}
