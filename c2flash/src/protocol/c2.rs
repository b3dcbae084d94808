//! C2 bridge command set.
//!
//! The bridge firmware exposes the target MCU's C2 programming interface as a
//! small byte-oriented command set. Every command starts with an action code
//! and every reply starts with that code with bit 7 set.
//!
//! ## Frame Formats
//!
//! ```text
//! Simple commands (PING, RESET, INIT, INFO, ERASE):
//! +--------+------+
//! | action | 0x00 |
//! +--------+------+
//!
//! READ:
//! +------+------+-----+-----------+----------+----------+------+
//! | 0x05 | 0x05 | len | addr[23:16] | addr[15:8] | addr[7:0] | 0x00 |
//! +------+------+-----+-----------+----------+----------+------+
//! reply: 0x85, data[len]
//!
//! WRITE:
//! +------+----------+---------+---+--------+--------+-----+----------+
//! | 0x03 | len + 5  | len     | 0 | addrHi | addrLo | sum | data[len] |
//! +------+----------+---------+---+--------+--------+-----+----------+
//! sum = (addrHi + addrLo + data...) mod 256
//! reply: 0x83
//! ```

use std::fmt;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::transport::{Response, Transport};

/// Default reply timeout for one exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Largest address reachable by READ (24-bit field).
pub const MAX_READ_ADDRESS: u32 = 0x00FF_FFFF;

/// Largest address reachable by WRITE (16-bit field).
pub const MAX_WRITE_ADDRESS: u32 = 0xFFFF;

/// Most bytes a single READ can request (one length byte).
pub const MAX_READ_LEN: usize = 0xFF;

/// Most bytes a single WRITE can carry, so that `len + 5` fits a byte.
pub const MAX_WRITE_LEN: usize = 0xFF - WRITE_HEADER_LEN;

/// Bytes counted by WRITE's total length field besides the data.
const WRITE_HEADER_LEN: usize = 5;

/// Bit set in the action code of a successful reply.
pub const ACK_BIT: u8 = 0x80;

/// Mask applied to the WRITE action code to obtain the CRC-error reply.
pub const CRC_ERROR_MASK: u8 = 0x40;

/// Bridge action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    /// Generic acknowledge (0x00).
    Ack = 0x00,
    /// Initialize the C2 interface (0x01).
    Init = 0x01,
    /// Reset the target (0x02).
    Reset = 0x02,
    /// Write program memory (0x03).
    Write = 0x03,
    /// Erase the device (0x04).
    Erase = 0x04,
    /// Read program memory (0x05).
    Read = 0x05,
    /// Device ID and revision (0x08).
    Info = 0x08,
    /// Bridge presence check (0x0F).
    Ping = 0x0F,
}

impl Action {
    /// Status byte the bridge returns on success.
    pub fn success(self) -> u8 {
        self as u8 | ACK_BIT
    }

    /// Status byte the bridge returns on a checksum mismatch.
    ///
    /// This is literally `action & 0x40`, which is 0x00 for WRITE. A reply
    /// of a single zero byte therefore reads as a CRC error.
    pub fn crc_error(self) -> u8 {
        self as u8 & CRC_ERROR_MASK
    }

    /// Operation name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Init => "initialize",
            Self::Reset => "reset",
            Self::Write => "write",
            Self::Erase => "erase",
            Self::Read => "read",
            Self::Info => "get info",
            Self::Ping => "ping",
        }
    }
}

/// Checksum carried by WRITE: sum of address bytes and data, mod 256.
#[allow(clippy::cast_possible_truncation)]
pub fn write_checksum(address: u16, data: &[u8]) -> u8 {
    let [hi, lo] = address.to_be_bytes();
    data.iter()
        .fold(hi.wrapping_add(lo), |sum, &b| sum.wrapping_add(b))
}

/// A fully built bridge command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C2Command {
    action: Action,
    bytes: Vec<u8>,
    expected_len: usize,
    address: u32,
    amount: usize,
}

impl C2Command {
    fn simple(action: Action, expected_len: usize) -> Self {
        Self {
            action,
            bytes: vec![action as u8, 0x00],
            expected_len,
            address: 0,
            amount: 0,
        }
    }

    /// PING.
    pub fn ping() -> Self {
        Self::simple(Action::Ping, 1)
    }

    /// RESET.
    pub fn reset() -> Self {
        Self::simple(Action::Reset, 1)
    }

    /// INIT.
    pub fn initialize() -> Self {
        Self::simple(Action::Init, 1)
    }

    /// INFO, answered with status, id, revision and one spare byte.
    pub fn info() -> Self {
        Self::simple(Action::Info, 4)
    }

    /// ERASE.
    pub fn erase() -> Self {
        Self::simple(Action::Erase, 1)
    }

    /// READ `amount` bytes starting at a 24-bit `address`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(address: u32, amount: usize) -> Result<Self> {
        let in_range = (1..=MAX_READ_LEN).contains(&amount)
            && u64::from(address) + amount as u64 <= u64::from(MAX_READ_ADDRESS) + 1;
        if !in_range {
            return Err(Error::AddressRangeExceeded {
                op: Action::Read.name(),
                address,
                amount,
            });
        }

        let action = Action::Read as u8;
        let mut bytes = vec![action, action, amount as u8];
        bytes.write_u24::<BigEndian>(address).unwrap();
        bytes.push(0x00);

        Ok(Self {
            action: Action::Read,
            bytes,
            expected_len: amount + 1,
            address,
            amount,
        })
    }

    /// WRITE `data` starting at a 16-bit `address`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(address: u32, data: &[u8]) -> Result<Self> {
        let in_range = !data.is_empty()
            && data.len() <= MAX_WRITE_LEN
            && u64::from(address) + data.len() as u64 <= u64::from(MAX_WRITE_ADDRESS) + 1;
        if !in_range {
            return Err(Error::AddressRangeExceeded {
                op: Action::Write.name(),
                address,
                amount: data.len(),
            });
        }

        let address16 = address as u16;
        let mut bytes = Vec::with_capacity(data.len() + 7);
        bytes.push(Action::Write as u8);
        bytes.push((data.len() + WRITE_HEADER_LEN) as u8);
        bytes.push(data.len() as u8);
        bytes.push(0x00);
        bytes.write_u16::<BigEndian>(address16).unwrap();
        bytes.push(write_checksum(address16, data));
        bytes.extend_from_slice(data);

        Ok(Self {
            action: Action::Write,
            bytes,
            expected_len: 1,
            address,
            amount: data.len(),
        })
    }

    /// Action code of this command.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the reply the bridge sends for this command.
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Address targeted by this command (0 for address-less commands).
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Data amount involved in this command.
    pub fn amount(&self) -> usize {
        self.amount
    }

    fn no_response(&self) -> Error {
        Error::NoResponse {
            op: self.action.name(),
            address: self.address,
            amount: self.amount,
        }
    }

    fn unexpected_ack(&self, actual: u8) -> Error {
        Error::UnexpectedAck {
            op: self.action.name(),
            expected: self.action.success(),
            actual,
            address: self.address,
            amount: self.amount,
        }
    }

    /// Check a reply against this command's success contract.
    ///
    /// Succeeds only for a reply of the full expected length whose first
    /// byte is the action code with [`ACK_BIT`] set.
    pub fn check(&self, response: &Response) -> Result<()> {
        let Some(status) = response.status() else {
            return Err(self.no_response());
        };
        if self.action == Action::Write && status == self.action.crc_error() {
            return Err(Error::ChecksumError {
                address: self.address,
            });
        }
        if status != self.action.success() {
            return Err(self.unexpected_ack(status));
        }
        if response.len() < self.expected_len {
            return Err(self.no_response());
        }
        Ok(())
    }
}

/// Target identification returned by INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Device ID.
    pub id: u8,
    /// Silicon revision.
    pub revision: u8,
}

impl DeviceInfo {
    /// Value INFO reports for both fields when the target did not respond.
    pub const UNINITIALIZED: u8 = 0xFF;

    /// Build from a 4-byte INFO reply.
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        match reply {
            [_, id, revision, _] => Some(Self {
                id: *id,
                revision: *revision,
            }),
            _ => None,
        }
    }

    /// False for the 0xFF/0xFF pattern of an MCU that never came up.
    pub fn is_initialized(&self) -> bool {
        !(self.id == Self::UNINITIALIZED && self.revision == Self::UNINITIALIZED)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device ID: 0x{:02X} Revision: 0x{:02X}", self.id, self.revision)
    }
}

/// Protocol client speaking the bridge command set over a [`Transport`].
pub struct C2Client<P: Port> {
    transport: Transport<P>,
    timeout: Duration,
}

impl<P: Port> C2Client<P> {
    /// Create a client on an open port with the default reply timeout.
    pub fn new(port: P) -> Self {
        Self::with_timeout(port, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom reply timeout.
    pub fn with_timeout(port: P, timeout: Duration) -> Self {
        Self {
            transport: Transport::new(port),
            timeout,
        }
    }

    /// Reply timeout applied to each exchange.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get a reference to the transport.
    pub fn transport(&self) -> &Transport<P> {
        &self.transport
    }

    /// Drop boot noise and start with a fresh reader.
    pub fn clear_buffer(&mut self) -> Result<()> {
        self.transport.clear_buffer()
    }

    /// Send `command` and validate the reply.
    pub fn execute(&mut self, command: &C2Command) -> Result<Vec<u8>> {
        let response = self.transport.write_and_wait(
            command.as_bytes(),
            command.expected_len(),
            self.timeout,
        );
        command.check(&response)?;
        Ok(response.bytes)
    }

    /// Whether the bridge firmware answers. Silence is a valid answer.
    pub fn ping(&mut self) -> bool {
        match self.execute(&C2Command::ping()) {
            Ok(_) => true,
            Err(e) => {
                debug!("Ping failed: {e}");
                false
            },
        }
    }

    /// Reset the target through the C2 interface.
    pub fn reset(&mut self) -> Result<()> {
        self.execute(&C2Command::reset())
            .map(drop)
    }

    /// Initialize the C2 interface on the target.
    pub fn initialize(&mut self) -> Result<()> {
        self.execute(&C2Command::initialize())
            .map(drop)
    }

    /// Fetch device ID and revision.
    ///
    /// A 0xFF/0xFF answer is returned as is; see [`DeviceInfo::is_initialized`].
    pub fn get_info(&mut self) -> Result<DeviceInfo> {
        let command = C2Command::info();
        let reply = self.execute(&command)?;
        DeviceInfo::from_reply(&reply).ok_or_else(|| command.no_response())
    }

    /// Erase the whole target flash.
    pub fn erase(&mut self) -> Result<()> {
        self.execute(&C2Command::erase())
            .map(drop)
    }

    /// Read `amount` bytes starting at `address`.
    pub fn read(&mut self, address: u32, amount: usize) -> Result<Vec<u8>> {
        let command = C2Command::read(address, amount)?;
        let mut reply = self.execute(&command)?;
        // Drop the status byte
        reply.remove(0);
        Ok(reply)
    }

    /// Write `data` starting at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let command = C2Command::write(address, data)?;
        self.execute(&command)
            .map(drop)
            .inspect_err(|e| warn!("{e}"))
    }

    /// Release reader and writer and close the connection.
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }

    /// Consume the client and return the underlying port.
    pub fn into_port(self) -> P {
        self.transport.into_port()
    }
}
