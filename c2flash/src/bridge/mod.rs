//! Bridge firmware installation.
//!
//! Before any C2 operation works, the Arduino acting as bridge must run the
//! C2 bridge firmware. [`FlashOrchestrator`] installs it through the board's
//! serial bootloader, trying each candidate baud rate in turn; the actual
//! bootloader dialogue is delegated to a [`BridgeFlasher`].
//!
//! ```text
//! Idle -> AttemptingBaud(rate) -> Resetting -> DelegatedFlash -> Verifying
//!                ^                                                 |
//!                |                                   +-------------+---------+
//!                |                                   v                       v
//!                +---------- (next rate) ------ FailedAttempt           Succeeded
//!                                                    |
//!                                      (no rates left)
//!                                                    v
//!                                             ExhaustedFailed
//! ```

mod orchestrator;
pub mod stk500;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::image::hex::HexImage;
use crate::port::Port;

pub use orchestrator::{AttemptOutcome, FlashAttempt, FlashOrchestrator, FlashState, reset_bridge};
pub use stk500::Stk500Flasher;

/// Baud rates tried by default, fastest first.
pub const DEFAULT_BAUDS: [u32; 2] = [115_200, 57_600];

/// Time one attempt may take before it counts as failed.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// Supported bridge boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Board {
    /// Arduino Uno.
    #[default]
    Uno,
    /// Arduino Nano.
    Nano,
}

impl Board {
    /// All supported boards.
    pub const ALL: [Self; 2] = [Self::Uno, Self::Nano];

    /// Short board identifier.
    pub fn name(self) -> &'static str {
        match self {
            Self::Uno => "uno",
            Self::Nano => "nano",
        }
    }

    /// Base name of the bridge firmware image built for this board.
    pub fn image_name(self) -> &'static str {
        match self {
            Self::Uno | Self::Nano => "uno_nano",
        }
    }

    /// Image file for this board inside `dir`.
    pub fn image_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.hex", self.image_name()))
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Board {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uno" => Ok(Self::Uno),
            "nano" => Ok(Self::Nano),
            other => Err(Error::Config(format!("unknown board: {other}"))),
        }
    }
}

/// Bootloader client used to install the bridge firmware.
///
/// The port is lent for the duration of the call and is already open at the
/// attempt's baud rate with the board freshly reset. Reads fail with
/// [`std::io::ErrorKind::ConnectionAborted`] once the attempt's deadline
/// passes.
pub trait BridgeFlasher {
    /// Program `image` into `board`. `Ok(false)` reports a refused flash.
    fn flash(&mut self, port: &mut dyn Port, image: &HexImage, board: Board) -> Result<bool>;
}

/// Opens a fresh connection to the bridge at a given baud rate.
pub trait PortOpener {
    /// Connection type produced.
    type Port: Port;

    /// Open the device at `baud_rate`.
    fn open(&mut self, baud_rate: u32) -> Result<Self::Port>;
}

/// Reset pulse issued on every freshly opened connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTiming {
    /// How long DTR/RTS are held low.
    pub low: Duration,
    /// Wait after raising DTR/RTS, while the bootloader starts.
    pub high: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            low: Duration::from_millis(250),
            high: Duration::from_millis(50),
        }
    }
}

/// Bridge installation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    /// Baud rates to try, in order.
    pub bauds: Vec<u32>,
    /// Deadline of one attempt.
    pub deadline: Duration,
    /// Reset pulse timings.
    pub reset: ResetTiming,
    /// Board being programmed.
    pub board: Board,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            bauds: DEFAULT_BAUDS.to_vec(),
            deadline: DEFAULT_DEADLINE,
            reset: ResetTiming::default(),
            board: Board::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boards_share_bridge_image() {
        assert_eq!(Board::Uno.image_name(), "uno_nano");
        assert_eq!(Board::Nano.image_name(), "uno_nano");
        assert_eq!(
            Board::Nano.image_path(Path::new("bins")),
            Path::new("bins").join("uno_nano.hex")
        );
    }

    #[test]
    fn test_board_from_str() {
        assert_eq!("UNO".parse::<Board>().unwrap(), Board::Uno);
        assert_eq!("nano".parse::<Board>().unwrap(), Board::Nano);
        assert!("mega".parse::<Board>().is_err());
    }

    #[test]
    fn test_install_config_defaults() {
        let config = InstallConfig::default();
        assert_eq!(config.bauds, vec![115_200, 57_600]);
        assert_eq!(config.deadline, Duration::from_secs(5));
        assert_eq!(config.reset.low, Duration::from_millis(250));
    }
}
