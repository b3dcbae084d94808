//! # c2flash
//!
//! A library for programming Silicon Labs C2 microcontrollers through an
//! Arduino running the C2 bridge firmware.
//!
//! This crate provides:
//!
//! - The bridge command set (ping, reset, initialize, device info, read,
//!   erase, write) over a timeout-recovering request/response transport
//! - Intel-HEX-style image parsing and memory-dump formatting
//! - A programming session (connect, identify, read, erase, write)
//! - Bridge firmware installation over the Arduino's STK500 bootloader,
//!   falling back through candidate baud rates
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use c2flash::{ClientConfig, HexImage, Programmer, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = HexImage::from_file("firmware.hex")?.into_valid()?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut session = Session::new();
//!         let mut programmer = Programmer::open("/dev/ttyACM0", &ClientConfig::default())?;
//!         programmer.initialize_target(&mut session)?;
//!
//!         let report = programmer.write_image(&mut session, &image, &mut |done, total| {
//!             println!("Writing {done}/{total}");
//!         })?;
//!         println!("{} records written", report.written);
//!
//!         programmer.disconnect()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bridge;
pub mod cancel;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeOpener, NativePort};
pub use {
    bridge::{
        AttemptOutcome, Board, BridgeFlasher, FlashAttempt, FlashOrchestrator, FlashState,
        InstallConfig, PortOpener, Stk500Flasher,
    },
    cancel::{CancelToken, CancellablePort},
    error::{Error, LineError, Result},
    image::hex::{HexImage, HexRecord, RecordType},
    port::{Port, SerialConfig},
    protocol::c2::{Action, C2Client, C2Command, DeviceInfo},
    session::{ClientConfig, MemoryChunk, Programmer, ReadPlan, ReadReport, Session, WriteReport},
    transport::{ExchangeOutcome, Response, Transport},
};
