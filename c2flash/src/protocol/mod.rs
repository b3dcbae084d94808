//! Protocol implementations.

pub mod c2;

// Re-export common types
pub use c2::{Action, C2Client, C2Command, DeviceInfo, write_checksum};
