//! romtools core library
//!
//! This library orchestrates device modifications on a rooted Android phone:
//! - Capability probing and live safety status
//! - The safety gate and the operation pipeline state machine
//! - Checksummed partition backups and verified flashing
//! - Resumable image downloads
//! - Host-app retention across ROM wipes
//! - Exit codes, progress events and structured logging for the CLI
//!
//! The binary entry point is in `main.rs`; [`RomTools`] is the composition
//! root for embedders.

pub mod backup;
pub mod bootloader;
pub mod cancel;
pub mod events;
pub mod exit_codes;
pub mod facade;
pub mod flash;
pub mod logging;
pub mod partition;
pub mod pipeline;
pub mod probe;
pub mod retention;
pub mod safety;
pub mod shell;
pub mod verify;
pub mod worker;

// Re-export test doubles for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use facade::RomTools;
