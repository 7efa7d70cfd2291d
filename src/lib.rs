//! Host-side flashing client for the ESP8266 ROM serial bootloader.
//!
//! [connection] acquires a synchronized device (explicitly named port or
//! auto-detected) and implements the framed request/response protocol;
//! [flasher] programs images in 1 KB blocks with sector padding, the
//! erase-size compensation and an incremental diff against the previously
//! written image.

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod interface;
pub mod progress;
mod slip;

pub use error::Error;
pub use flasher::Flasher;
