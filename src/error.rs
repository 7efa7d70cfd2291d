//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

const BOOT_MODE_HELP: &str = "\
Make sure that GPIO0 and GPIO15 are connected to low level (ground) and that \
GPIO2 and CH_PD are connected to high level (power source), then reboot the \
device (reconnect power or pull the RST pin to ground for a second).";

/// All possible errors returned by espflasher
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with the device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(code(espflasher::rom_error))]
    Rom(#[from] RomError),

    #[error("Failed to sync with the device")]
    #[diagnostic(
        code(espflasher::sync_failed),
        help("The device is not connected to the UART or is not in boot mode.\n{}", BOOT_MODE_HELP)
    )]
    SyncFailed,

    #[error("No device could be detected")]
    #[diagnostic(
        code(espflasher::no_device),
        help("Check that the device is connected and the serial driver is installed, \
              or specify the port manually with `--port`.\n{}", BOOT_MODE_HELP)
    )]
    NoDeviceDetected,

    #[error("Write of {size:#x} bytes at {address:#010x} is not aligned to the 4096 byte flash sector")]
    #[diagnostic(code(espflasher::alignment))]
    Alignment { address: u32, size: u32 },

    #[error("Failed to open image file: {0}")]
    #[diagnostic(code(espflasher::file_open))]
    FileOpen(String, #[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("No answer from the device while running the {0} command")]
    #[diagnostic(code(espflasher::no_answer))]
    NoAnswer(CommandType),

    #[error("Wrong answer received for the {0} command")]
    #[diagnostic(code(espflasher::wrong_answer))]
    WrongAnswer(CommandType),

    #[error("Answer for the {0} command was not completed")]
    #[diagnostic(code(espflasher::incomplete_answer))]
    IncompleteAnswer(CommandType),

    #[error("Answer has a wrong body length")]
    #[diagnostic(code(espflasher::wrong_body_length))]
    WrongBodyLength,

    #[error("Serial port not found")]
    #[diagnostic(
        code(espflasher::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(espflasher::serial_io))]
    IoError(#[source] io::Error),

    #[error("Serial port error: {0}")]
    #[diagnostic(code(espflasher::serial))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::IoError(err)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => ConnectionError::IoError(kind.into()),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

/// A non-zero status reported by the device for an operation.
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Operation {command} failed, code {code:#04x}")]
#[diagnostic(code(espflasher::rom_error))]
pub struct RomError {
    command: CommandType,
    code: u8,
}

impl RomError {
    pub fn new(command: CommandType, code: u8) -> Self {
        RomError { command, code }
    }

    pub fn code(&self) -> u8 {
        self.code
    }
}
