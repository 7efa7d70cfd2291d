//! Establish a connection with a target device
//!
//! The [Connection] struct owns the transport, the receive buffer and the
//! timeout budget, and implements the request/response exchange on top of
//! them. Free functions at the bottom acquire a synchronized connection
//! either from a named port or by probing every candidate port.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, info};

use self::reset::{BootloaderReset, HardReset, ResetStrategy};
use crate::{
    command::{Command, CommandType},
    error::{ConnectionError, Error, RomError},
    interface::{candidate_ports, SerialTransport, Transport},
    slip::{Deescaper, SlipEncoder, END},
};

pub mod reset;

/// Timeout budget while a flashing session is active.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Shorter budget used while probing candidate ports.
const AUTODETECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Number of sync exchanges attempted before giving up on a device.
const MAX_SYNC_ATTEMPTS: usize = 3;
/// Number of full passes over the candidate ports during auto-detection.
const AUTODETECT_MAX_SCANS: usize = 3;
/// Upper bound on candidate ports considered per scan.
const AUTODETECT_MAX_PORTS: usize = 20;

/// Granularity of the receive polling loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// The line must stay quiet this long before a response tail is inspected.
const IDLE_PERIOD: Duration = Duration::from_millis(100);
/// De-escaped response bytes surrounding the declared body: delimiter,
/// direction, command, u16 size, u32 value and the closing delimiter.
const RESPONSE_OVERHEAD: usize = 10;
/// Responses never legitimately exceed this; further bytes are dropped.
const RECEIVE_BUFFER_SIZE: usize = 4096;

/// An established connection with a target device
pub struct Connection {
    serial: Box<dyn Transport>,
    buffer: Vec<u8>,
    decoder: Deescaper,
    timeout: Duration,
}

impl Connection {
    pub fn new(serial: Box<dyn Transport>) -> Self {
        Connection {
            serial,
            buffer: Vec::with_capacity(RECEIVE_BUFFER_SIZE),
            decoder: Deescaper::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the timeout budget for subsequent exchanges
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn name(&self) -> Option<String> {
        self.serial.name()
    }

    /// Initialize the connection: reset into the bootloader and sync
    pub fn begin(&mut self) -> Result<(), Error> {
        BootloaderReset.reset(self.serial.as_mut())?;
        self.sync()
    }

    /// Reset the device into its bootloader
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        BootloaderReset.reset(self.serial.as_mut())
    }

    /// Reset the device into its firmware
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        HardReset.reset(self.serial.as_mut())
    }

    /// Try to sync with the device, retrying up to [MAX_SYNC_ATTEMPTS] times
    pub fn sync(&mut self) -> Result<(), Error> {
        for attempt in 1..=MAX_SYNC_ATTEMPTS {
            match self.sync_attempt() {
                Ok(()) => return Ok(()),
                Err(err) => debug!("sync attempt {attempt} failed: {err}"),
            }
        }

        Err(Error::SyncFailed)
    }

    /// A single sync exchange, used once per candidate while probing
    pub(crate) fn sync_attempt(&mut self) -> Result<(), Error> {
        self.command(Command::Sync)
    }

    /// Write a command and wait for the device's answer
    pub fn command(&mut self, command: Command) -> Result<(), Error> {
        let ty = command.command_type();
        debug!("sending {ty} command");

        // the buffer only ever holds bytes belonging to this exchange
        self.buffer.clear();
        self.decoder.reset();

        let mut framed = Vec::new();
        {
            let mut encoder = SlipEncoder::new(&mut framed).map_err(ConnectionError::from)?;
            command
                .write(&mut encoder)
                .map_err(ConnectionError::from)?;
            encoder.finish().map_err(ConnectionError::from)?;
        }
        self.serial.send(&framed)?;

        if !self.wait_for_bytes(5)? {
            return Err(ConnectionError::NoAnswer(ty).into());
        }
        if self.buffer[0] != END || self.buffer[2] != ty as u8 {
            return Err(ConnectionError::WrongAnswer(ty).into());
        }

        let size = u16::from_le_bytes([self.buffer[3], self.buffer[4]]) as usize;
        if !self.wait_for_bytes(size + RESPONSE_OVERHEAD)? {
            return Err(ConnectionError::IncompleteAnswer(ty).into());
        }

        // let the echo drain completely before inspecting the tail
        self.wait_idle()?;

        if size != 2 || self.buffer[size + 9] != END {
            return Err(ConnectionError::WrongBodyLength.into());
        }
        if self.buffer[size + 7] != 0 {
            return Err(RomError::new(ty, self.buffer[size + 8]).into());
        }

        Ok(())
    }

    /// Drains newly arrived bytes into the receive buffer, de-escaping them
    fn poll(&mut self) -> Result<usize, Error> {
        let mut raw = Vec::new();
        let read = self.serial.read_available(&mut raw)?;
        self.decoder.feed(&raw, &mut self.buffer);
        self.buffer.truncate(RECEIVE_BUFFER_SIZE);

        Ok(read)
    }

    /// Waits until the receive buffer holds at least `count` bytes.
    /// Returns `false` when the timeout budget runs out first.
    fn wait_for_bytes(&mut self, count: usize) -> Result<bool, Error> {
        let deadline = Instant::now() + self.timeout;
        loop {
            self.poll()?;
            if self.buffer.len() >= count {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL);
        }
    }

    /// Waits for [IDLE_PERIOD] without new bytes, bounded by the timeout.
    fn wait_idle(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + self.timeout;
        let mut quiet_since = Instant::now();
        while Instant::now() < deadline {
            if self.poll()? > 0 {
                quiet_since = Instant::now();
            } else if quiet_since.elapsed() >= IDLE_PERIOD {
                break;
            }
            sleep(POLL_INTERVAL);
        }

        Ok(())
    }
}

/// Open the named port and synchronize with the device behind it
pub fn connect_port(name: &str) -> Result<Connection, Error> {
    let serial = SerialTransport::open(name)?;
    let mut connection = Connection::new(Box::new(serial));
    connection.begin()?;

    Ok(connection)
}

/// Probe every candidate port until one of them synchronizes
pub fn detect_device() -> Result<Connection, Error> {
    info!("detecting device...");

    for scan in 0..AUTODETECT_MAX_SCANS {
        for name in candidate_ports(AUTODETECT_MAX_PORTS)? {
            debug!("probing {name}");
            let Ok(serial) = SerialTransport::open(&name) else {
                continue;
            };

            let mut connection = Connection::new(Box::new(serial));
            connection.set_timeout(AUTODETECT_TIMEOUT);
            if scan == 0 && connection.enter_bootloader().is_err() {
                continue;
            }
            if connection.sync_attempt().is_ok() {
                info!("device found on {name} and successfully synced");
                connection.set_timeout(DEFAULT_TIMEOUT);
                return Ok(connection);
            }
            // port is closed when the failed connection is dropped
        }
    }

    Err(Error::NoDeviceDetected)
}
