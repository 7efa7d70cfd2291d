//! Control-line sequences for getting the device into and out of the
//! bootloader. RTS is wired to the bootstrap pin, DTR to reset.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, interface::Transport};

/// Time the lines are held between transitions.
const RESET_DELAY: Duration = Duration::from_millis(50);

/// Some strategy for resetting a target device
pub trait ResetStrategy {
    fn reset(&self, serial: &mut dyn Transport) -> Result<(), Error>;

    fn set_dtr(&self, serial: &mut dyn Transport, level: bool) -> Result<(), Error> {
        serial.write_data_terminal_ready(level)?;

        Ok(())
    }

    fn set_rts(&self, serial: &mut dyn Transport, level: bool) -> Result<(), Error> {
        serial.write_request_to_send(level)?;

        Ok(())
    }
}

/// Holds the bootstrap pin while pulsing reset, so that the device wakes up
/// in its ROM bootloader.
#[derive(Debug, Clone, Copy)]
pub struct BootloaderReset;

impl ResetStrategy for BootloaderReset {
    fn reset(&self, serial: &mut dyn Transport) -> Result<(), Error> {
        debug!("resetting device into bootloader mode");

        self.set_dtr(serial, false)?;
        self.set_rts(serial, true)?;

        sleep(RESET_DELAY);

        self.set_dtr(serial, true)?;
        self.set_rts(serial, false)?;

        sleep(RESET_DELAY);

        self.set_dtr(serial, false)?;

        Ok(())
    }
}

/// Pulses reset with the bootstrap pin released, rebooting into firmware.
#[derive(Debug, Clone, Copy)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    fn reset(&self, serial: &mut dyn Transport) -> Result<(), Error> {
        debug!("hard resetting device");

        self.set_dtr(serial, false)?;

        sleep(RESET_DELAY);

        self.set_dtr(serial, true)?;

        sleep(RESET_DELAY);

        self.set_dtr(serial, false)?;

        Ok(())
    }
}
