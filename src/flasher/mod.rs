//! Flash programming on top of an established [Connection].
//!
//! Programming an image is prepare, a bounded sequence of 1 KB block
//! writes, and a final flash-done exchange that may reboot the device.
//! When a previously written image is available the diff planner narrows
//! the work down to the erase-aligned regions that actually changed.

use std::borrow::Cow;

use log::{debug, info};

use self::diff::changed_regions;
use crate::{
    command::Command,
    connection::Connection,
    error::Error,
    progress::ProgressCallbacks,
};

pub mod diff;

/// Erase/alignment granularity of the flash.
pub const FLASH_SECTOR_SIZE: usize = 0x1000;
/// Bytes programmed per flash-write-block command.
pub const FLASH_WRITE_SIZE: usize = 0x400;
/// The ROM's erase rounds up to this many sectors, compensated for in
/// [get_erase_size].
const FLASH_SECTORS_PER_BLOCK: usize = 16;
/// Granularity the erase actually honors, used to round diff regions.
pub(crate) const ERASE_UNIT_SIZE: usize = 4 * FLASH_SECTOR_SIZE;
/// An incremental plan more fragmented than this is not worth the
/// per-region prepare overhead; flash everything instead.
const MAX_DIFF_REGIONS: usize = 3;
/// Fill byte for sector padding and partial blocks.
const PAD_BYTE: u8 = 0xFF;

/// Flashes images over one synchronized session.
pub struct Flasher {
    connection: Connection,
}

impl Flasher {
    pub fn new(connection: Connection) -> Self {
        Flasher { connection }
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Programs `data` at `address`, padded to the next sector boundary.
    ///
    /// With a `previous` image the diff planner limits the write to the
    /// changed regions, falling back to a full flash when the plan is too
    /// fragmented. Identical images return without any exchange.
    pub fn flash_image(
        &mut self,
        data: &[u8],
        address: u32,
        previous: Option<&[u8]>,
        mut progress: Option<&mut (dyn ProgressCallbacks + '_)>,
    ) -> Result<(), Error> {
        let image = pad_to_sector(data);

        let Some(previous) = previous else {
            return self.write_region(address, &image, progress.as_deref_mut());
        };

        let regions = changed_regions(&image, previous);
        if regions.is_empty() {
            info!("image at {address:#010x} is unchanged, nothing to write");
            return Ok(());
        }
        if regions.len() > MAX_DIFF_REGIONS {
            debug!(
                "{} changed regions, more than {MAX_DIFF_REGIONS}: flashing the whole image",
                regions.len()
            );
            return self.write_region(address, &image, progress.as_deref_mut());
        }

        info!(
            "incremental flash: {} of {} bytes changed",
            regions.iter().map(|r| r.length).sum::<usize>(),
            image.len()
        );
        for region in regions {
            self.write_region(
                address + region.offset as u32,
                &image[region.offset..region.offset + region.length],
                progress.as_deref_mut(),
            )?;
        }

        Ok(())
    }

    /// Prepares and writes one sector-aligned region.
    pub(crate) fn write_region(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: Option<&mut (dyn ProgressCallbacks + '_)>,
    ) -> Result<(), Error> {
        if address as usize % FLASH_SECTOR_SIZE != 0 || data.len() % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::Alignment {
                address,
                size: data.len() as u32,
            });
        }

        let blocks = data.len().div_ceil(FLASH_WRITE_SIZE);
        let erase_size = get_erase_size(address as usize, data.len());
        debug!(
            "writing {} bytes at {address:#010x}: erasing {erase_size} bytes, {blocks} blocks",
            data.len()
        );

        self.connection.command(Command::FlashBegin {
            erase_size: erase_size as u32,
            blocks: blocks as u32,
            block_size: FLASH_WRITE_SIZE as u32,
            offset: address,
        })?;

        if let Some(progress) = progress.as_deref_mut() {
            progress.init(address, blocks);
        }

        for (sequence, block) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
            self.connection.command(Command::FlashData {
                data: block,
                pad_to: FLASH_WRITE_SIZE,
                pad_byte: PAD_BYTE,
                sequence: sequence as u32,
            })?;

            if let Some(progress) = progress.as_deref_mut() {
                progress.update(sequence + 1);
            }
        }

        if let Some(progress) = progress.as_deref_mut() {
            progress.finish();
        }

        Ok(())
    }

    /// Leaves flash mode, optionally rebooting into the fresh firmware.
    pub fn finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.connection.command(Command::FlashEnd { reboot })
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

/// Pads `data` with the flash fill byte up to the next sector boundary.
pub fn pad_to_sector(data: &[u8]) -> Cow<'_, [u8]> {
    if data.len() % FLASH_SECTOR_SIZE == 0 && !data.is_empty() {
        return Cow::Borrowed(data);
    }

    let padded = data.len().div_ceil(FLASH_SECTOR_SIZE).max(1) * FLASH_SECTOR_SIZE;
    let mut image = data.to_vec();
    image.resize(padded, PAD_BYTE);

    Cow::Owned(image)
}

/// Erase size to request so the ROM's 16-sector rounding does not wipe far
/// more than asked for.
fn get_erase_size(offset: usize, size: usize) -> usize {
    let sector_count = size.div_ceil(FLASH_SECTOR_SIZE);
    let start_sector = offset / FLASH_SECTOR_SIZE;

    let head_sectors = usize::min(
        FLASH_SECTORS_PER_BLOCK - (start_sector % FLASH_SECTORS_PER_BLOCK),
        sector_count,
    );

    if sector_count < 2 * head_sectors {
        sector_count.div_ceil(2) * FLASH_SECTOR_SIZE
    } else {
        (sector_count - head_sectors) * FLASH_SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        command::CommandType,
        interface::mock::{MockTransport, Reply},
        slip::Deescaper,
    };

    fn flasher(mock: &MockTransport) -> Flasher {
        let mut connection = Connection::new(Box::new(mock.clone()));
        connection.set_timeout(Duration::from_millis(30));
        Flasher::new(connection)
    }

    /// De-escapes a captured frame and strips the delimiters.
    fn unframe(raw: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        Deescaper::new().feed(raw, &mut decoded);
        assert_eq!(decoded.first(), Some(&0xc0));
        assert_eq!(decoded.last(), Some(&0xc0));
        decoded[1..decoded.len() - 1].to_vec()
    }

    #[test]
    fn erase_size_compensates_for_rom_rounding() {
        assert_eq!(get_erase_size(0, 0x1000), 0x1000);
        assert_eq!(get_erase_size(0, 0x2000), 0x1000);
        assert_eq!(get_erase_size(0, 0x10000), 0x8000);
        assert_eq!(get_erase_size(0, 0x20000), 0x10000);
        assert_eq!(get_erase_size(0x1000, 0x10000), 0x8000);
        assert_eq!(get_erase_size(0x10000, 0x1000), 0x1000);
    }

    #[test]
    fn pad_to_sector_fills_with_ff() {
        let padded = pad_to_sector(&[0x01; 5000]);
        assert_eq!(padded.len(), 0x2000);
        assert!(padded[5000..].iter().all(|&b| b == 0xff));

        let aligned = [0x02; 0x1000];
        assert!(matches!(pad_to_sector(&aligned), Cow::Borrowed(_)));
    }

    #[test]
    fn unaligned_address_is_rejected_before_any_exchange() {
        let mock = MockTransport::new();
        let mut flasher = flasher(&mock);

        let err = flasher
            .flash_image(&[0u8; 0x1000], 1, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Alignment { address: 1, .. }));
        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn unaligned_size_is_rejected_before_any_exchange() {
        let mock = MockTransport::new();
        let mut flasher = flasher(&mock);

        let err = flasher
            .write_region(0, &[0u8; 0x1001], None)
            .unwrap_err();
        assert!(matches!(err, Error::Alignment { size: 0x1001, .. }));
        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn identical_images_skip_the_device_entirely() {
        let mock = MockTransport::new();
        let mut flasher = flasher(&mock);

        let image = vec![0xab; 3 * FLASH_SECTOR_SIZE];
        flasher.flash_image(&image, 0, Some(&image), None).unwrap();

        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn fragmented_diff_falls_back_to_a_full_flash() {
        let mock = MockTransport::new();
        let mut flasher = flasher(&mock);

        let image = vec![0x66; 16 * FLASH_SECTOR_SIZE];
        let mut previous = image.clone();
        for sector in [0, 5, 10, 15] {
            previous[sector * FLASH_SECTOR_SIZE] ^= 0x01;
        }

        flasher
            .flash_image(&image, 0, Some(&previous), None)
            .unwrap();

        // one prepare plus every block of the whole image
        let blocks = image.len() / FLASH_WRITE_SIZE;
        assert_eq!(mock.sent_count(), 1 + blocks);
    }

    #[test]
    fn incremental_flash_writes_only_the_changed_regions() {
        let mock = MockTransport::new();
        let mut flasher = flasher(&mock);

        let image = vec![0x42; 16 * FLASH_SECTOR_SIZE];
        let mut previous = image.clone();
        previous[5 * FLASH_SECTOR_SIZE + 1] ^= 0x01;

        flasher
            .flash_image(&image, 0, Some(&previous), None)
            .unwrap();

        // one 16 KB region: prepare plus 16 blocks
        assert_eq!(mock.sent_count(), 1 + ERASE_UNIT_SIZE / FLASH_WRITE_SIZE);

        let prepare = unframe(&mock.state.borrow().sent[0]);
        assert_eq!(prepare[1], CommandType::FlashBegin as u8);
        // region starts at the changed sector and spans one erase unit
        let payload = &prepare[8..];
        assert_eq!(&payload[12..16], &(5 * FLASH_SECTOR_SIZE as u32).to_le_bytes());
        assert_eq!(&payload[4..8], &16u32.to_le_bytes());
    }

    #[test]
    fn five_kilobyte_image_flashes_as_eight_padded_blocks() {
        let mock = MockTransport::new();
        let mut flasher = flasher(&mock);

        let image = vec![0x5a; 5000];
        flasher.flash_image(&image, 0, None, None).unwrap();
        flasher.finish(true).unwrap();

        let state = mock.state.borrow();
        // prepare, eight blocks, flash done
        assert_eq!(state.sent.len(), 10);

        let prepare = unframe(&state.sent[0]);
        assert_eq!(prepare[1], CommandType::FlashBegin as u8);
        let payload = &prepare[8..];
        assert_eq!(&payload[0..4], &(get_erase_size(0, 0x2000) as u32).to_le_bytes());
        assert_eq!(&payload[4..8], &8u32.to_le_bytes());
        assert_eq!(&payload[8..12], &1024u32.to_le_bytes());
        assert_eq!(&payload[12..16], &0u32.to_le_bytes());

        for (index, raw) in state.sent[1..9].iter().enumerate() {
            let frame = unframe(raw);
            assert_eq!(frame[1], CommandType::FlashData as u8);
            // block sub-header carries the sequence number
            assert_eq!(&frame[12..16], &(index as u32).to_le_bytes());
            assert_eq!(frame.len(), 8 + 16 + 1024);
        }

        // the image tail past 5000 bytes is all fill bytes: the fifth block
        // is partially padded and the final block is padding only
        let partial_block = unframe(&state.sent[5]);
        assert!(partial_block[24 + (5000 - 4 * 1024)..].iter().all(|&b| b == 0xff));
        let last_block = unframe(&state.sent[8]);
        assert!(last_block[24..].iter().all(|&b| b == 0xff));

        let done = unframe(&state.sent[9]);
        assert_eq!(done[1], CommandType::FlashEnd as u8);
        assert_eq!(&done[8..12], &1u32.to_le_bytes());
    }

    #[test]
    fn first_failing_block_aborts_the_image() {
        let mock = MockTransport::new();
        mock.script([Reply::Ok, Reply::Ok, Reply::Status(0x08)]);

        let mut flasher = flasher(&mock);
        let image = vec![0x5a; 2 * FLASH_SECTOR_SIZE];
        let err = flasher.flash_image(&image, 0, None, None).unwrap_err();

        assert!(matches!(err, Error::Rom(_)));
        // prepare, one good block, the failing block, nothing after
        assert_eq!(mock.sent_count(), 3);
    }
}
