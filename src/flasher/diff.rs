//! Incremental diff planning.
//!
//! Compares a sector-padded image against the image previously written to
//! the device and yields the regions that actually need reprogramming. Run
//! lengths are rounded up to the 16 KB granularity the device's erase
//! honors, so a region is always safe to erase in isolation.

use super::{ERASE_UNIT_SIZE, FLASH_SECTOR_SIZE};

/// A contiguous byte range within the image, relative to the image start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub length: usize,
}

/// Computes the erase-aligned regions where `image` differs from `previous`.
///
/// `image` must already be padded to a sector multiple. Where `previous` is
/// shorter than `image` the missing tail counts as changed, so a grown image
/// always gets its new sectors written.
pub fn changed_regions(image: &[u8], previous: &[u8]) -> Vec<Region> {
    debug_assert_eq!(image.len() % FLASH_SECTOR_SIZE, 0);

    let sectors = image.len() / FLASH_SECTOR_SIZE;
    let mut regions = Vec::new();

    let mut sector = 0;
    while sector < sectors {
        if !sector_differs(image, previous, sector) {
            sector += 1;
            continue;
        }

        let start = sector;
        let mut end = sector + 1;
        while end < sectors && sector_differs(image, previous, end) {
            end += 1;
        }

        let offset = start * FLASH_SECTOR_SIZE;
        let length = ((end - start) * FLASH_SECTOR_SIZE)
            .div_ceil(ERASE_UNIT_SIZE)
            * ERASE_UNIT_SIZE;
        // the extension may overshoot the image end
        let length = length.min(image.len() - offset);

        regions.push(Region { offset, length });
        sector = start + length / FLASH_SECTOR_SIZE;
    }

    regions
}

fn sector_differs(image: &[u8], previous: &[u8], sector: usize) -> bool {
    let start = sector * FLASH_SECTOR_SIZE;
    let end = start + FLASH_SECTOR_SIZE;
    if previous.len() < end {
        return true;
    }

    image[start..end] != previous[start..end]
}
