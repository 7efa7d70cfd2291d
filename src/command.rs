//! Requests understood by the ROM bootloader.
//!
//! Every request on the wire is `[magic=0x00][command][size:u16 LE]
//! [checksum:u32 LE][payload]`, SLIP-framed by the connection layer. The
//! checksum is an 8-bit XOR fold of the payload widened to 32 bits; for
//! block writes it covers the (padded) block data but not the 16-byte
//! block sub-header.

use std::{io::Write, mem::size_of};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

/// Seed for the request checksum.
pub const CHECKSUM_INIT: u8 = 0xEF;

/// XOR-folds `data` into an 8-bit accumulator.
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Commands supported by the ROM bootloader flashing workflow.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
}

/// A request to be sent to the device.
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        erase_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    Sync,
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::Sync => CommandType::Sync,
        }
    }

    /// Serializes the request header and payload into `writer`.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                erase_size,
                blocks,
                block_size,
                offset,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct BeginParams {
                    erase_size: u32,
                    blocks: u32,
                    block_size: u32,
                    offset: u32,
                }
                let params = BeginParams {
                    erase_size,
                    blocks,
                    block_size,
                    offset,
                };
                write_basic(writer, bytes_of(&params))?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                write_basic(writer, &u32::from(reboot).to_le_bytes())?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                )?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&u32::from(checksum(data, CHECKSUM_INIT)).to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&(total_length as u16).to_le_bytes())?;
    writer.write_all(&u32::from(check).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(command: Command) -> Vec<u8> {
        let mut out = Vec::new();
        command.write(&mut out).unwrap();
        out
    }

    #[test]
    fn checksum_is_deterministic() {
        let data = [0x12, 0x34, 0x56, 0x00, 0xff];
        assert_eq!(
            checksum(&data, CHECKSUM_INIT),
            checksum(&data, CHECKSUM_INIT)
        );
        assert_eq!(checksum(&[], CHECKSUM_INIT), CHECKSUM_INIT);
    }

    #[test]
    fn checksum_detects_single_bit_flips() {
        let data = [0x12, 0x34, 0x56, 0x00, 0xff];
        let reference = checksum(&data, CHECKSUM_INIT);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[byte] ^= 1 << bit;
                assert_ne!(checksum(&flipped, CHECKSUM_INIT), reference);
            }
        }
    }

    #[test]
    fn flash_begin_layout() {
        let out = serialize(Command::FlashBegin {
            erase_size: 0x1000,
            blocks: 8,
            block_size: 0x400,
            offset: 0,
        });

        // magic, command, size, checksum over the 16-byte payload
        assert_eq!(&out[..8], &[0x00, 0x02, 0x10, 0x00, 0xf3, 0x00, 0x00, 0x00]);
        assert_eq!(&out[8..12], &0x1000u32.to_le_bytes());
        assert_eq!(&out[12..16], &8u32.to_le_bytes());
        assert_eq!(&out[16..20], &0x400u32.to_le_bytes());
        assert_eq!(&out[20..24], &0u32.to_le_bytes());
        assert_eq!(out.len(), 24);
    }

    #[test]
    fn flash_data_pads_and_checksums_data_only() {
        let data = [0xaa, 0xbb];
        let out = serialize(Command::FlashData {
            data: &data,
            pad_to: 4,
            pad_byte: 0xff,
            sequence: 7,
        });

        // declared size covers sub-header plus padded block
        assert_eq!(&out[2..4], &20u16.to_le_bytes());
        // checksum over data and pad bytes, not the sub-header
        let expected = CHECKSUM_INIT ^ 0xaa ^ 0xbb ^ 0xff ^ 0xff;
        assert_eq!(&out[4..8], &u32::from(expected).to_le_bytes());
        // sub-header: padded size, sequence, two zero words
        assert_eq!(&out[8..12], &4u32.to_le_bytes());
        assert_eq!(&out[12..16], &7u32.to_le_bytes());
        assert_eq!(&out[16..24], &[0; 8]);
        assert_eq!(&out[24..], &[0xaa, 0xbb, 0xff, 0xff]);
    }

    #[test]
    fn flash_end_carries_reboot_flag() {
        let out = serialize(Command::FlashEnd { reboot: true });
        assert_eq!(&out[..2], &[0x00, 0x04]);
        assert_eq!(&out[2..4], &4u16.to_le_bytes());
        assert_eq!(&out[8..], &1u32.to_le_bytes());
    }

    #[test]
    fn sync_payload() {
        let out = serialize(Command::Sync);
        assert_eq!(&out[..2], &[0x00, 0x08]);
        assert_eq!(&out[2..4], &36u16.to_le_bytes());
        assert_eq!(&out[4..8], &0xddu32.to_le_bytes());
        assert_eq!(out.len(), 8 + 36);
        assert_eq!(&out[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(out[12..].iter().all(|&b| b == 0x55));
    }
}
