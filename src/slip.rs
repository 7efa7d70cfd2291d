//! SLIP-style framing used by the ROM bootloader serial protocol.
//!
//! Requests are wrapped in `0xC0` delimiters with `0xC0`/`0xDB` escaped
//! inside the body. The receive side only de-escapes: delimiters pass
//! through into the receive buffer and are validated later by the
//! request/response engine.

use std::io::Write;

use log::debug;

/// Frame delimiter, also visible in the de-escaped receive buffer.
pub(crate) const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Escaping writer that wraps everything written between two `END` bytes.
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context, writing the opening delimiter.
    pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
        writer.write_all(&[END])?;
        Ok(Self { writer, len: 1 })
    }

    /// Writes the closing delimiter and returns the framed length.
    pub fn finish(self) -> std::io::Result<usize> {
        self.writer.write_all(&[END])?;
        Ok(self.len + 1)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.writer.write_all(&[ESC, ESC_END])?;
                    self.len += 2;
                }
                ESC => {
                    self.writer.write_all(&[ESC, ESC_ESC])?;
                    self.len += 2;
                }
                _ => {
                    self.writer.write_all(&[*value])?;
                    self.len += 1;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Incremental de-escaper for the receive path.
///
/// The escape state is a single pending flag; a malformed escape sequence
/// drops the offending byte and carries on, since stray bytes are expected
/// on the wire while the device transitions into the bootloader. Frame
/// delimiters are appended to the sink unchanged.
#[derive(Debug, Default)]
pub struct Deescaper {
    escape: bool,
}

impl Deescaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the pending-escape flag, called before every new request.
    pub fn reset(&mut self) {
        self.escape = false;
    }

    /// De-escapes `raw` into `sink`.
    pub fn feed(&mut self, raw: &[u8], sink: &mut Vec<u8>) {
        for &value in raw {
            if self.escape {
                match value {
                    ESC_END => sink.push(END),
                    ESC_ESC => sink.push(ESC),
                    other => debug!("invalid escape byte {other:#04x}, dropped"),
                }
                self.escape = false;
            } else if value == ESC {
                self.escape = true;
            } else {
                sink.push(value);
            }
        }
    }
}
