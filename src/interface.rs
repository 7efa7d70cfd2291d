//! The byte-stream transport consumed by the connection layer.
//!
//! [`Transport`] is the seam between the protocol engine and the OS serial
//! plumbing: raw sends, draining whatever has arrived, and the two control
//! lines used to bounce the device into its bootloader.

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::{available_ports, SerialPort};

use crate::error::ConnectionError;

const BAUD_RATE: u32 = 115_200;

/// Byte-stream transport to a candidate device.
pub trait Transport {
    /// Sends raw, already framed bytes.
    fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Drains every byte that has arrived since the last call into `sink`,
    /// without blocking. Returns the number of bytes appended.
    fn read_available(&mut self, sink: &mut Vec<u8>) -> Result<usize, ConnectionError>;

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), ConnectionError>;

    fn write_request_to_send(&mut self, level: bool) -> Result<(), ConnectionError>;

    fn name(&self) -> Option<String>;
}

/// [`Transport`] backed by a serial port.
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Opens `name` at the fixed bootloader baud rate.
    pub fn open(name: &str) -> Result<Self, ConnectionError> {
        let serial = serialport::new(name, BAUD_RATE)
            .timeout(Duration::from_millis(10))
            .open()?;

        Ok(SerialTransport { serial })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.serial.write_all(data)?;
        self.serial.flush()?;
        Ok(())
    }

    fn read_available(&mut self, sink: &mut Vec<u8>) -> Result<usize, ConnectionError> {
        let available = self.serial.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(0);
        }

        let mut buf = vec![0; available];
        self.serial.read_exact(&mut buf)?;
        sink.extend_from_slice(&buf);

        Ok(available)
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), ConnectionError> {
        self.serial.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> Result<(), ConnectionError> {
        self.serial.write_request_to_send(level)?;
        Ok(())
    }

    fn name(&self) -> Option<String> {
        self.serial.name()
    }
}

/// Lists candidate port names for auto-detection, bounded to `limit`.
pub fn candidate_ports(limit: usize) -> Result<Vec<String>, ConnectionError> {
    let mut names: Vec<String> = available_ports()?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    names.sort();
    names.truncate(limit);

    Ok(names)
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport for exercising the engine without hardware.

    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use super::Transport;
    use crate::error::ConnectionError;

    /// What the device does in reaction to the next request.
    pub enum Reply {
        /// Well-formed success response echoing the request's command.
        Ok,
        /// No bytes at all, the engine has to time out.
        Silence,
        /// Success framing but a non-zero status/code pair in the tail.
        Status(u8),
        /// Arbitrary raw bytes.
        Raw(Vec<u8>),
    }

    #[derive(Default)]
    pub struct MockState {
        pub sent: Vec<Vec<u8>>,
        pub script: VecDeque<Reply>,
        pub dtr: Vec<bool>,
        pub rts: Vec<bool>,
        pending: Vec<u8>,
    }

    /// Builds the raw wire bytes of a response to `command`.
    pub fn response(command: u8, status: u8, code: u8) -> Vec<u8> {
        vec![
            0xc0, 0x01, command, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, status, code, 0xc0,
        ]
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub state: Rc<RefCell<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
            self.state.borrow_mut().script.extend(replies);
        }

        pub fn sent_count(&self) -> usize {
            self.state.borrow().sent.len()
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
            let mut state = self.state.borrow_mut();
            // command byte sits at raw offset 2; the header is never escaped
            // for the commands under test
            let command = data[2];
            let reply = state.script.pop_front().unwrap_or(Reply::Ok);
            state.pending = match reply {
                Reply::Ok => response(command, 0, 0),
                Reply::Silence => Vec::new(),
                Reply::Status(code) => response(command, 0x01, code),
                Reply::Raw(bytes) => bytes,
            };
            state.sent.push(data.to_vec());
            Ok(())
        }

        fn read_available(&mut self, sink: &mut Vec<u8>) -> Result<usize, ConnectionError> {
            let mut state = self.state.borrow_mut();
            let len = state.pending.len();
            sink.append(&mut state.pending);
            Ok(len)
        }

        fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), ConnectionError> {
            self.state.borrow_mut().dtr.push(level);
            Ok(())
        }

        fn write_request_to_send(&mut self, level: bool) -> Result<(), ConnectionError> {
            self.state.borrow_mut().rts.push(level);
            Ok(())
        }

        fn name(&self) -> Option<String> {
            Some("mock".into())
        }
    }
}
