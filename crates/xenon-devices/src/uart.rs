//! UART back-ends for the SMC serial sub-channel. Both present the same
//! byte-oriented `{write, read, read_status}` contract so the SMC core
//! doesn't need to know which transport is wired in.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use tracing::{info, warn};

pub const UART_STATUS_EMPTY: u32 = 0x02;
pub const UART_STATUS_DATA_READY: u32 = 0x01;

pub trait UartBackend: Send {
    fn write(&mut self, byte: u8);
    fn read(&mut self) -> Option<u8>;
    fn read_status(&mut self) -> u32;
}

/// Pushes/pulls bytes over a TCP stream, letting a remote debugger or
/// terminal sit on the other end.
pub struct SocketUart {
    stream: Option<TcpStream>,
}

impl SocketUart {
    pub fn connect(ip: &str, port: u16) -> Self {
        match TcpStream::connect((ip, port)) {
            Ok(stream) => {
                let _ = stream.set_nonblocking(true);
                info!(ip, port, "uart: connected socket transport");
                Self { stream: Some(stream) }
            }
            Err(err) => {
                warn!(ip, port, %err, "uart: failed to connect socket transport");
                Self { stream: None }
            }
        }
    }
}

impl UartBackend for SocketUart {
    fn write(&mut self, byte: u8) {
        if let Some(stream) = &mut self.stream {
            let _ = stream.write_all(&[byte]);
        }
    }

    fn read(&mut self) -> Option<u8> {
        let stream = self.stream.as_mut()?;
        let mut byte = [0u8; 1];
        match stream.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            Ok(_) => None,
            Err(err) if err.kind() == ErrorKind::WouldBlock => None,
            Err(_) => None,
        }
    }

    fn read_status(&mut self) -> u32 {
        if self.stream.is_some() {
            UART_STATUS_EMPTY
        } else {
            0
        }
    }
}

/// Logs bytes instead of transmitting them. Used for the `"print"`
/// transport and as the fallback for `"vcom"` on platforms without a
/// native virtual-COM backend (the original only implements vcom under
/// `_WIN32`).
pub struct PrintUart;

impl UartBackend for PrintUart {
    fn write(&mut self, byte: u8) {
        info!(byte, ch = %(byte as char), "uart(print): tx");
    }

    fn read(&mut self) -> Option<u8> {
        None
    }

    fn read_status(&mut self) -> u32 {
        UART_STATUS_EMPTY
    }
}
