use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, warn};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use super::protocol::{self, TERMINATOR};
use crate::error::StageError;

/// Byte-level link to the controller.
///
/// `read_line` returns one reply with its terminator still attached and
/// fails with `ErrorKind::TimedOut` when the link's read timeout elapses.
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn read_line(&mut self) -> io::Result<String>;
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Serial link settings for the ProScan controller.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "COM8".to_string(),
            baud_rate: 9600,
            read_timeout: Duration::from_secs(1),
        }
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    pub fn open(settings: &SerialSettings) -> Result<Self, StageError> {
        debug!(
            "Opening serial port {} at {} baud",
            settings.port, settings.baud_rate
        );
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| {
                StageError::transport(io::Error::from(e), format!("opening {}", settings.port))
            })?;

        Ok(Self {
            port,
            name: settings.port.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed mid-reply",
                    ));
                }
                _ => {
                    line.push(byte[0]);
                    if byte[0] == TERMINATOR as u8 {
                        break;
                    }
                }
            }
        }
        String::from_utf8(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Synchronous request/response channel over one exclusively owned link.
///
/// Taking `&mut self` for every operation keeps a `send` and its `receive`
/// from being interleaved with another caller's.
pub struct CommandChannel {
    transport: Box<dyn Transport>,
}

impl CommandChannel {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
        }
    }

    pub fn send(&mut self, command: &str) -> Result<(), StageError> {
        let line = protocol::normalize(command);
        debug!("-> {:?}", line);
        self.transport
            .write_all(line.as_bytes())
            .map_err(|e| StageError::transport(e, format!("writing `{}`", command.trim_end())))
    }

    /// Read one reply line, terminator removed.
    pub fn receive(&mut self) -> Result<String, StageError> {
        let line = self
            .transport
            .read_line()
            .map_err(|e| StageError::transport(e, "reading controller reply"))?;
        debug!("<- {:?}", line);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Send a command and block for its single reply line.
    ///
    /// Stale input, such as a late TTL acknowledgement, is discarded first
    /// so the reply read belongs to this command.
    pub fn send_and_receive(&mut self, command: &str) -> Result<String, StageError> {
        if let Err(e) = self.transport.discard_input() {
            warn!("Could not clear stale input before `{}`: {}", command, e);
        }
        self.send(command)?;
        self.receive()
            .map_err(|e| match e {
                StageError::Transport { source, .. } => StageError::transport(
                    source,
                    format!("reading reply to `{}`", command.trim_end()),
                ),
                other => other,
            })
    }

    /// Drop any pending reply without reading it.
    pub fn flush(&mut self) -> Result<(), StageError> {
        self.transport
            .discard_input()
            .map_err(|e| StageError::transport(e, "discarding input"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::simulator::SimulatedProScan;

    #[test]
    fn test_send_appends_terminator() {
        let (device, handle) = SimulatedProScan::new();
        let mut channel = CommandChannel::new(device);

        channel.send("J").unwrap();
        channel.send("H\r").unwrap();

        assert_eq!(handle.raw_writes(), vec!["J\r".to_string(), "H\r".to_string()]);
    }

    #[test]
    fn test_send_and_receive_strips_terminator() {
        let (device, _handle) = SimulatedProScan::new();
        let mut channel = CommandChannel::new(device);

        assert_eq!(channel.send_and_receive("COMP").unwrap(), "0");
        assert_eq!(channel.send_and_receive("P").unwrap(), "0,0,0");
    }

    #[test]
    fn test_stale_reply_is_discarded() {
        let (device, _handle) = SimulatedProScan::new();
        let mut channel = CommandChannel::new(device);

        // TTL acknowledgement left unread on purpose
        channel.send("TTL 1, 1").unwrap();
        assert_eq!(channel.send_and_receive("P").unwrap(), "0,0,0");
    }

    #[test]
    fn test_read_timeout_is_transport_error() {
        let (device, _handle) = SimulatedProScan::new();
        let mut channel = CommandChannel::new(device);

        let err = channel.receive().unwrap_err();
        match err {
            StageError::Transport { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_write_failure_propagates() {
        let (device, handle) = SimulatedProScan::new();
        let mut channel = CommandChannel::new(device);
        handle.disconnect();

        assert!(matches!(
            channel.send_and_receive("COMP"),
            Err(StageError::Transport { .. })
        ));
        assert!(matches!(channel.send("TTL 0, 1"), Err(StageError::Transport { .. })));
    }
}
