//! Byte-level link to a fiscal register.
//!
//! Defines the `EcrTransport` trait the session drives and the serial
//! implementation on top of the `serialport` crate.

use crate::ecr::error::{EcrError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Link configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial link settings for one register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub data_bits: u8,
    /// Read timeout for a single byte. The settle pause between frame
    /// sub-reads is twice this.
    pub byte_timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            parity: Parity::None,
            stop_bits: 1,
            data_bits: 8,
            byte_timeout_ms: 50,
            max_attempts: 12,
        }
    }
}

impl LinkConfig {
    pub fn byte_timeout(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms * 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(EcrError::Config("serial port path is empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(EcrError::Config("baud rate must be positive".into()));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(EcrError::Config(format!("unsupported stop bits {}", self.stop_bits)));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(EcrError::Config(format!("unsupported data bits {}", self.data_bits)));
        }
        if self.max_attempts == 0 {
            return Err(EcrError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstract byte-level transport for a register.
pub trait EcrTransport: Send {
    /// Open the underlying link.
    fn open(&mut self) -> Result<()>;

    /// Close the link. Closing a closed link is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write and flush all bytes.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes within the current timeout.
    /// Returns `Ok(0)` when the timeout elapses with nothing received.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    fn timeout(&self) -> Duration;

    /// Discard anything waiting in the input buffer.
    fn clear_input(&mut self) -> Result<()>;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

/// Serial (RS-232 / USB-serial) transport using the `serialport` crate.
pub struct SerialTransport {
    config: LinkConfig,
    timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn new(config: LinkConfig) -> Self {
        let timeout = config.byte_timeout();
        Self {
            config,
            timeout,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        let name = &self.config.port;
        self.port
            .as_mut()
            .ok_or_else(|| EcrError::Transport(format!("serial port {name} not open")))
    }
}

impl EcrTransport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        let c = &self.config;
        info!("Opening serial port {} @ {} baud", c.port, c.baud_rate);

        let parity = match c.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let stop_bits = if c.stop_bits == 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };
        let data_bits = match c.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };

        let port = serialport::new(&c.port, c.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits)
            .timeout(self.timeout)
            .open()
            .map_err(|e| EcrError::Transport(format!("failed to open {}: {e}", c.port)))?;

        self.port = Some(port);
        info!("Serial port {} open", self.config.port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Serial port {} closed", self.config.port);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;
        debug!("Serial TX ({} bytes): {:02X?}", data.len(), data);
        port.write_all(data)
            .map_err(|e| EcrError::Transport(format!("serial write error: {e}")))?;
        port.flush()
            .map_err(|e| EcrError::Transport(format!("serial flush error: {e}")))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let port = self.port()?;
        match port.read(buf) {
            Ok(n) => {
                debug!("Serial RX ({n} bytes): {:02X?}", &buf[..n]);
                Ok(n)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(EcrError::Transport(format!("serial read error: {e}"))),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)
                .map_err(|e| EcrError::Transport(format!("set timeout: {e}")))?;
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_input(&mut self) -> Result<()> {
        let port = self.port()?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| EcrError::Transport(format!("clear input: {e}")))
    }

    fn description(&self) -> String {
        format!("Serial {} @ {} baud", self.config.port, self.config.baud_rate)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the transport for a link configuration.
pub fn create_transport(config: &LinkConfig) -> Result<Box<dyn EcrTransport>> {
    config.validate()?;
    Ok(Box::new(SerialTransport::new(config.clone())))
}
