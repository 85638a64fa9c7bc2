//! Link session: handshake, timed frame reads and resynchronisation.
//!
//! The register speaks a half-duplex protocol. The host asks with ENQ; an
//! idle register answers NAK, a register holding an undelivered answer
//! answers ACK and then streams `STX | LEN | payload | LRC`. Every frame
//! read is paced by settle pauses, since the register streams with uneven
//! inter-byte gaps and eager reads drop bytes.

use crate::ecr::error::{EcrError, Result};
use crate::ecr::frame::{self, Command, ACK, ENQ, NAK, STX};
use crate::ecr::retry::{Clock, RetryPolicy};
use crate::ecr::transport::{EcrTransport, LinkConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
}

/// Result of one read round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Payload(Vec<u8>),
    /// The register refused the last frame; send it again.
    Retransmit,
    NoData,
}

pub struct TransportSession {
    transport: Box<dyn EcrTransport>,
    config: LinkConfig,
    clock: Arc<dyn Clock>,
    state: SessionState,
    /// Sent with the interrupt-output command during resync.
    admin_password: [u8; 4],
}

impl TransportSession {
    pub fn new(
        transport: Box<dyn EcrTransport>,
        config: LinkConfig,
        clock: Arc<dyn Clock>,
        admin_password: [u8; 4],
    ) -> Self {
        Self {
            transport,
            config,
            clock,
            state: SessionState::Disconnected,
            admin_password,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn description(&self) -> String {
        self.transport.description()
    }

    // -----------------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------------

    /// Open the link and bring the register to an idle state.
    pub fn connect(&mut self) -> Result<()> {
        self.state = SessionState::Handshaking;
        match self.handshake() {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!("Link {} ready", self.transport.description());
                Ok(())
            }
            Err(e) => {
                warn!("Handshake on {} failed: {e}", self.transport.description());
                self.close();
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> Result<()> {
        if !self.transport.is_open() {
            self.transport.open()?;
        }
        self.transport.set_timeout(self.config.byte_timeout())?;
        self.transport.clear_input()?;

        for attempt in 1..=self.config.max_attempts {
            self.send_enq()?;
            match self.read_byte()? {
                Some(NAK) => return Ok(()),
                Some(ACK) => {
                    debug!("Register holds an undelivered answer, clearing");
                    return self.clear_answer();
                }
                other => {
                    debug!(attempt, "No idle reply to ENQ: {other:02X?}");
                    self.transport.clear_input()?;
                }
            }
        }
        Err(EcrError::Transport(format!(
            "no reply to ENQ within {} attempts",
            self.config.max_attempts
        )))
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.state = SessionState::Disconnected;
    }

    // -----------------------------------------------------------------------
    // Resync
    // -----------------------------------------------------------------------

    /// Drain a stray pending answer until the register reports idle.
    pub fn clear_answer(&mut self) -> Result<()> {
        for _ in 0..2 {
            match self.read_byte()? {
                Some(NAK) => return Ok(()),
                Some(b) => self.consume_pending(b)?,
                None => self.send_nak()?,
            }
            self.send_enq()?;
        }
        self.interrupt_and_resync()
    }

    /// Discard the answer that starts with `first`, acknowledging it if it
    /// arrived intact.
    fn consume_pending(&mut self, first: u8) -> Result<()> {
        let start = if first == ACK {
            self.clock.sleep(self.config.settle());
            self.read_byte()?
        } else {
            Some(first)
        };
        if start == Some(STX) {
            if let ReadOutcome::Payload(p) = self.read_frame_tail()? {
                debug!("Discarded stale answer ({} bytes): {:02X?}", p.len(), p);
            }
        } else {
            self.send_nak()?;
        }
        Ok(())
    }

    /// Interrupt whatever the register is printing, then poll with a
    /// growing timeout until it reports idle.
    fn interrupt_and_resync(&mut self) -> Result<()> {
        warn!("Register still busy after drain, sending interrupt");
        let saved = self.transport.timeout();
        let policy = RetryPolicy::linear(
            self.config.max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
        );
        let result = self.resync_loop(&policy);
        self.transport.set_timeout(saved)?;
        result
    }

    fn resync_loop(&mut self, policy: &RetryPolicy) -> Result<()> {
        self.transport.set_timeout(policy.delay(0))?;
        let frame = frame::encode(Command::InterruptOutput.opcode(), &self.admin_password)?;
        self.transport.write_all(&frame)?;
        self.transport.clear_input()?;

        for attempt in 1..=policy.attempts {
            let timeout = policy.delay(attempt);
            self.transport.set_timeout(timeout)?;
            self.transport.write_all(&[ENQ])?;
            self.clock.sleep(timeout * 2);
            match self.read_byte()? {
                Some(NAK) => {
                    info!(attempt, "Register idle after interrupt");
                    return Ok(());
                }
                Some(b) => self.consume_pending(b)?,
                None => self.send_nak()?,
            }
        }
        Err(EcrError::ProtocolDesync(format!(
            "register did not settle within {} resync attempts",
            policy.attempts
        )))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// One read round.
    pub fn one_round_read(&mut self) -> Result<ReadOutcome> {
        match self.read_byte()? {
            None => Ok(ReadOutcome::NoData),
            Some(NAK) => Ok(ReadOutcome::Retransmit),
            Some(ACK) => {
                self.clock.sleep(self.config.settle());
                match self.read_byte()? {
                    Some(STX) => self.read_frame_tail(),
                    other => Err(EcrError::ProtocolDesync(format!(
                        "lost STX after ACK, got {other:02X?}"
                    ))),
                }
            }
            Some(STX) => self.read_frame_tail(),
            Some(b) => {
                warn!("Unexpected byte 0x{b:02X} on the line, flushing input");
                self.transport.clear_input()?;
                Ok(ReadOutcome::NoData)
            }
        }
    }

    /// Read `LEN | payload | LRC` after an STX and acknowledge it.
    fn read_frame_tail(&mut self) -> Result<ReadOutcome> {
        let settle = self.config.settle();
        self.clock.sleep(settle);
        let Some(len) = self.read_byte()? else {
            self.send_nak()?;
            return Ok(ReadOutcome::NoData);
        };
        self.clock.sleep(settle);
        let payload = self.read_bytes(len as usize)?;
        self.clock.sleep(settle);
        let received = self.read_byte()?;

        let mut covered = Vec::with_capacity(payload.len() + 1);
        covered.push(len);
        covered.extend_from_slice(&payload);
        let expected = frame::lrc(&covered);

        if payload.len() != len as usize || received != Some(expected) {
            warn!(
                "Bad answer frame: {}/{len} bytes, checksum {received:02X?} expected {expected:02X}",
                payload.len()
            );
            self.send_nak()?;
            return Ok(ReadOutcome::NoData);
        }
        self.send_ack()?;
        debug!("RX payload ({} bytes): {:02X?}", payload.len(), payload);
        Ok(ReadOutcome::Payload(payload))
    }

    /// Poll for an answer. `Ok(None)` means the register refused the frame
    /// and the caller must retransmit it.
    pub fn read_answer(&mut self) -> Result<Option<Vec<u8>>> {
        let attempts = self.config.max_attempts;
        for attempt in 1..=attempts {
            self.clock.sleep(self.config.byte_timeout());
            match self.one_round_read() {
                Ok(ReadOutcome::Payload(p)) => return Ok(Some(p)),
                Ok(ReadOutcome::Retransmit) => return Ok(None),
                Ok(ReadOutcome::NoData) => {}
                Err(EcrError::ProtocolDesync(msg)) => {
                    warn!(attempt, "{msg}");
                    self.transport.clear_input()?;
                }
                Err(e) => return Err(e),
            }
            self.send_enq()?;
        }
        Err(EcrError::ProtocolDesync(format!(
            "no valid answer within {attempts} attempts"
        )))
    }

    // -----------------------------------------------------------------------
    // Primitives
    // -----------------------------------------------------------------------

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.transport.write_all(frame)
    }

    pub fn send_enq(&mut self) -> Result<()> {
        self.transport.write_all(&[ENQ])
    }

    pub fn send_ack(&mut self) -> Result<()> {
        self.clock.sleep(self.config.byte_timeout());
        self.transport.write_all(&[ACK])
    }

    pub fn send_nak(&mut self) -> Result<()> {
        self.clock.sleep(self.config.byte_timeout());
        self.transport.write_all(&[NAK])
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let n = self.transport.read(&mut buf)?;
        Ok((n == 1).then_some(buf[0]))
    }

    /// Read up to `len` bytes, stopping early on timeout.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let n = self.transport.read(&mut out[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        out.truncate(got);
        Ok(out)
    }
}
