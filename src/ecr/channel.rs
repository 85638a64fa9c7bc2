//! Command channel: one request/answer exchange per call.
//!
//! Also caches the command dialect negotiated for the current connection.
//! Any reconnect forgets it.

use crate::ecr::error::{EcrError, Result};
use crate::ecr::frame::{self, Frame, Opcode, Response};
use crate::ecr::session::TransportSession;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Command family the register understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Single-byte opcodes only; no fiscal storage command range.
    Legacy,
    /// Fiscal storage commands (`0xFFxx`) available.
    Modern,
}

pub struct CommandChannel {
    session: TransportSession,
    dialect: Option<Dialect>,
}

impl CommandChannel {
    pub fn new(session: TransportSession) -> Self {
        Self {
            session,
            dialect: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.dialect = None;
        self.session.connect()
    }

    pub fn disconnect(&mut self) {
        self.dialect = None;
        self.session.close();
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = Some(dialect);
    }

    /// Send one command and return the register's answer. A nonzero error
    /// code is a successful exchange; link failures close the session so
    /// the next call reconnects.
    pub fn send_command(&mut self, opcode: Opcode, params: &[u8]) -> Result<Response> {
        if !self.session.is_ready() {
            self.connect()?;
        }
        let frame = frame::encode(opcode, params)?;
        let result = self.exchange(opcode, &frame);
        if let Err(e) = &result {
            if e.is_link_failure() {
                warn!("{opcode} failed on the link, closing session: {e}");
                self.disconnect();
            }
        }
        result
    }

    fn exchange(&mut self, opcode: Opcode, frame: &[u8]) -> Result<Response> {
        let attempts = self.session.max_attempts();
        for attempt in 1..=attempts {
            debug!(attempt, "TX {opcode} ({} bytes): {:02X?}", frame.len(), frame);
            self.session.write_frame(frame)?;
            let Some(payload) = self.session.read_answer()? else {
                debug!(attempt, "{opcode} refused by register, retransmitting");
                continue;
            };
            let response = Frame::from_payload(&payload)?.into_response()?;
            if response.opcode != opcode {
                return Err(EcrError::ProtocolDesync(format!(
                    "sent {opcode}, register answered {}",
                    response.opcode
                )));
            }
            if !response.is_ok() {
                debug!("{opcode} answered with error 0x{:02X}", response.error_code);
            }
            return Ok(response);
        }
        Err(EcrError::ProtocolDesync(format!(
            "{opcode} not accepted within {attempts} attempts"
        )))
    }
}
