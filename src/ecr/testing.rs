//! Simulated register for tests.
//!
//! [`SimDevice`] plays the device side of the link protocol over an
//! in-memory byte queue; [`FakeRegister`] answers the commands. Both halves
//! record what the host sent so tests can assert on traffic.

use crate::ecr::codepage::decode_cp1251;
use crate::ecr::error::Result;
use crate::ecr::frame::{self, Frame, Opcode, ACK, ENQ, NAK, STX};
use crate::ecr::money::read_le;
use crate::ecr::status::fixtures::{fn_status_data, status_data};
use crate::ecr::transport::EcrTransport;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Register behaviour
// ---------------------------------------------------------------------------

const OPERATOR: u8 = 30;
const FISCAL_SIGN: u32 = 0xA1B2_C3D4;
const DOC_TIME: [u8; 5] = [24, 5, 17, 18, 45];

#[derive(Debug, Clone, Default)]
pub struct FakeRegister {
    /// Answers every `0xFFxx` command with "unknown command".
    pub legacy: bool,
    pub shift_open: bool,
    pub shift_expired: bool,
    pub last_closed_shift: u16,
    /// Document type of the open check.
    pub check_open: Option<u8>,
    pub document_number: u32,
    pub fn_warnings: u8,
    pub money_registers: HashMap<u16, u64>,
    pub oper_registers: HashMap<u8, u16>,
    /// `(table, row, field)` → raw value.
    pub tables: HashMap<(u8, u16, u8), Vec<u8>>,
    pub awaiting_continue: bool,
    pub unsent_documents: u16,
    pub change_units: u64,
    pub(crate) failures: HashMap<u16, VecDeque<u8>>,

    /// `(opcode, tag, value)` for every TLV received.
    pub tags: Vec<(u16, u16, Vec<u8>)>,
    /// Raw `0xFF46` parameter blocks.
    pub lines: Vec<Vec<u8>>,
    /// Raw `0xFF45` parameter blocks.
    pub close_blocks: Vec<Vec<u8>>,
    pub printed: Vec<String>,
    pub opened_checks: Vec<u8>,
    pub cancels: u32,
    pub drawer_opens: u32,
}

impl FakeRegister {
    pub fn legacy() -> Self {
        Self {
            legacy: true,
            ..Self::default()
        }
    }

    pub fn with_open_shift(last_closed: u16) -> Self {
        Self {
            shift_open: true,
            last_closed_shift: last_closed,
            ..Self::default()
        }
    }

    /// Answer the next `opcode` with `code` instead of handling it.
    pub fn fail_next(&mut self, opcode: Opcode, code: u8) {
        self.failures.entry(opcode.0).or_default().push_back(code);
    }

    pub fn current_shift(&self) -> u16 {
        self.last_closed_shift + 1
    }

    fn mode(&self) -> u8 {
        match (self.check_open, self.shift_open) {
            (Some(kind), _) => 0x08 | (kind << 4),
            (None, true) if self.shift_expired => 3,
            (None, true) => 2,
            (None, false) => 4,
        }
    }

    pub fn handle(&mut self, op: Opcode, params: &[u8]) -> (u8, Vec<u8>) {
        if let Some(code) = self.failures.get_mut(&op.0).and_then(|q| q.pop_front()) {
            return (code, vec![]);
        }
        if self.awaiting_continue && !matches!(op.0, 0xB0 | 0x10 | 0x11) {
            return (0x58, vec![]);
        }
        if self.legacy && op.width() == 2 {
            return (0x01, vec![]);
        }
        match op.0 {
            0x03 => (0, vec![]),
            0x10 => {
                let mut d = vec![OPERATOR, 0x03, 0x00, self.mode(), self.submode()];
                d.resize(16, 0);
                (0, d)
            }
            0x11 => {
                let mut d = status_data(self.mode(), self.last_closed_shift);
                d[14] = self.submode();
                d[9..11].copy_from_slice(&(self.document_number as u16).to_le_bytes());
                (0, d)
            }
            0x13 => (0, vec![OPERATOR]),
            0x17 => {
                self.printed.push(decode_cp1251(params.get(5..).unwrap_or(&[])));
                (0, vec![OPERATOR])
            }
            0x1A => {
                let reg = match params.len() {
                    n if n >= 6 => read_le(&params[4..6]) as u16,
                    _ => params.get(4).copied().unwrap_or(0) as u16,
                };
                let value = self.money_registers.get(&reg).copied().unwrap_or(0);
                let mut d = vec![OPERATOR];
                d.extend_from_slice(&value.to_le_bytes()[..6]);
                (0, d)
            }
            0x1B => {
                let reg = params.get(4).copied().unwrap_or(0);
                let value = self.oper_registers.get(&reg).copied().unwrap_or(0);
                let mut d = vec![OPERATOR];
                d.extend_from_slice(&value.to_le_bytes());
                (0, d)
            }
            0x1F => {
                if params.len() < 8 {
                    return (0x33, vec![]);
                }
                let key = (params[4], read_le(&params[5..7]) as u16, params[7]);
                match self.tables.get(&key) {
                    Some(v) => (0, v.clone()),
                    None => (0x33, vec![]),
                }
            }
            0x28 => {
                self.drawer_opens += 1;
                (0, vec![OPERATOR])
            }
            0x41 => {
                if !self.shift_open {
                    return (0x3D, vec![]);
                }
                self.close_shift();
                (0, vec![OPERATOR])
            }
            0x88 => {
                if !self.shift_open {
                    return (0x3D, vec![]);
                }
                if self.check_open.take().is_none() {
                    return (0x55, vec![]);
                }
                self.cancels += 1;
                (0, vec![OPERATOR])
            }
            0x8D => {
                if !self.shift_open {
                    return (0x3D, vec![]);
                }
                if self.shift_expired {
                    return (0x4E, vec![]);
                }
                if self.check_open.is_some() {
                    return (0x4A, vec![]);
                }
                let kind = params.get(4).copied().unwrap_or(0);
                self.check_open = Some(kind);
                self.opened_checks.push(kind);
                (0, vec![OPERATOR])
            }
            0xB0 => {
                self.awaiting_continue = false;
                (0, vec![])
            }
            0xE0 => {
                if self.shift_open {
                    return (0x15, vec![]);
                }
                self.shift_open = true;
                (0, vec![OPERATOR])
            }
            0xFC => {
                let mut d = vec![0, 0, 1, 12, 7, 0];
                d.extend_from_slice(b"SIM-FR");
                (0, d)
            }
            0xFF01 => {
                let mut d = fn_status_data(self.shift_open, self.fn_warnings);
                d[26..30].copy_from_slice(&self.document_number.to_le_bytes());
                (0, d)
            }
            0xFF09 => {
                let mut d = vec![0u8; 48];
                d[0..5].copy_from_slice(&[23, 6, 1, 12, 0]);
                d[5..17].copy_from_slice(b"7701234567  ");
                d[17..37].copy_from_slice(b"0000000001012345    ");
                d[37] = 0b0000_0001;
                d[39..43].copy_from_slice(&1u32.to_le_bytes());
                d[43..47].copy_from_slice(&FISCAL_SIGN.to_le_bytes());
                (0, d)
            }
            0xFF39 => {
                let mut d = vec![0u8; 13];
                d[0] = 1;
                d[2..4].copy_from_slice(&self.unsent_documents.to_le_bytes());
                if self.unsent_documents > 0 {
                    d[4..8].copy_from_slice(&self.document_number.to_le_bytes());
                    d[8..13].copy_from_slice(&DOC_TIME);
                }
                (0, d)
            }
            0xFF40 => {
                let mut d = vec![self.shift_open as u8];
                d.extend_from_slice(&self.current_shift().to_le_bytes());
                d.extend_from_slice(&(self.lines.len() as u16).to_le_bytes());
                (0, d)
            }
            0xFF41 | 0xFF42 => (0, vec![]),
            0xFF0B => {
                if self.shift_open {
                    return (0x15, vec![]);
                }
                self.shift_open = true;
                self.document_number += 1;
                let mut d = self.current_shift().to_le_bytes().to_vec();
                d.extend_from_slice(&self.document_number.to_le_bytes());
                (0, d)
            }
            0xFF43 => {
                if !self.shift_open {
                    return (0x3D, vec![]);
                }
                let closed = self.current_shift();
                self.close_shift();
                self.document_number += 1;
                let mut d = closed.to_le_bytes().to_vec();
                d.extend_from_slice(&self.document_number.to_le_bytes());
                d.extend_from_slice(&FISCAL_SIGN.to_le_bytes());
                d.extend_from_slice(&DOC_TIME);
                (0, d)
            }
            0xFF0C | 0xFF4D => {
                if params.len() < 8 {
                    return (0x33, vec![]);
                }
                let tag = read_le(&params[4..6]) as u16;
                let len = read_le(&params[6..8]) as usize;
                let value = params[8..].iter().take(len).copied().collect();
                self.tags.push((op.0, tag, value));
                (0, vec![])
            }
            0xFF46 => {
                if self.check_open.is_none() {
                    return (0x55, vec![]);
                }
                self.lines.push(params.to_vec());
                (0, vec![])
            }
            0xFF45 => {
                if self.check_open.take().is_none() {
                    return (0x55, vec![]);
                }
                self.close_blocks.push(params.to_vec());
                self.document_number += 1;
                let mut d = self.change_units.to_le_bytes()[..5].to_vec();
                d.extend_from_slice(&self.document_number.to_le_bytes());
                d.extend_from_slice(&FISCAL_SIGN.to_le_bytes());
                d.extend_from_slice(&DOC_TIME);
                (0, d)
            }
            _ => (0x01, vec![]),
        }
    }

    fn submode(&self) -> u8 {
        if self.awaiting_continue {
            3
        } else {
            0
        }
    }

    fn close_shift(&mut self) {
        self.shift_open = false;
        self.shift_expired = false;
        self.last_closed_shift += 1;
    }
}

// ---------------------------------------------------------------------------
// Link simulation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SimState {
    register: FakeRegister,
    open: bool,
    silent: bool,
    timeout: Duration,
    /// Bytes waiting for the host to read.
    outbound: VecDeque<u8>,
    /// Answer not yet acknowledged by the host.
    pending: Option<Vec<u8>>,
    enq_override: VecDeque<Vec<u8>>,
    corrupt_requests: u32,
    corrupt_answers: u32,
    opcode_override: Option<Opcode>,

    host_control: Vec<u8>,
    host_frames: Vec<Vec<u8>>,
    commands: Vec<(Opcode, Vec<u8>)>,
    device_naks: u32,
}

impl SimState {
    fn on_host_frame(&mut self, data: &[u8]) {
        self.host_frames.push(data.to_vec());
        if self.corrupt_requests > 0 {
            self.corrupt_requests -= 1;
            self.reject();
            return;
        }
        let Ok(request) = Frame::decode(data) else {
            self.reject();
            return;
        };
        self.commands.push((request.opcode, request.body.clone()));
        let (code, data) = self.register.handle(request.opcode, &request.body);

        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(code);
        payload.extend_from_slice(&data);
        let opcode = self.opcode_override.take().unwrap_or(request.opcode);
        let Ok(answer) = frame::encode(opcode, &payload) else {
            self.reject();
            return;
        };
        let mut wire = answer.clone();
        if self.corrupt_answers > 0 {
            self.corrupt_answers -= 1;
            let idx = wire.len() - 2;
            wire[idx] ^= 0x5A;
        }
        self.pending = Some(answer);
        self.outbound.push_back(ACK);
        self.outbound.extend(wire);
    }

    fn on_enq(&mut self) {
        if let Some(bytes) = self.enq_override.pop_front() {
            self.outbound.extend(bytes);
        } else if let Some(answer) = &self.pending {
            self.outbound.push_back(ACK);
            self.outbound.extend(answer.iter().copied());
        } else {
            self.outbound.push_back(NAK);
        }
    }

    fn reject(&mut self) {
        self.device_naks += 1;
        self.outbound.push_back(NAK);
    }
}

/// In-memory device end of a serial link. Clones share state, so a test
/// keeps one clone while the session owns another.
#[derive(Clone, Default)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new(register: FakeRegister) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                register,
                ..SimState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_register<R>(&self, f: impl FnOnce(&mut FakeRegister) -> R) -> R {
        f(&mut self.state().register)
    }

    /// Leave an undelivered answer behind, as after a host crash mid-read.
    pub fn hold_stale_answer(&self, opcode: Opcode, code: u8, data: &[u8]) {
        let mut payload = vec![code];
        payload.extend_from_slice(data);
        let answer = frame::encode(opcode, &payload).unwrap();
        self.state().pending = Some(answer);
    }

    pub fn has_pending(&self) -> bool {
        self.state().pending.is_some()
    }

    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Put bytes on the line as if the register sent them unprompted.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.state().outbound.extend(bytes.iter().copied());
    }

    /// Answer the next ENQ with `bytes` instead of the protocol reply.
    pub fn queue_after_enq(&self, bytes: &[u8]) {
        self.state().enq_override.push_back(bytes.to_vec());
    }

    pub fn commands(&self) -> Vec<(Opcode, Vec<u8>)> {
        self.state().commands.clone()
    }

    pub fn opcodes(&self) -> Vec<u16> {
        self.state().commands.iter().map(|c| c.0 .0).collect()
    }

    pub fn control_sent_by_host(&self) -> Vec<u8> {
        self.state().host_control.clone()
    }

    pub fn frames_from_host(&self) -> Vec<Vec<u8>> {
        self.state().host_frames.clone()
    }

    pub fn naks_sent_by_device(&self) -> u32 {
        self.state().device_naks
    }

    /// Refuse the next `n` host frames as if they arrived damaged.
    pub fn corrupt_next_requests(&self, n: u32) {
        self.state().corrupt_requests = n;
    }

    /// Damage one data byte of the next `n` answers on the wire.
    pub fn corrupt_next_answers(&self, n: u32) {
        self.state().corrupt_answers = n;
    }

    /// Echo `opcode` instead of the request's in the next answer.
    pub fn answer_with_opcode(&self, opcode: Opcode) {
        self.state().opcode_override = Some(opcode);
    }
}

impl EcrTransport for SimDevice {
    fn open(&mut self) -> Result<()> {
        self.state().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut st = self.state();
        match data {
            [ENQ] => {
                st.host_control.push(ENQ);
                if !st.silent {
                    st.on_enq();
                }
            }
            [ACK] => {
                st.host_control.push(ACK);
                st.pending = None;
            }
            [NAK] => st.host_control.push(NAK),
            [STX, ..] if !st.silent => st.on_host_frame(data),
            _ => {}
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state();
        let mut n = 0;
        while n < buf.len() {
            match st.outbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.state().timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    fn clear_input(&mut self) -> Result<()> {
        self.state().outbound.clear();
        Ok(())
    }

    fn description(&self) -> String {
        "sim".to_string()
    }
}
