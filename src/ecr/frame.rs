//! Wire frame codec.
//!
//! Frame format: `STX | LEN | OPCODE(1 or 2) | PARAMS(0..250) | LRC`
//!
//! `LEN` counts opcode and parameter bytes. `LRC` is the XOR of every byte
//! from `LEN` through the last parameter byte. Two-byte opcodes (the fiscal
//! storage command range `0xFF00..`) go out big-endian, so a decoder can tell
//! the width from the leading `0xFF`.

use crate::ecr::error::{EcrError, Result};
use std::fmt;

// ---------------------------------------------------------------------------
// Control bytes
// ---------------------------------------------------------------------------

pub const ENQ: u8 = 0x05;
pub const STX: u8 = 0x02;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Largest parameter block a single frame can carry.
pub const MAX_PARAMS: usize = 250;

// ---------------------------------------------------------------------------
// Opcode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Bytes the opcode occupies on the wire.
    pub fn width(self) -> usize {
        if self.0 > 0xFF {
            2
        } else {
            1
        }
    }

    fn write_to(self, out: &mut Vec<u8>) {
        if self.width() == 2 {
            out.extend_from_slice(&self.0.to_be_bytes());
        } else {
            out.push(self.0 as u8);
        }
    }

    /// Read an opcode off the front of `bytes`, returning it with the rest.
    fn split(bytes: &[u8]) -> Result<(Opcode, &[u8])> {
        match bytes {
            [0xFF, lo, rest @ ..] => Ok((Opcode(u16::from_be_bytes([0xFF, *lo])), rest)),
            [0xFF] => Err(EcrError::CorruptFrame("truncated two-byte opcode".into())),
            [op, rest @ ..] => Ok((Opcode(*op as u16), rest)),
            [] => Err(EcrError::CorruptFrame("missing opcode".into())),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.width() == 2 {
            write!(f, "0x{:04X}", self.0)
        } else {
            write!(f, "0x{:02X}", self.0)
        }
    }
}

impl From<Command> for Opcode {
    fn from(cmd: Command) -> Self {
        cmd.opcode()
    }
}

// ---------------------------------------------------------------------------
// Command set
// ---------------------------------------------------------------------------

/// Every command the gateway issues. Workflows name commands through this
/// enum; raw opcodes only enter through [`CommandChannel::send_command`].
///
/// [`CommandChannel::send_command`]: crate::ecr::channel::CommandChannel::send_command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    InterruptOutput,
    ShortStatus,
    Status,
    Beep,
    PrintString,
    ReadMoneyRegister,
    ReadOperRegister,
    ReadTable,
    OpenCashDrawer,
    CloseShiftLegacy,
    CancelCheck,
    OpenCheck,
    ContinuePrint,
    OpenShiftLegacy,
    DeviceType,
    FnStatus,
    FnRegistrationInfo,
    FnOpenShift,
    FnSendTag,
    FnExchangeStatus,
    FnShiftParams,
    FnBeginOpenShift,
    FnBeginCloseShift,
    FnCloseShift,
    FnCloseCheck,
    FnOperation,
    FnSendLineTag,
}

impl Command {
    pub fn opcode(self) -> Opcode {
        Opcode(match self {
            Command::InterruptOutput => 0x03,
            Command::ShortStatus => 0x10,
            Command::Status => 0x11,
            Command::Beep => 0x13,
            Command::PrintString => 0x17,
            Command::ReadMoneyRegister => 0x1A,
            Command::ReadOperRegister => 0x1B,
            Command::ReadTable => 0x1F,
            Command::OpenCashDrawer => 0x28,
            Command::CloseShiftLegacy => 0x41,
            Command::CancelCheck => 0x88,
            Command::OpenCheck => 0x8D,
            Command::ContinuePrint => 0xB0,
            Command::OpenShiftLegacy => 0xE0,
            Command::DeviceType => 0xFC,
            Command::FnStatus => 0xFF01,
            Command::FnRegistrationInfo => 0xFF09,
            Command::FnOpenShift => 0xFF0B,
            Command::FnSendTag => 0xFF0C,
            Command::FnExchangeStatus => 0xFF39,
            Command::FnShiftParams => 0xFF40,
            Command::FnBeginOpenShift => 0xFF41,
            Command::FnBeginCloseShift => 0xFF42,
            Command::FnCloseShift => 0xFF43,
            Command::FnCloseCheck => 0xFF45,
            Command::FnOperation => 0xFF46,
            Command::FnSendLineTag => 0xFF4D,
        })
    }
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// XOR checksum over `bytes`.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Build a complete frame ready for the wire.
pub fn encode(opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
    if params.len() > MAX_PARAMS {
        return Err(EcrError::InvalidArgument(format!(
            "{} parameter bytes exceed the {MAX_PARAMS}-byte frame limit",
            params.len()
        )));
    }
    let len = opcode.width() + params.len();
    let mut frame = Vec::with_capacity(len + 3);
    frame.push(STX);
    frame.push(len as u8);
    opcode.write_to(&mut frame);
    frame.extend_from_slice(params);
    let sum = lrc(&frame[1..]);
    frame.push(sum);
    Ok(frame)
}

/// A decoded frame: opcode plus everything after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

impl Frame {
    /// Decode a full `STX..LRC` frame, validating length and checksum.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let (&stx, rest) = bytes
            .split_first()
            .ok_or_else(|| EcrError::CorruptFrame("empty frame".into()))?;
        if stx != STX {
            return Err(EcrError::CorruptFrame(format!("expected STX, got 0x{stx:02X}")));
        }
        let len = *rest
            .first()
            .ok_or_else(|| EcrError::CorruptFrame("missing length byte".into()))?
            as usize;
        if rest.len() != len + 2 {
            return Err(EcrError::CorruptFrame(format!(
                "length byte says {len}, frame carries {}",
                rest.len().saturating_sub(2)
            )));
        }
        let payload = &rest[1..=len];
        let received = rest[len + 1];
        let computed = lrc(&rest[..=len]);
        if computed != received {
            return Err(EcrError::CorruptFrame(format!(
                "checksum 0x{received:02X} != computed 0x{computed:02X}"
            )));
        }
        Frame::from_payload(payload)
    }

    /// Split the `OPCODE | BODY` bytes the transport hands back after it
    /// validated the checksum itself.
    pub fn from_payload(payload: &[u8]) -> Result<Frame> {
        let (opcode, body) = Opcode::split(payload)?;
        Ok(Frame {
            opcode,
            body: body.to_vec(),
        })
    }

    /// Interpret the body as an answer: error code byte then data.
    pub fn into_response(self) -> Result<Response> {
        let (&error_code, data) = self.body.split_first().ok_or_else(|| {
            EcrError::CorruptFrame(format!("answer to {} has no error code", self.opcode))
        })?;
        Ok(Response {
            opcode: self.opcode,
            error_code,
            data: data.to_vec(),
        })
    }
}

/// Answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub error_code: u8,
    pub data: Vec<u8>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }

    /// Turn a nonzero error code into [`EcrError::Device`].
    pub fn check(self) -> Result<Response> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(EcrError::device(self.error_code))
        }
    }

    /// Data must carry at least `len` bytes.
    pub fn require(&self, len: usize) -> Result<&[u8]> {
        if self.data.len() < len {
            return Err(EcrError::ProtocolDesync(format!(
                "answer to {} carries {} bytes, expected at least {len}",
                self.opcode,
                self.data.len()
            )));
        }
        Ok(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_byte_opcode() {
        let frame = encode(Opcode(0x11), &[0x1E, 0, 0, 0]).unwrap();
        assert_eq!(frame[0], STX);
        assert_eq!(frame[1], 5);
        assert_eq!(frame[2], 0x11);
        assert_eq!(&frame[3..7], &[0x1E, 0, 0, 0]);
        assert_eq!(frame[7], 5 ^ 0x11 ^ 0x1E);
    }

    #[test]
    fn test_encode_two_byte_opcode_is_big_endian() {
        let frame = encode(Command::FnCloseCheck.opcode(), &[1]).unwrap();
        assert_eq!(&frame[..5], &[STX, 3, 0xFF, 0x45, 1]);
    }

    #[test]
    fn test_encode_rejects_oversized_params() {
        let params = vec![0u8; MAX_PARAMS + 1];
        assert!(matches!(
            encode(Opcode(0x17), &params),
            Err(EcrError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_decode_inverts_encode_across_opcode_space() {
        let opcodes = [0x01u16, 0x10, 0x8D, 0xFE, 0xFF01, 0xFF45, 0xFF80, 0xFFFF];
        for &op in &opcodes {
            for len in [0usize, 1, 2, 31, 128, 249, 250] {
                if Opcode(op).width() + len > 255 {
                    continue;
                }
                let params: Vec<u8> = (0..len).map(|i| (i * 7 + op as usize) as u8).collect();
                let frame = encode(Opcode(op), &params).unwrap();
                let decoded = Frame::decode(&frame).unwrap();
                assert_eq!(decoded.opcode, Opcode(op));
                assert_eq!(decoded.body, params);
            }
        }
    }

    #[test]
    fn test_any_single_bit_flip_fails_validation() {
        let frame = encode(Opcode(0xFF46), &[1, 2, 3, 4, 0x80, 0x7F]).unwrap();
        for idx in 0..frame.len() {
            for bit in 0..8 {
                let mut damaged = frame.clone();
                damaged[idx] ^= 1 << bit;
                assert!(
                    Frame::decode(&damaged).is_err(),
                    "flip of bit {bit} at byte {idx} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn test_response_split() {
        let resp = Frame::from_payload(&[0xFF, 0x0B, 0x00, 42, 0, 7, 0, 0, 0])
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(resp.opcode, Command::FnOpenShift.opcode());
        assert_eq!(resp.error_code, 0);
        assert_eq!(resp.data, vec![42, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn test_response_without_error_code_is_corrupt() {
        let frame = Frame::from_payload(&[0x11]).unwrap();
        assert!(matches!(frame.into_response(), Err(EcrError::CorruptFrame(_))));
    }

    #[test]
    fn test_response_check_maps_device_error() {
        let resp = Response {
            opcode: Opcode(0x8D),
            error_code: 0x4A,
            data: vec![],
        };
        assert_eq!(resp.check().unwrap_err().device_code(), Some(0x4A));
    }

    #[test]
    fn test_opcode_display() {
        assert_eq!(Opcode(0x11).to_string(), "0x11");
        assert_eq!(Opcode(0xFF45).to_string(), "0xFF45");
    }
}
