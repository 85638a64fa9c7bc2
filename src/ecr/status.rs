//! Parsing of status answers.
//!
//! Offsets below index the answer data after the error code byte.

use crate::ecr::catalog;
use crate::ecr::codepage::decode_cp1251;
use crate::ecr::error::{EcrError, Result};
use crate::ecr::money::read_le;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shift / check state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftState {
    Closed,
    Open,
    /// Open for more than 24 hours; only closing is allowed.
    Expired,
}

impl ShiftState {
    /// Code used by cash-register APIs: 1 closed, 2 open, 3 expired.
    pub fn code(self) -> u8 {
        match self {
            ShiftState::Closed => 1,
            ShiftState::Open => 2,
            ShiftState::Expired => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    #[default]
    None,
    Open,
    Settled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckEvent {
    Opened,
    Settled,
    Cancelled,
    /// Settle or cancel completed; ready for the next check.
    Cleared,
}

impl CheckState {
    pub fn apply(self, event: CheckEvent) -> Result<CheckState> {
        use CheckState as S;
        match (self, event) {
            (S::None, CheckEvent::Opened) => Ok(S::Open),
            (S::Open, CheckEvent::Settled) => Ok(S::Settled),
            (_, CheckEvent::Cancelled) => Ok(S::Cancelled),
            (S::Settled | S::Cancelled, CheckEvent::Cleared) => Ok(S::None),
            (S::None, CheckEvent::Cleared) => Ok(S::None),
            (state, event) => Err(EcrError::InvalidState(format!(
                "check event {event:?} not allowed in state {state:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Fiscal module warnings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FnWarnings {
    /// Crypto coprocessor or fiscal storage needs urgent replacement.
    pub replacement_due: bool,
    pub resource_exhausted: bool,
    /// Storage archive 90% full.
    pub storage_near_full: bool,
    pub ofd_timeout: bool,
}

impl FnWarnings {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            replacement_due: bits & 0x01 != 0,
            resource_exhausted: bits & 0x02 != 0,
            storage_near_full: bits & 0x04 != 0,
            ofd_timeout: bits & 0x08 != 0,
        }
    }

    /// Fold in what a refused shift command implies about the storage.
    pub fn merge_error_code(&mut self, code: u8) {
        match code {
            0x05 => self.replacement_due = true,
            0x06 => self.storage_near_full = true,
            0x12 => {
                self.replacement_due = true;
                self.resource_exhausted = true;
            }
            _ => {}
        }
    }

    pub fn any(&self) -> bool {
        self.replacement_due || self.resource_exhausted || self.storage_near_full || self.ofd_timeout
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn need(data: &[u8], len: usize, what: &str) -> Result<()> {
    if data.len() < len {
        return Err(EcrError::ProtocolDesync(format!(
            "{what} answer carries {} bytes, expected {len}",
            data.len()
        )));
    }
    Ok(())
}

/// `YY MM DD hh mm` as sent by the fiscal storage.
pub fn parse_datetime(bytes: &[u8]) -> Option<NaiveDateTime> {
    match bytes {
        [yy, mo, dd, hh, mi, ..] => NaiveDate::from_ymd_opt(2000 + *yy as i32, *mo as u32, *dd as u32)?
            .and_hms_opt(*hh as u32, *mi as u32, 0),
        _ => None,
    }
}

fn ascii(bytes: &[u8]) -> String {
    decode_cp1251(bytes).trim().to_string()
}

// ---------------------------------------------------------------------------
// Register status (0x11)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub operator: u8,
    pub firmware: String,
    pub document_number: u16,
    pub flags: u16,
    pub mode: u8,
    pub submode: u8,
    pub fp_flags: u8,
    pub serial_number: u32,
    pub last_closed_shift: u16,
    pub tax_id: Option<u64>,
}

impl DeviceStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        need(data, 36, "status")?;
        let tax_id = (data.len() >= 46).then(|| read_le(&data[40..46]));
        Ok(Self {
            operator: data[0],
            firmware: format!("{}.{}", data[1] as char, data[2] as char),
            document_number: read_le(&data[9..11]) as u16,
            flags: read_le(&data[11..13]) as u16,
            mode: data[13],
            submode: data[14],
            fp_flags: data[29],
            serial_number: read_le(&data[30..34]) as u32,
            last_closed_shift: read_le(&data[34..36]) as u16,
            tax_id,
        })
    }

    /// Mode number from the low nibble.
    pub fn mode_number(&self) -> u8 {
        self.mode & 0x0F
    }

    pub fn has_open_document(&self) -> bool {
        self.mode_number() == 8
    }

    pub fn awaiting_continue_print(&self) -> bool {
        self.submode == 3
    }

    pub fn mode_description(&self) -> &'static str {
        catalog::describe_mode(self.mode)
    }

    pub fn submode_description(&self) -> &'static str {
        catalog::describe_submode(self.submode)
    }

    /// Shift state from the mode byte alone (legacy registers).
    pub fn shift_state(&self) -> ShiftState {
        match self.mode_number() {
            2 | 8 => ShiftState::Open,
            3 => ShiftState::Expired,
            _ => ShiftState::Closed,
        }
    }
}

/// Short status (0x10).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortStatus {
    pub operator: u8,
    pub flags: u16,
    pub mode: u8,
    pub submode: u8,
}

impl ShortStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        need(data, 5, "short status")?;
        Ok(Self {
            operator: data[0],
            flags: read_le(&data[1..3]) as u16,
            mode: data[3],
            submode: data[4],
        })
    }
}

// ---------------------------------------------------------------------------
// Fiscal storage status (0xFF01)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnStatus {
    pub life_phase: u8,
    pub current_document: u8,
    pub document_data: u8,
    pub session_open: bool,
    pub warnings: FnWarnings,
    pub datetime: Option<NaiveDateTime>,
    pub serial: String,
    pub last_document_number: u32,
}

impl FnStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        need(data, 30, "fiscal storage status")?;
        Ok(Self {
            life_phase: data[0],
            current_document: data[1],
            document_data: data[2],
            session_open: data[3] == 1,
            warnings: FnWarnings::from_bits(data[4]),
            datetime: parse_datetime(&data[5..10]),
            serial: ascii(&data[10..26]),
            last_document_number: read_le(&data[26..30]) as u32,
        })
    }

    /// Fiscal mode opened and not yet closed.
    pub fn is_fiscal(&self) -> bool {
        self.life_phase & 0b0010 != 0 && self.life_phase & 0b0100 == 0
    }

    /// Combine with the register mode: the storage knows whether a session
    /// is open, the register knows whether 24 hours have passed.
    pub fn shift_state(&self, status: &DeviceStatus) -> ShiftState {
        match (self.session_open, status.mode_number()) {
            (false, _) => ShiftState::Closed,
            (true, 3) => ShiftState::Expired,
            (true, _) => ShiftState::Open,
        }
    }
}

// ---------------------------------------------------------------------------
// Other answers
// ---------------------------------------------------------------------------

/// Current shift parameters (0xFF40).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftParams {
    pub open: bool,
    pub shift_number: u16,
    pub check_number: u16,
}

impl ShiftParams {
    pub fn parse(data: &[u8]) -> Result<Self> {
        need(data, 5, "shift parameters")?;
        Ok(Self {
            open: data[0] == 1,
            shift_number: read_le(&data[1..3]) as u16,
            check_number: read_le(&data[3..5]) as u16,
        })
    }
}

/// OFD exchange backlog (0xFF39).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeStatus {
    pub unsent_count: u16,
    pub first_unsent_number: u32,
    pub first_unsent_at: Option<NaiveDateTime>,
}

impl ExchangeStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        need(data, 13, "exchange status")?;
        Ok(Self {
            unsent_count: read_le(&data[2..4]) as u16,
            first_unsent_number: read_le(&data[4..8]) as u32,
            first_unsent_at: parse_datetime(&data[8..13]),
        })
    }
}

/// Registration (fiscalization) summary (0xFF09).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub registered_at: Option<NaiveDateTime>,
    pub tax_id: String,
    pub registration_number: String,
    /// Taxation system codes whose bit is set.
    pub taxation_systems: Vec<u8>,
    pub work_mode: u8,
    pub document_number: u32,
    pub fiscal_sign: u32,
}

impl RegistrationInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        need(data, 47, "registration")?;
        Ok(Self {
            registered_at: parse_datetime(&data[0..5]),
            tax_id: ascii(&data[5..17]),
            registration_number: ascii(&data[17..37]),
            taxation_systems: (0..6u8).filter(|bit| data[37] & (1 << bit) != 0).collect(),
            work_mode: data[38],
            document_number: read_le(&data[39..43]) as u32,
            fiscal_sign: read_le(&data[43..47]) as u32,
        })
    }

    pub fn is_offline(&self) -> bool {
        self.work_mode & 0b0010 != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.work_mode & 0b0001 != 0
    }
}

/// Device type (0xFC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub kind: u8,
    pub subtype: u8,
    pub protocol_version: u8,
    pub protocol_subversion: u8,
    pub model: u8,
    pub language: u8,
    pub name: String,
}

impl DeviceType {
    pub fn parse(data: &[u8]) -> Result<Self> {
        need(data, 6, "device type")?;
        Ok(Self {
            kind: data[0],
            subtype: data[1],
            protocol_version: data[2],
            protocol_subversion: data[3],
            model: data[4],
            language: data[5],
            name: decode_cp1251(&data[6..]),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_parse_status() {
        let s = DeviceStatus::parse(&status_data(0x04, 41)).unwrap();
        assert_eq!(s.operator, 30);
        assert_eq!(s.firmware, "A.2");
        assert_eq!(s.flags, 3);
        assert_eq!(s.mode, 4);
        assert_eq!(s.serial_number, 12_345_678);
        assert_eq!(s.last_closed_shift, 41);
        assert_eq!(s.tax_id, Some(123_456_789));
        assert_eq!(s.shift_state(), ShiftState::Closed);
        assert_eq!(s.mode_description(), "Shift closed");
    }

    #[test]
    fn test_status_shift_state_from_mode() {
        assert_eq!(DeviceStatus::parse(&status_data(2, 0)).unwrap().shift_state(), ShiftState::Open);
        assert_eq!(DeviceStatus::parse(&status_data(3, 0)).unwrap().shift_state(), ShiftState::Expired);
        let in_check = DeviceStatus::parse(&status_data(0x18, 0)).unwrap();
        assert!(in_check.has_open_document());
        assert_eq!(in_check.shift_state(), ShiftState::Open);
    }

    #[test]
    fn test_status_too_short() {
        assert!(matches!(
            DeviceStatus::parse(&[0u8; 20]),
            Err(EcrError::ProtocolDesync(_))
        ));
    }

    #[test]
    fn test_status_without_tax_id() {
        let data = status_data(4, 1);
        let s = DeviceStatus::parse(&data[..36]).unwrap();
        assert_eq!(s.tax_id, None);
    }

    #[test]
    fn test_parse_fn_status() {
        let f = FnStatus::parse(&fn_status_data(true, 0b0101)).unwrap();
        assert!(f.session_open);
        assert!(f.is_fiscal());
        assert_eq!(f.serial, "9999078900012345");
        assert_eq!(f.last_document_number, 120);
        assert!(f.warnings.replacement_due);
        assert!(f.warnings.storage_near_full);
        assert!(!f.warnings.resource_exhausted);
        assert_eq!(
            f.datetime.unwrap().to_string(),
            "2024-03-15 09:30:00"
        );
    }

    #[test]
    fn test_fn_shift_state_combines_register_mode() {
        let open = FnStatus::parse(&fn_status_data(true, 0)).unwrap();
        let closed = FnStatus::parse(&fn_status_data(false, 0)).unwrap();
        let over_24h = DeviceStatus::parse(&status_data(3, 0)).unwrap();
        let fresh = DeviceStatus::parse(&status_data(2, 0)).unwrap();
        assert_eq!(open.shift_state(&fresh), ShiftState::Open);
        assert_eq!(open.shift_state(&over_24h), ShiftState::Expired);
        assert_eq!(closed.shift_state(&over_24h), ShiftState::Closed);
    }

    #[test]
    fn test_warnings_from_error_codes() {
        let mut w = FnWarnings::default();
        assert!(!w.any());
        w.merge_error_code(0x12);
        assert!(w.replacement_due && w.resource_exhausted && !w.storage_near_full);
        w.merge_error_code(0x06);
        assert!(w.storage_near_full);
        let mut other = FnWarnings::default();
        other.merge_error_code(0x4F);
        assert!(!other.any());
    }

    #[test]
    fn test_check_state_transitions() {
        let s = CheckState::None.apply(CheckEvent::Opened).unwrap();
        assert_eq!(s, CheckState::Open);
        assert!(s.apply(CheckEvent::Opened).is_err());
        let settled = s.apply(CheckEvent::Settled).unwrap();
        assert_eq!(settled.apply(CheckEvent::Cleared).unwrap(), CheckState::None);
        assert!(CheckState::None.apply(CheckEvent::Settled).is_err());
        assert_eq!(
            CheckState::Open.apply(CheckEvent::Cancelled).unwrap(),
            CheckState::Cancelled
        );
    }

    #[test]
    fn test_parse_exchange_status() {
        let mut d = vec![0u8; 13];
        d[2..4].copy_from_slice(&3u16.to_le_bytes());
        d[4..8].copy_from_slice(&77u32.to_le_bytes());
        d[8..13].copy_from_slice(&[24, 1, 2, 3, 4]);
        let e = ExchangeStatus::parse(&d).unwrap();
        assert_eq!(e.unsent_count, 3);
        assert_eq!(e.first_unsent_number, 77);
        assert!(e.first_unsent_at.is_some());
    }

    #[test]
    fn test_parse_datetime_rejects_garbage() {
        assert!(parse_datetime(&[24, 13, 1, 0, 0]).is_none());
        assert!(parse_datetime(&[24, 1]).is_none());
    }

    #[test]
    fn test_parse_registration_info() {
        let mut d = vec![0u8; 47];
        d[0..5].copy_from_slice(&[23, 6, 1, 12, 0]);
        d[5..17].copy_from_slice(b"7701234567  ");
        d[17..37].copy_from_slice(b"0000000001012345    ");
        d[37] = 0b0000_0011;
        d[38] = 0b0010;
        d[39..43].copy_from_slice(&1u32.to_le_bytes());
        let r = RegistrationInfo::parse(&d).unwrap();
        assert_eq!(r.tax_id, "7701234567");
        assert_eq!(r.registration_number, "0000000001012345");
        assert_eq!(r.taxation_systems, vec![0, 1]);
        assert!(r.is_offline());
        assert!(!r.is_encrypted());
    }

    #[test]
    fn test_parse_device_type() {
        let mut d = vec![0, 0, 1, 12, 7, 0];
        d.extend_from_slice(&[0xD8, 0xD2, 0xD0, 0xD5]);
        let t = DeviceType::parse(&d).unwrap();
        assert_eq!(t.protocol_subversion, 12);
        assert_eq!(t.name, "ШТРХ");
    }

    #[test]
    fn test_parse_shift_params() {
        let p = ShiftParams::parse(&[1, 42, 0, 5, 0]).unwrap();
        assert!(p.open);
        assert_eq!(p.shift_number, 42);
        assert_eq!(p.check_number, 5);
    }
}
