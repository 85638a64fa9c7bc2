//! Device error code catalog and error handling rules.
//!
//! Descriptions cover the register and fiscal storage code space. Which
//! codes are advisory is not a property of the register firmware we can
//! query, so the classification is data ([`ErrorPolicy`]) loaded from
//! configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// "Unknown command" as answered by registers that lack a command.
pub const UNKNOWN_COMMAND: u8 = 0x01;
/// "Command not supported in this implementation".
pub const COMMAND_NOT_SUPPORTED: u8 = 0x37;
/// "Check closed, operation impossible": nothing to cancel.
pub const CHECK_CLOSED: u8 = 0x55;
pub const PRINTING_PREVIOUS: u8 = 0x50;
pub const AWAITING_CONTINUE_PRINT: u8 = 0x58;

/// Human-readable description of a device error code.
pub fn describe(code: u8) -> &'static str {
    match code {
        0x00 => "No error",
        0x01 => "Unknown command, invalid frame format or unknown parameters",
        0x02 => "Invalid fiscal storage state",
        0x03 => "Fiscal storage failure",
        0x04 => "Crypto coprocessor failure, invalid parameters for fiscal memory",
        0x05 => "Fiscal storage service life expired",
        0x06 => "Fiscal storage archive full",
        0x07 => "Invalid date and/or time",
        0x08 => "No requested data, command not supported by this fiscal memory",
        0x09 => "Invalid command length",
        0x0A => "Data not in BCD format",
        0x0B => "Fiscal memory cell failure while writing totals",
        0x10 => "Fiscal storage TLV data size exceeded",
        0x11 => "No transport connection",
        0x12 => "Crypto coprocessor resource exhausted",
        0x13 => "Current date earlier than last fiscal memory record",
        0x14 => "Storage resource exhausted",
        0x15 => "Shift already open, or message transfer wait exhausted",
        0x16 => "Shift longer than 24 hours",
        0x17 => "Invalid time difference between two operations",
        0x18 => "First shift date later than last shift date",
        0x19 => "No data in fiscal memory",
        0x1A => "Fiscal memory re-registration area full",
        0x1B => "Serial number not entered",
        0x1C => "Damaged record in the requested range",
        0x1D => "Last shift totals record damaged",
        0x1E => "Fiscal memory re-registration area overflow",
        0x1F => "Register memory missing",
        0x20 => "OFD message cannot be accepted",
        0x21 => "Subtracted amount exceeds money register contents",
        0x22 => "Invalid date",
        0x23 => "No activation record",
        0x24 => "Activation area full",
        0x25 => "No activation with the requested number",
        0x26 => "Three or more damaged shift total records in fiscal memory",
        0x27 => "Checksum, serial number, re-registration or activation mismatch",
        0x2B => "Previous command cannot be cancelled",
        0x2C => "Register already cleared, repeated clearing impossible",
        0x2D => "Section check total less than void amount",
        0x2E => "Not enough cash in register for payout",
        0x2F => "Fiscal storage exchange timeout",
        0x30 => "Fiscal storage not responding, register locked awaiting tax inspector password",
        0x32 => "General clearing required",
        0x33 => "Invalid command parameters",
        0x34 => "No data",
        0x35 => "Invalid parameter for current settings",
        0x36 => "Invalid command parameters for this register implementation",
        0x37 => "Command not supported by this register implementation",
        0x38 => "ROM error",
        0x39 => "Internal register error",
        0x3A => "Shift surcharge accumulation overflow",
        0x3B => "Shift accumulation overflow",
        0x3C => "EKLZ: invalid registration number",
        0x3D => "Shift not open, operation impossible",
        0x3E => "Shift section accumulation overflow",
        0x3F => "Shift discount accumulation overflow",
        0x40 => "Discount range overflow",
        0x41 => "Cash payment range overflow",
        0x42 => "Payment type 2 range overflow",
        0x43 => "Payment type 3 range overflow",
        0x44 => "Payment type 4 range overflow",
        0x45 => "Sum of all payment types less than check total",
        0x46 => "Not enough cash in register",
        0x47 => "Shift tax accumulation overflow",
        0x48 => "Check total overflow",
        0x49 => "Operation impossible in an open check of this type",
        0x4A => "Check open, operation impossible",
        0x4B => "Check buffer overflow",
        0x4C => "Shift tax turnover accumulation overflow",
        0x4D => "Non-cash payment exceeds check total",
        0x4E => "Shift exceeded 24 hours",
        0x4F => "Invalid password",
        0x50 => "Printing previous command",
        0x51 => "Shift cash accumulation overflow",
        0x52 => "Shift payment type 2 accumulation overflow",
        0x53 => "Shift payment type 3 accumulation overflow",
        0x54 => "Shift payment type 4 accumulation overflow",
        0x55 => "Check closed, operation impossible",
        0x56 => "No document to repeat",
        0x57 => "EKLZ: closed shift count does not match fiscal memory",
        0x58 => "Awaiting print continuation command",
        0x59 => "Document opened by another operator",
        0x5A => "Discount exceeds check accumulation",
        0x5B => "Surcharge range overflow",
        0x5C => "24V supply voltage low",
        0x5D => "Table not defined",
        0x5E => "Invalid operation",
        0x5F => "Negative check total",
        0x60 => "Multiplication overflow",
        0x61 => "Price range overflow",
        0x62 => "Quantity range overflow",
        0x63 => "Department range overflow",
        0x64 => "Fiscal memory missing",
        0x65 => "Not enough money in section",
        0x66 => "Section money overflow",
        0x67 => "Fiscal memory communication error",
        0x68 => "Not enough money in tax turnover",
        0x69 => "Tax turnover money overflow",
        0x6A => "Power failure during I2C answer",
        0x6B => "No receipt paper",
        0x6C => "No journal paper",
        0x6D => "Not enough money for tax",
        0x6E => "Tax money overflow",
        0x6F => "Shift payout overflow",
        0x70 => "Fiscal memory overflow",
        0x71 => "Cutter failure",
        0x72 => "Command not supported in this submode",
        0x73 => "Command not supported in this mode",
        0x74 => "RAM error",
        0x75 => "Power failure",
        0x76 => "Printer error: no tachometer pulses",
        0x77 => "Printer error: no sensor signal",
        0x78 => "Firmware replaced",
        0x79 => "Fiscal memory replaced",
        0x7A => "Field not editable",
        0x7B => "Hardware error",
        0x7C => "Date mismatch",
        0x7D => "Invalid date format",
        0x7E => "Invalid value in length field",
        0x7F => "Check total range overflow",
        0x80..=0x83 => "Fiscal memory communication error",
        0x84 => "Cash overflow",
        0x85 => "Shift sales overflow",
        0x86 => "Shift purchases overflow",
        0x87 => "Shift sale returns overflow",
        0x88 => "Shift purchase returns overflow",
        0x89 => "Shift cash-in overflow",
        0x8A => "Check surcharge overflow",
        0x8B => "Check discount overflow",
        0x8C => "Negative check surcharge total",
        0x8D | 0x8E => "Negative check discount total",
        0x8F => "Register not fiscalized",
        0x90 => "Field exceeds configured size",
        0x91 => "Print field boundary exceeded for current font settings",
        0x92 => "Overlapping fields",
        0x93 => "RAM recovery succeeded",
        0x94 => "Check operation limit exhausted",
        0x95 => "Unknown EKLZ error",
        0xA0 => "EKLZ communication error",
        0xA1 => "EKLZ missing",
        0xA2 => "EKLZ: invalid command format or parameter",
        0xA3 => "Invalid EKLZ state",
        0xA4 => "EKLZ failure",
        0xA5 => "EKLZ crypto coprocessor failure",
        0xA6 => "EKLZ time resource exhausted",
        0xA7 => "EKLZ full",
        0xA8 => "EKLZ: invalid date and time",
        0xA9 => "EKLZ: no requested data",
        0xAA => "EKLZ overflow (negative document total)",
        0xB0 => "EKLZ: quantity parameter overflow",
        0xB1 => "EKLZ: amount parameter overflow",
        0xB2 => "EKLZ: already activated",
        0xC0 => "Date and time check (confirm date and time)",
        0xC1 => "EKLZ: daily report with clearing cannot be interrupted",
        0xC2 => "Power supply overvoltage",
        0xC3 => "Check and EKLZ totals mismatch",
        0xC4 => "Shift number mismatch",
        0xC5 => "Slip document buffer empty",
        0xC6 => "Slip document missing",
        0xC7 => "Field not editable in this mode",
        0xC8 => "No tachometer sensor pulses",
        0xC9 => "Print head overheated",
        0xCA => "Temperature outside operating range",
        _ => "Unknown error code",
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What to do when a command is answered with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorAction {
    /// Terminal for the current operation.
    Fail,
    /// Issue continue-print, then re-issue the command.
    ContinuePrint,
    /// Wait, then re-issue the command.
    RetryAfter { delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRule {
    pub code: u8,
    pub action: ErrorAction,
}

/// Code-to-action table. Codes without a rule fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorPolicy {
    rules: Vec<ErrorRule>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                ErrorRule {
                    code: AWAITING_CONTINUE_PRINT,
                    action: ErrorAction::ContinuePrint,
                },
                ErrorRule {
                    code: PRINTING_PREVIOUS,
                    action: ErrorAction::RetryAfter { delay_ms: 500 },
                },
            ],
        }
    }
}

impl ErrorPolicy {
    pub fn new(rules: Vec<ErrorRule>) -> Self {
        Self { rules }
    }

    pub fn action(&self, code: u8) -> ErrorAction {
        if code == 0 {
            return ErrorAction::Fail;
        }
        self.rules
            .iter()
            .find(|r| r.code == code)
            .map(|r| r.action)
            .unwrap_or(ErrorAction::Fail)
    }

    pub fn is_advisory(&self, code: u8) -> bool {
        self.action(code) != ErrorAction::Fail
    }

    pub fn delay(action: ErrorAction) -> Duration {
        match action {
            ErrorAction::RetryAfter { delay_ms } => Duration::from_millis(delay_ms),
            _ => Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Mode / submode
// ---------------------------------------------------------------------------

/// Description of a register mode byte. The low nibble is the mode; modes
/// 8, 13 and 14 carry a status in the high nibble.
pub fn describe_mode(mode: u8) -> &'static str {
    let num = mode & 0x0F;
    let status = mode >> 4;
    match (num, status) {
        (0, _) => "Printer in working mode",
        (1, _) => "Data output",
        (2, _) => "Shift open, 24 hours not elapsed",
        (3, _) => "Shift open, 24 hours elapsed",
        (4, _) => "Shift closed",
        (5, _) => "Locked after wrong tax inspector password",
        (6, _) => "Awaiting date confirmation",
        (7, _) => "Decimal point change allowed",
        (8, 0) => "Open document: sale",
        (8, 1) => "Open document: purchase",
        (8, 2) => "Open document: sale return",
        (8, 3) => "Open document: purchase return",
        (9, _) => "Technological reset allowed",
        (10, _) => "Test run",
        (11, _) => "Printing full fiscal report",
        (12, _) => "Printing EKLZ report",
        (13, 0) => "Slip document: sale open",
        (13, 1) => "Slip document: purchase open",
        (13, 2) => "Slip document: sale return open",
        (13, 3) => "Slip document: purchase return open",
        (14, 0) => "Slip printing: awaiting load",
        (14, 1) => "Slip printing: loading and positioning",
        (14, 2) => "Slip printing: positioning",
        (14, 3) => "Slip printing: printing",
        (14, 4) => "Slip printing: finished",
        (14, 5) => "Slip printing: ejecting",
        (14, 6) => "Slip printing: awaiting removal",
        (15, _) => "Fiscal slip document formed",
        _ => "Unknown mode",
    }
}

pub fn describe_submode(submode: u8) -> &'static str {
    match submode {
        0 => "Paper present, ready for print commands",
        1 => "Passive paper out",
        2 => "Active paper out, printing suspended",
        3 => "After active paper out, awaiting print continuation",
        4 => "Printing full fiscal report",
        5 => "Printing operation",
        _ => "Unknown submode",
    }
}

/// Names of the 16 register flag bits, bit 0 first.
pub const FLAG_NAMES: [&str; 16] = [
    "Journal roll",
    "Receipt roll",
    "Slip upper sensor",
    "Slip lower sensor",
    "Decimal point position",
    "EKLZ present",
    "Journal optical sensor",
    "Receipt optical sensor",
    "Journal thermal head lever down",
    "Receipt thermal head lever down",
    "Cover open",
    "Cash drawer open",
    "Journal cover open",
    "Left printer sensor failure",
    "EKLZ almost full",
    "Extended quantity precision",
];

/// Flag names whose bit is set.
pub fn set_flags(flags: u16) -> Vec<&'static str> {
    FLAG_NAMES
        .iter()
        .enumerate()
        .filter(|(bit, _)| flags & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect()
}
