//! Fiscal workflow: shift and check lifecycle built from raw commands.
//!
//! Every operation takes the device lock under the workflow's owner token.
//! Taking it is re-entrant, so an operation composed of other operations
//! (a whole receipt) keeps the lock from its first command to its last.
//! Shift and check state are always re-derived from a live status query
//! before a transition; the cached runtime state only mirrors the result.

use crate::ecr::catalog::{self, CHECK_CLOSED, COMMAND_NOT_SUPPORTED, UNKNOWN_COMMAND};
use crate::ecr::channel::Dialect;
use crate::ecr::codepage::{decode_cp1251, encode_cp1251, encode_truncated};
use crate::ecr::device::Device;
use crate::ecr::error::{EcrError, Result};
use crate::ecr::frame::{Command, Response, MAX_PARAMS};
use crate::ecr::lock::OwnerToken;
use crate::ecr::money::{
    line_quantity_units, money_to_units, put_le, read_le, units_to_money, UNSET_5,
};
use crate::ecr::status::{
    parse_datetime, CheckEvent, CheckState, DeviceStatus, DeviceType, ExchangeStatus, FnStatus, FnWarnings,
    RegistrationInfo, ShiftParams, ShiftState,
};
use base64::Engine;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// TLV tag numbers sent to the fiscal storage.
pub mod tag {
    pub const SALE_ADDRESS: u16 = 1009;
    pub const CUSTOMER_CONTACT: u16 = 1008;
    pub const CASHIER_NAME: u16 = 1021;
    pub const QUANTITY: u16 = 1023;
    pub const ITEM_NAME: u16 = 1030;
    pub const UNIT_PRICE: u16 = 1079;
    pub const MARKING_CODE: u16 = 1162;
    pub const SALE_LOCATION: u16 = 1187;
    pub const MEASUREMENT_UNIT: u16 = 1197;
    pub const CASHIER_TAX_ID: u16 = 1203;
    pub const EXCISE_FLAG: u16 = 1207;
    pub const SUBJECT: u16 = 1212;
    pub const PAYMENT_METHOD: u16 = 1214;

    pub const AGENT_OPERATION: u16 = 1044;
    pub const OPERATOR_ADDRESS: u16 = 1005;
    pub const OPERATOR_TAX_ID: u16 = 1016;
    pub const OPERATOR_NAME: u16 = 1026;
    pub const OPERATOR_PHONE: u16 = 1073;
    pub const VENDOR_PHONE: u16 = 1171;
    pub const VENDOR_NAME: u16 = 1224;
    pub const VENDOR_TAX_ID: u16 = 1226;
}

/// `password(4) | tag(2) | len(2)` precede the value.
const TAG_HEADER: usize = 8;
const MAX_TAG_VALUE: usize = MAX_PARAMS - TAG_HEADER;

const LINE_HEADER: usize = 30;
const MAX_LINE_NAME: usize = 128;

const CLOSE_BLOCK_LEN: usize = 180;
const CLOSE_TEXT_OFFSET: usize = 116;
const CLOSE_TEXT_MAX: usize = 64;

const PRINT_FLAGS_RECEIPT: u8 = 0x02;
const PRINT_WIDTH: usize = 40;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaxRate {
    Vat20,
    Vat10,
    Vat0,
    NoVat,
    /// Rate included in the price, 20/120.
    Vat20Inclusive,
    /// Rate included in the price, 10/110.
    Vat10Inclusive,
}

impl TaxRate {
    pub const ALL: [TaxRate; 6] = [
        TaxRate::Vat20,
        TaxRate::Vat10,
        TaxRate::Vat0,
        TaxRate::NoVat,
        TaxRate::Vat20Inclusive,
        TaxRate::Vat10Inclusive,
    ];

    /// Tax code byte of the line operation (1..=6).
    pub fn code(self) -> u8 {
        match self {
            TaxRate::Vat20 => 1,
            TaxRate::Vat10 => 2,
            TaxRate::Vat0 => 3,
            TaxRate::NoVat => 4,
            TaxRate::Vat20Inclusive => 5,
            TaxRate::Vat10Inclusive => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaxRate::Vat20 => "20",
            TaxRate::Vat10 => "10",
            TaxRate::Vat0 => "0",
            TaxRate::NoVat => "none",
            TaxRate::Vat20Inclusive => "20/120",
            TaxRate::Vat10Inclusive => "10/110",
        }
    }

    fn bucket(self) -> usize {
        self.code() as usize - 1
    }
}

impl FromStr for TaxRate {
    type Err = EcrError;

    /// Accepts the symbolic rates, the numeric codes 1..6 and the
    /// superseded 18% spellings.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "20" | "18" | "1" => Ok(TaxRate::Vat20),
            "10" | "2" => Ok(TaxRate::Vat10),
            "0" | "3" => Ok(TaxRate::Vat0),
            "none" | "4" => Ok(TaxRate::NoVat),
            "20/120" | "18/118" | "5" => Ok(TaxRate::Vat20Inclusive),
            "10/110" | "6" => Ok(TaxRate::Vat10Inclusive),
            other => Err(EcrError::InvalidArgument(format!("unknown tax rate {other:?}"))),
        }
    }
}

impl TryFrom<String> for TaxRate {
    type Error = EcrError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TaxRate> for String {
    fn from(rate: TaxRate) -> Self {
        rate.as_str().to_string()
    }
}

impl fmt::Display for TaxRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-rate tax sums of one check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct TaxTotals([f64; 6]);

impl TaxTotals {
    pub fn add(&mut self, rate: TaxRate, amount: f64) {
        self.0[rate.bucket()] += amount;
    }

    pub fn get(&self, rate: TaxRate) -> f64 {
        self.0[rate.bucket()]
    }
}

impl TryFrom<BTreeMap<String, f64>> for TaxTotals {
    type Error = EcrError;

    fn try_from(map: BTreeMap<String, f64>) -> Result<Self> {
        let mut totals = TaxTotals::default();
        for (key, amount) in map {
            totals.add(key.parse()?, amount);
        }
        Ok(totals)
    }
}

impl From<TaxTotals> for BTreeMap<String, f64> {
    fn from(totals: TaxTotals) -> Self {
        TaxRate::ALL
            .iter()
            .filter(|r| totals.get(**r) != 0.0)
            .map(|r| (r.as_str().to_string(), totals.get(*r)))
            .collect()
    }
}

/// Check operation type, numbered as on the fiscal documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OperationType {
    Sale = 1,
    SaleReturn = 2,
    Purchase = 3,
    PurchaseReturn = 4,
}

impl OperationType {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Document type byte of the open-check command. Also the mode index of
    /// the per-department money registers.
    pub fn document_type(self) -> u8 {
        match self {
            OperationType::Sale => 0,
            OperationType::Purchase => 1,
            OperationType::SaleReturn => 2,
            OperationType::PurchaseReturn => 3,
        }
    }
}

impl TryFrom<u8> for OperationType {
    type Error = EcrError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(OperationType::Sale),
            2 => Ok(OperationType::SaleReturn),
            3 => Ok(OperationType::Purchase),
            4 => Ok(OperationType::PurchaseReturn),
            other => Err(EcrError::InvalidArgument(format!(
                "operation type {other} outside 1..=4"
            ))),
        }
    }
}

impl From<OperationType> for u8 {
    fn from(op: OperationType) -> Self {
        op.code()
    }
}

fn default_payment_method() -> u8 {
    4
}

fn default_subject() -> u8 {
    1
}

/// One priced line of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiscalLine {
    pub name: String,
    pub quantity: f64,
    pub price: f64,
    /// Line total; the register computes `price * quantity` when absent.
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub tax_amount: Option<f64>,
    pub tax_rate: TaxRate,
    /// 0..=16 for free sale, 255 for sale by item code.
    #[serde(default)]
    pub department: u8,
    /// Payment method sign, 4 = full settlement.
    #[serde(default = "default_payment_method")]
    pub payment_method: u8,
    /// Calculation subject sign, 1 = goods.
    #[serde(default = "default_subject")]
    pub subject: u8,
}

impl FiscalLine {
    pub fn new(name: impl Into<String>, quantity: f64, price: f64, tax_rate: TaxRate) -> Self {
        Self {
            name: name.into(),
            quantity,
            price,
            amount: None,
            tax_amount: None,
            tax_rate,
            department: 0,
            payment_method: default_payment_method(),
            subject: default_subject(),
        }
    }

    pub fn total(&self) -> f64 {
        self.amount.unwrap_or(self.price * self.quantity)
    }
}

/// Payment and tax summary that closes a check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckPayment {
    pub cash: f64,
    pub electronic: f64,
    pub prepayment: f64,
    pub postpayment: f64,
    pub barter: f64,
    pub taxes: TaxTotals,
    /// Rounding to whole currency, in minor units.
    pub rounding: u8,
    /// Taxation system code 0..=5.
    pub tax_system: u8,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cashier {
    pub name: String,
    pub tax_id: String,
    pub sale_address: String,
    pub sale_location: String,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShiftOpened {
    pub state: ShiftState,
    pub shift_number: u16,
    pub document_number: Option<u32>,
    pub warnings: FnWarnings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationCounters {
    pub check_count: u16,
    pub total: f64,
    pub correction_count: u16,
    pub correction_total: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ShiftTotals {
    pub sale: OperationCounters,
    pub sale_return: OperationCounters,
    pub purchase: OperationCounters,
    pub purchase_return: OperationCounters,
    pub cash_balance: f64,
}

impl ShiftTotals {
    pub fn counters(&self, op: OperationType) -> &OperationCounters {
        match op {
            OperationType::Sale => &self.sale,
            OperationType::SaleReturn => &self.sale_return,
            OperationType::Purchase => &self.purchase,
            OperationType::PurchaseReturn => &self.purchase_return,
        }
    }

    fn by_document_type(&mut self, document_type: u8) -> &mut OperationCounters {
        match document_type {
            0 => &mut self.sale,
            1 => &mut self.purchase,
            2 => &mut self.sale_return,
            _ => &mut self.purchase_return,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShiftClosed {
    pub shift_number: u16,
    pub document_number: Option<u32>,
    pub fiscal_sign: Option<u32>,
    pub closed_at: NaiveDateTime,
    pub warnings: FnWarnings,
    /// `None` when the totals could not be read after the close.
    pub totals: Option<ShiftTotals>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckClosed {
    pub change: f64,
    pub document_number: u32,
    pub fiscal_sign: u32,
    pub closed_at: NaiveDateTime,
    pub shift_number: Option<u16>,
}

impl CheckClosed {
    /// `change(5) | doc(4) | sign(4) [| datetime(5)]`
    fn parse(resp: &Response, digits: u32) -> Result<Self> {
        let data = resp.require(13)?;
        Ok(Self {
            change: units_to_money(read_le(&data[0..5]) as i64, digits),
            document_number: read_le(&data[5..9]) as u32,
            fiscal_sign: read_le(&data[9..13]) as u32,
            closed_at: data
                .get(13..18)
                .and_then(parse_datetime)
                .unwrap_or_else(now),
            shift_number: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// No document was open; not an error.
    NothingOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentStatus {
    pub shift_state: ShiftState,
    pub shift_number: u16,
    pub check_number: Option<u16>,
    pub last_document_number: Option<u32>,
    pub totals: ShiftTotals,
    pub backlog: Option<ExchangeStatus>,
    pub warnings: FnWarnings,
    pub mode: String,
    pub submode: String,
    pub flags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Receipt request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentData {
    pub operation: String,
    pub operator_phone: String,
    pub operator_name: String,
    pub operator_address: String,
    pub operator_tax_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorData {
    pub phone: String,
    pub name: String,
    pub tax_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckLine {
    #[serde(flatten)]
    pub item: FiscalLine,
    #[serde(default)]
    pub measurement_unit: String,
    /// Marking code, base64.
    #[serde(default)]
    pub marking_code: String,
    #[serde(default)]
    pub agent: AgentData,
    #[serde(default)]
    pub vendor: VendorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub operation: OperationType,
    #[serde(default)]
    pub cashier: Cashier,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub customer_phone: String,
    /// Printed above the lines when set.
    #[serde(default)]
    pub sender_email: String,
    pub lines: Vec<CheckLine>,
    /// Tax sums are computed from the lines.
    #[serde(default)]
    pub payment: CheckPayment,
}

// ---------------------------------------------------------------------------
// Parameter blocks
// ---------------------------------------------------------------------------

/// `password | tag LE | len LE | value`, value cut to what one frame carries.
pub fn tag_params(password: &[u8; 4], tag: u16, value: &[u8]) -> Vec<u8> {
    let value = &value[..value.len().min(MAX_TAG_VALUE)];
    let mut params = Vec::with_capacity(TAG_HEADER + value.len());
    params.extend_from_slice(password);
    params.extend_from_slice(&tag.to_le_bytes());
    params.extend_from_slice(&(value.len() as u16).to_le_bytes());
    params.extend_from_slice(value);
    params
}

/// Parameter block of the line operation.
///
/// ```text
/// [0..4]   password        [21..26] tax amount
/// [4]      operation type  [26]     tax code
/// [5..11]  quantity x10^6  [27]     department
/// [11..16] price           [28]     payment method
/// [16..21] amount          [29]     subject
/// [30..]   name, cp1251, up to 128 bytes
/// ```
pub fn encode_line(
    password: &[u8; 4],
    operation: OperationType,
    line: &FiscalLine,
    digits: u32,
) -> Result<Vec<u8>> {
    if line.department > 16 && line.department != 255 {
        return Err(EcrError::InvalidArgument(format!(
            "department {} outside 0..=16 and 255",
            line.department
        )));
    }
    let name = encode_truncated(&line.name, MAX_LINE_NAME);
    let mut p = vec![0u8; LINE_HEADER + name.len()];
    p[..4].copy_from_slice(password);
    p[4] = operation.code();
    put_le(&mut p, 5, 6, line_quantity_units(line.quantity))?;
    put_le(&mut p, 11, 5, money_to_units(line.price, digits))?;
    let amount = line.amount.map_or(UNSET_5, |a| money_to_units(a, digits));
    put_le(&mut p, 16, 5, amount)?;
    let tax = line.tax_amount.map_or(UNSET_5, |t| money_to_units(t, digits));
    put_le(&mut p, 21, 5, tax)?;
    p[26] = line.tax_rate.code();
    p[27] = line.department;
    p[28] = line.payment_method;
    p[29] = line.subject;
    p[LINE_HEADER..].copy_from_slice(&name);
    Ok(p)
}

/// Fixed 180-byte block of the extended close-check command.
///
/// Payment slots sit at 4 (cash), 9 (electronic), 69 (prepayment),
/// 74 (postpayment) and 79 (barter); 84 is rounding; six tax sums follow
/// from 85; 115 is the taxation system bit; text fills 116..180.
pub fn build_close_block(password: &[u8; 4], payment: &CheckPayment, digits: u32) -> Result<Vec<u8>> {
    if payment.tax_system > 5 {
        return Err(EcrError::InvalidArgument(format!(
            "taxation system {} outside 0..=5",
            payment.tax_system
        )));
    }
    let mut block = vec![0u8; CLOSE_BLOCK_LEN];
    block[..4].copy_from_slice(password);
    let slots = [
        (4, payment.cash),
        (9, payment.electronic),
        (69, payment.prepayment),
        (74, payment.postpayment),
        (79, payment.barter),
    ];
    for (offset, amount) in slots {
        if amount != 0.0 {
            put_le(&mut block, offset, 5, money_to_units(amount, digits))?;
        }
    }
    block[84] = payment.rounding;
    for rate in TaxRate::ALL {
        let amount = payment.taxes.get(rate);
        if amount != 0.0 {
            put_le(&mut block, 85 + 5 * rate.bucket(), 5, money_to_units(amount, digits))?;
        }
    }
    block[115] = 1 << payment.tax_system;
    let text = encode_truncated(&payment.text, CLOSE_TEXT_MAX);
    block[CLOSE_TEXT_OFFSET..CLOSE_TEXT_OFFSET + text.len()].copy_from_slice(&text);
    Ok(block)
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn shift_refused(code: u8, mut warnings: FnWarnings) -> EcrError {
    warnings.merge_error_code(code);
    EcrError::ShiftCommandFailed {
        code,
        message: catalog::describe(code).to_string(),
        warnings,
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Status as just read from the register.
fn require_open_shift(shift: ShiftState) -> Result<()> {
    match shift {
        ShiftState::Open => Ok(()),
        ShiftState::Expired => Err(EcrError::InvalidState(
            "shift exceeded 24 hours, close it first".into(),
        )),
        ShiftState::Closed => Err(EcrError::InvalidState("shift closed".into())),
    }
}

struct LiveState {
    status: DeviceStatus,
    fn_status: Option<FnStatus>,
    shift: ShiftState,
}

impl LiveState {
    fn dialect(&self) -> Dialect {
        if self.fn_status.is_some() {
            Dialect::Modern
        } else {
            Dialect::Legacy
        }
    }

    fn warnings(&self) -> FnWarnings {
        self.fn_status.as_ref().map(|f| f.warnings).unwrap_or_default()
    }
}

pub struct FiscalWorkflow<'a> {
    device: &'a Device,
    token: OwnerToken,
}

impl<'a> FiscalWorkflow<'a> {
    pub fn new(device: &'a Device, token: OwnerToken) -> Self {
        Self { device, token }
    }

    pub fn token(&self) -> OwnerToken {
        self.token
    }

    fn digits(&self) -> u32 {
        self.device.options().money_digits
    }

    fn run(&self, command: Command, params: &[u8]) -> Result<Response> {
        self.device.execute(command, params)?.check()
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn query_status(&self) -> Result<DeviceStatus> {
        let _guard = self.device.lock_guard(self.token)?;
        self.read_status()
    }

    fn read_status(&self) -> Result<DeviceStatus> {
        let resp = self.run(Command::Status, &self.device.admin_password())?;
        let status = DeviceStatus::parse(&resp.data)?;
        self.device.update_identity(|id| {
            id.serial_number = status.serial_number.to_string();
            if let Some(tax_id) = status.tax_id {
                id.tax_id = tax_id.to_string();
            }
        });
        self.device.with_runtime(|rt| rt.on_status(status.clone()));
        Ok(status)
    }

    /// Fiscal storage status; `None` on registers without the extended
    /// command range, which also pins the dialect to legacy.
    pub fn query_fn_status(&self) -> Result<Option<FnStatus>> {
        let _guard = self.device.lock_guard(self.token)?;
        self.read_fn_status()
    }

    fn read_fn_status(&self) -> Result<Option<FnStatus>> {
        let resp = self
            .device
            .execute(Command::FnStatus, &self.device.admin_password())?;
        if matches!(resp.error_code, UNKNOWN_COMMAND | COMMAND_NOT_SUPPORTED) {
            if self.device.dialect() != Some(Dialect::Legacy) {
                info!("Device {}: legacy command set", self.device.id());
            }
            self.device.set_dialect(Dialect::Legacy);
            return Ok(None);
        }
        let resp = resp.check()?;
        let fn_status = FnStatus::parse(&resp.data)?;
        self.device.set_dialect(Dialect::Modern);
        self.device
            .update_identity(|id| id.fn_number = fn_status.serial.clone());
        self.device.with_runtime(|rt| rt.on_fn_status(fn_status.clone()));
        Ok(Some(fn_status))
    }

    /// Dialect of the current connection, probing once if unknown.
    pub fn negotiate_dialect(&self) -> Result<Dialect> {
        let _guard = self.device.lock_guard(self.token)?;
        if let Some(dialect) = self.device.dialect() {
            return Ok(dialect);
        }
        Ok(match self.read_fn_status()? {
            Some(_) => Dialect::Modern,
            None => Dialect::Legacy,
        })
    }

    pub fn shift_state(&self) -> Result<ShiftState> {
        let _guard = self.device.lock_guard(self.token)?;
        Ok(self.refresh()?.shift)
    }

    fn refresh(&self) -> Result<LiveState> {
        let status = self.read_status()?;
        let fn_status = match self.device.dialect() {
            Some(Dialect::Legacy) => None,
            _ => self.read_fn_status()?,
        };
        let shift = match &fn_status {
            Some(f) => f.shift_state(&status),
            None => status.shift_state(),
        };
        self.device.with_runtime(|rt| rt.on_shift(shift, None));
        Ok(LiveState {
            status,
            fn_status,
            shift,
        })
    }

    pub fn registration_info(&self) -> Result<RegistrationInfo> {
        let _guard = self.device.lock_guard(self.token)?;
        let resp = self.run(Command::FnRegistrationInfo, &self.device.admin_password())?;
        let info = RegistrationInfo::parse(&resp.data)?;
        self.device.update_identity(|id| {
            id.tax_id = info.tax_id.clone();
            id.registration_number = info.registration_number.clone();
        });
        Ok(info)
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        let _guard = self.device.lock_guard(self.token)?;
        let resp = self.run(Command::DeviceType, &[])?;
        DeviceType::parse(&resp.data)
    }

    /// Raw field of a settings table.
    pub fn read_table(&self, table: u8, row: u16, field: u8) -> Result<Vec<u8>> {
        let _guard = self.device.lock_guard(self.token)?;
        let mut params = self.device.admin_password().to_vec();
        params.push(table);
        params.extend_from_slice(&row.to_le_bytes());
        params.push(field);
        Ok(self.run(Command::ReadTable, &params)?.data)
    }

    pub fn read_table_text(&self, table: u8, row: u16, field: u8) -> Result<String> {
        let raw = self.read_table(table, row, field)?;
        Ok(decode_cp1251(&raw).trim().to_string())
    }

    // -----------------------------------------------------------------------
    // Shift
    // -----------------------------------------------------------------------

    pub fn open_shift(&self, cashier: &Cashier) -> Result<ShiftOpened> {
        let _guard = self.device.lock_guard(self.token)?;
        let live = self.refresh()?;
        if live.shift != ShiftState::Closed {
            return Err(EcrError::InvalidState("shift already open".into()));
        }
        let warnings = live.warnings();
        let admin = self.device.admin_password();

        let (shift_number, document_number) = match live.dialect() {
            Dialect::Modern => {
                let begin = self.device.execute(Command::FnBeginOpenShift, &admin)?;
                if !begin.is_ok() {
                    return Err(shift_refused(begin.error_code, warnings));
                }
                self.send_cashier_tags(&admin, cashier)?;
                let resp = self.device.execute(Command::FnOpenShift, &admin)?;
                if !resp.is_ok() {
                    return Err(shift_refused(resp.error_code, warnings));
                }
                let data = resp.require(6)?;
                (read_le(&data[0..2]) as u16, Some(read_le(&data[2..6]) as u32))
            }
            Dialect::Legacy => {
                let resp = self.device.execute(Command::OpenShiftLegacy, &admin)?;
                if !resp.is_ok() {
                    return Err(shift_refused(resp.error_code, warnings));
                }
                (live.status.last_closed_shift + 1, None)
            }
        };

        self.device
            .with_runtime(|rt| rt.on_shift(ShiftState::Open, Some(shift_number)));
        info!("Device {}: shift {shift_number} opened", self.device.id());
        Ok(ShiftOpened {
            state: ShiftState::Open,
            shift_number,
            document_number,
            warnings,
        })
    }

    pub fn close_shift(&self, cashier: &Cashier) -> Result<ShiftClosed> {
        let _guard = self.device.lock_guard(self.token)?;
        let live = self.refresh()?;
        if live.shift == ShiftState::Closed {
            return Err(EcrError::InvalidState("shift already closed".into()));
        }
        let warnings = live.warnings();
        let admin = self.device.admin_password();

        let mut closed = match live.dialect() {
            Dialect::Modern => {
                let begin = self.device.execute(Command::FnBeginCloseShift, &admin)?;
                if !begin.is_ok() {
                    return Err(shift_refused(begin.error_code, warnings));
                }
                self.send_cashier_tags(&admin, cashier)?;
                let resp = self.device.execute(Command::FnCloseShift, &admin)?;
                if !resp.is_ok() {
                    return Err(shift_refused(resp.error_code, warnings));
                }
                let data = resp.require(10)?;
                ShiftClosed {
                    shift_number: read_le(&data[0..2]) as u16,
                    document_number: Some(read_le(&data[2..6]) as u32),
                    fiscal_sign: Some(read_le(&data[6..10]) as u32),
                    closed_at: data.get(10..15).and_then(parse_datetime).unwrap_or_else(now),
                    warnings,
                    totals: None,
                }
            }
            Dialect::Legacy => {
                let resp = self.device.execute(Command::CloseShiftLegacy, &admin)?;
                if !resp.is_ok() {
                    return Err(shift_refused(resp.error_code, warnings));
                }
                ShiftClosed {
                    shift_number: live.status.last_closed_shift + 1,
                    document_number: None,
                    fiscal_sign: None,
                    closed_at: now(),
                    warnings,
                    totals: None,
                }
            }
        };

        let number = closed.shift_number;
        self.device
            .with_runtime(|rt| rt.on_shift(ShiftState::Closed, Some(number)));
        info!("Device {}: shift {number} closed", self.device.id());

        // The shift is closed on the register whatever happens next.
        closed.totals = match self.collect_totals() {
            Ok(totals) => Some(totals),
            Err(e) => {
                warn!("Device {}: shift totals unavailable: {e}", self.device.id());
                None
            }
        };
        Ok(closed)
    }

    fn send_cashier_tags(&self, password: &[u8; 4], cashier: &Cashier) -> Result<()> {
        let tags = [
            (tag::CASHIER_TAX_ID, cashier.tax_id.as_bytes().to_vec()),
            (tag::CASHIER_NAME, encode_cp1251(&cashier.name)),
            (tag::SALE_ADDRESS, encode_cp1251(&cashier.sale_address)),
            (tag::SALE_LOCATION, encode_cp1251(&cashier.sale_location)),
        ];
        for (id, value) in tags.iter().filter(|(_, v)| !v.is_empty()) {
            match self.push_tag(Command::FnSendTag, password, *id, value) {
                Ok(()) => {}
                Err(e @ EcrError::Device { .. }) => {
                    warn!("Device {}: tag {id} refused: {e}", self.device.id())
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Accumulated totals of the current (or just closed) shift.
    pub fn read_shift_totals(&self) -> Result<ShiftTotals> {
        let _guard = self.device.lock_guard(self.token)?;
        self.collect_totals()
    }

    /// Sums raw register values per operation type and converts once, so
    /// minor units are never truncated per department.
    fn collect_totals(&self) -> Result<ShiftTotals> {
        let digits = self.digits();
        let mut totals = ShiftTotals::default();
        for mode in 0..4u8 {
            let mut raw = 0u64;
            for dept in 0..16u8 {
                raw += self.money_register(121 + mode as u16 + dept as u16 * 4)?.unwrap_or(0);
            }
            let counters = totals.by_document_type(mode);
            counters.total = units_to_money(raw as i64, digits);
            counters.check_count = self.oper_register(144 + mode)?.unwrap_or(0);
        }
        totals.cash_balance = units_to_money(self.money_register(241)?.unwrap_or(0) as i64, digits);
        totals.sale.correction_count = self.oper_register(200)?.unwrap_or(0);
        totals.purchase.correction_count = self.oper_register(201)?.unwrap_or(0);
        totals.sale.correction_total =
            units_to_money(self.money_register(4224)?.unwrap_or(0) as i64, digits);
        totals.purchase.correction_total =
            units_to_money(self.money_register(4225)?.unwrap_or(0) as i64, digits);
        Ok(totals)
    }

    /// Money register in minor units; `None` if the register refused it.
    fn money_register(&self, register: u16) -> Result<Option<u64>> {
        let mut params = self.device.admin_password().to_vec();
        match u8::try_from(register) {
            Ok(short) => params.push(short),
            Err(_) => params.extend_from_slice(&register.to_le_bytes()),
        }
        let resp = self.device.execute(Command::ReadMoneyRegister, &params)?;
        if !resp.is_ok() {
            debug!("Money register {register}: {}", catalog::describe(resp.error_code));
            return Ok(None);
        }
        let data = resp.require(7)?;
        Ok(Some(read_le(&data[1..7])))
    }

    fn oper_register(&self, register: u8) -> Result<Option<u16>> {
        let mut params = self.device.admin_password().to_vec();
        params.push(register);
        let resp = self.device.execute(Command::ReadOperRegister, &params)?;
        if !resp.is_ok() {
            debug!("Operating register {register}: {}", catalog::describe(resp.error_code));
            return Ok(None);
        }
        let data = resp.require(3)?;
        Ok(Some(read_le(&data[1..3]) as u16))
    }

    /// Shift state, counters and the unsent document backlog.
    pub fn current_status(&self) -> Result<CurrentStatus> {
        let _guard = self.device.lock_guard(self.token)?;
        let live = self.refresh()?;
        let admin = self.device.admin_password();
        let open = live.shift != ShiftState::Closed;

        let (shift_number, check_number, backlog) = match live.dialect() {
            Dialect::Modern => {
                let params = ShiftParams::parse(&self.run(Command::FnShiftParams, &admin)?.data)?;
                let backlog =
                    ExchangeStatus::parse(&self.run(Command::FnExchangeStatus, &admin)?.data)?;
                (params.shift_number, Some(params.check_number), Some(backlog))
            }
            Dialect::Legacy => {
                let last = live.status.last_closed_shift;
                (if open { last + 1 } else { last }, None, None)
            }
        };
        let totals = self.collect_totals()?;

        Ok(CurrentStatus {
            shift_state: live.shift,
            shift_number,
            check_number,
            last_document_number: live.fn_status.as_ref().map(|f| f.last_document_number),
            totals,
            backlog,
            warnings: live.warnings(),
            mode: live.status.mode_description().to_string(),
            submode: live.status.submode_description().to_string(),
            flags: catalog::set_flags(live.status.flags)
                .into_iter()
                .map(String::from)
                .collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Check
    // -----------------------------------------------------------------------

    pub fn open_check(&self, operation: OperationType) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        require_open_shift(self.refresh()?.shift)?;
        let mut params = self.device.admin_password().to_vec();
        params.push(operation.document_type());
        self.run(Command::OpenCheck, &params)?;
        self.device.with_runtime(|rt| rt.on_check(CheckEvent::Opened))?;
        debug!("Device {}: {operation:?} check opened", self.device.id());
        Ok(())
    }

    /// Register one line. A refused line cancels the whole check.
    pub fn add_line(&self, operation: OperationType, line: &FiscalLine) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        self.push_line(operation, line).inspect_err(|_| self.abort_check())
    }

    fn push_line(&self, operation: OperationType, line: &FiscalLine) -> Result<()> {
        let params = encode_line(&self.device.operator_password(), operation, line, self.digits())?;
        self.run(Command::FnOperation, &params)?;
        Ok(())
    }

    /// Close the open check. A refused close cancels it.
    pub fn close_check(&self, payment: &CheckPayment) -> Result<CheckClosed> {
        let _guard = self.device.lock_guard(self.token)?;
        self.settle(payment).inspect_err(|_| self.abort_check())
    }

    fn settle(&self, payment: &CheckPayment) -> Result<CheckClosed> {
        let block = build_close_block(&self.device.operator_password(), payment, self.digits())?;
        let resp = self.run(Command::FnCloseCheck, &block)?;
        self.finish_check(CheckEvent::Settled);
        let mut closed = CheckClosed::parse(&resp, self.digits())?;
        closed.shift_number = self.device.with_runtime(|rt| rt.shift_number);
        info!(
            "Device {}: check {} closed",
            self.device.id(),
            closed.document_number
        );
        Ok(closed)
    }

    pub fn cancel_check(&self) -> Result<CancelOutcome> {
        let _guard = self.device.lock_guard(self.token)?;
        let resp = self
            .device
            .execute(Command::CancelCheck, &self.device.operator_password())?;
        match resp.error_code {
            0 => {
                self.finish_check(CheckEvent::Cancelled);
                info!("Device {}: check cancelled", self.device.id());
                Ok(CancelOutcome::Cancelled)
            }
            CHECK_CLOSED => {
                self.finish_check(CheckEvent::Cleared);
                Ok(CancelOutcome::NothingOpen)
            }
            code => Err(EcrError::device(code)),
        }
    }

    fn abort_check(&self) {
        match self.cancel_check() {
            Ok(outcome) => debug!("Device {}: abort left {outcome:?}", self.device.id()),
            Err(e) => warn!("Device {}: cancel after failure failed: {e}", self.device.id()),
        }
    }

    /// The register already completed the document; mirror it locally.
    fn finish_check(&self, event: CheckEvent) {
        self.device.with_runtime(|rt| {
            if let Err(e) = rt.on_check(event) {
                debug!("{e}; resetting local check state");
            }
            rt.check = CheckState::None;
        });
    }

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    /// Document-scoped TLV.
    pub fn send_tag(&self, tag: u16, value: &[u8]) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        self.push_tag(Command::FnSendTag, &self.device.operator_password(), tag, value)
    }

    /// Line-scoped TLV, applies to the line registered last.
    pub fn send_line_tag(&self, tag: u16, value: &[u8]) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        self.push_tag(Command::FnSendLineTag, &self.device.operator_password(), tag, value)
    }

    pub fn send_text_tag(&self, tag: u16, text: &str) -> Result<()> {
        self.send_tag(tag, &encode_cp1251(text))
    }

    fn push_tag(&self, command: Command, password: &[u8; 4], tag: u16, value: &[u8]) -> Result<()> {
        self.run(command, &tag_params(password, tag, value))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Printer and drawer
    // -----------------------------------------------------------------------

    /// Print one line on the receipt ribbon, cut to the device line length.
    pub fn print_line(&self, text: &str) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        let width = self.device.line_length().min(PRINT_WIDTH);
        let mut params = vec![0u8; 5 + PRINT_WIDTH];
        params[..4].copy_from_slice(&self.device.operator_password());
        params[4] = PRINT_FLAGS_RECEIPT;
        let bytes = encode_truncated(text, width);
        params[5..5 + bytes.len()].copy_from_slice(&bytes);
        self.run(Command::PrintString, &params)?;
        Ok(())
    }

    /// Print a non-fiscal text document; requires an open shift.
    pub fn print_text(&self, lines: &[String]) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        require_open_shift(self.refresh()?.shift)?;
        for line in lines {
            self.print_line(line)?;
        }
        Ok(())
    }

    pub fn continue_print(&self) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        self.run(Command::ContinuePrint, &self.device.admin_password())?;
        Ok(())
    }

    pub fn beep(&self) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        self.run(Command::Beep, &self.device.operator_password())?;
        Ok(())
    }

    pub fn open_cash_drawer(&self, drawer: u8) -> Result<()> {
        let _guard = self.device.lock_guard(self.token)?;
        let mut params = self.device.admin_password().to_vec();
        params.push(drawer);
        self.run(Command::OpenCashDrawer, &params)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Whole receipt
    // -----------------------------------------------------------------------

    /// Register a complete receipt under one lock: clear any stray
    /// document, open, send document tags, add lines with their tags,
    /// close. Any failure after the open cancels the check.
    pub fn process_check(&self, request: &CheckRequest) -> Result<CheckClosed> {
        let _guard = self.device.lock_guard(self.token)?;
        require_open_shift(self.refresh()?.shift)?;
        if self.cancel_check()? == CancelOutcome::Cancelled {
            warn!("Device {}: cancelled a stray open document", self.device.id());
        }
        self.open_check(request.operation)?;
        self.fill_and_close(request)
            .inspect_err(|_| self.abort_check())
    }

    fn fill_and_close(&self, request: &CheckRequest) -> Result<CheckClosed> {
        let pass = self.device.operator_password();
        if !request.sender_email.is_empty() {
            self.print_line(&request.sender_email)?;
        }
        let contact = if request.customer_email.is_empty() {
            &request.customer_phone
        } else {
            &request.customer_email
        };
        if !contact.is_empty() {
            self.push_tag(Command::FnSendTag, &pass, tag::CUSTOMER_CONTACT, &encode_cp1251(contact))?;
        }
        if !request.cashier.tax_id.is_empty() {
            self.push_tag(
                Command::FnSendTag,
                &pass,
                tag::CASHIER_TAX_ID,
                request.cashier.tax_id.as_bytes(),
            )?;
        }
        if !request.cashier.name.is_empty() {
            self.push_tag(
                Command::FnSendTag,
                &pass,
                tag::CASHIER_NAME,
                &encode_cp1251(&request.cashier.name),
            )?;
        }

        let mut taxes = TaxTotals::default();
        for line in &request.lines {
            let mut item = line.item.clone();
            if !line.measurement_unit.is_empty() {
                item.name = format!("{} {}", item.name, line.measurement_unit);
            }
            let taxed = match item.tax_amount {
                Some(tax) if tax > 0.0 => tax,
                _ => item.total(),
            };
            taxes.add(item.tax_rate, taxed);
            self.push_line(request.operation, &item)?;
            self.send_line_tags(&pass, line)?;
        }

        let payment = CheckPayment {
            taxes,
            ..request.payment.clone()
        };
        self.settle(&payment)
    }

    fn send_line_tags(&self, pass: &[u8; 4], line: &CheckLine) -> Result<()> {
        let mut tags: Vec<(u16, Vec<u8>)> = Vec::new();
        if !line.marking_code.is_empty() {
            let code = base64::engine::general_purpose::STANDARD
                .decode(line.marking_code.trim())
                .map_err(|e| EcrError::InvalidArgument(format!("marking code: {e}")))?;
            tags.push((tag::MARKING_CODE, code));
        }
        let item = &line.item;
        if item.subject == 2 {
            tags.push((tag::EXCISE_FLAG, vec![1]));
            tags.push((tag::SUBJECT, vec![item.subject]));
            tags.push((tag::PAYMENT_METHOD, vec![item.payment_method]));
            tags.push((tag::ITEM_NAME, encode_cp1251(&item.name)));
            tags.push((tag::QUANTITY, format!("{:.6}", item.quantity).into_bytes()));
            tags.push((tag::UNIT_PRICE, format!("{:.2}", item.price).into_bytes()));
        }
        let text = [
            (tag::AGENT_OPERATION, &line.agent.operation),
            (tag::OPERATOR_TAX_ID, &line.agent.operator_tax_id),
            (tag::OPERATOR_PHONE, &line.agent.operator_phone),
            (tag::OPERATOR_NAME, &line.agent.operator_name),
            (tag::OPERATOR_ADDRESS, &line.agent.operator_address),
            (tag::VENDOR_NAME, &line.vendor.name),
            (tag::VENDOR_PHONE, &line.vendor.phone),
            (tag::MEASUREMENT_UNIT, &line.measurement_unit),
        ];
        tags.extend(
            text.iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(id, v)| (*id, encode_cp1251(v))),
        );
        if !line.vendor.tax_id.is_empty() {
            tags.push((tag::VENDOR_TAX_ID, line.vendor.tax_id.as_bytes().to_vec()));
        }
        for (id, value) in tags {
            self.push_tag(Command::FnSendLineTag, pass, id, &value)?;
        }
        Ok(())
    }
}
