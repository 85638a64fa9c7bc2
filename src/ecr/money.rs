//! Fixed-point encoding of money and quantities.
//!
//! The register stores amounts as little-endian integers in fixed-width
//! slots. Scaling rounds half away from zero.

use crate::ecr::error::{EcrError, Result};

/// Slot value meaning "let the register compute this field".
pub const UNSET_5: i64 = 0xFF_FFFF_FFFF;

/// Scale `value` by `10^digits`, rounding half away from zero.
pub fn scale_units(value: f64, digits: u32) -> i64 {
    (value * 10f64.powi(digits as i32)).round() as i64
}

/// Money to minor units at `digits` decimal places.
pub fn money_to_units(value: f64, digits: u32) -> i64 {
    scale_units(value, digits)
}

/// Quantity in thousandths (register quantity precision).
pub fn quantity_to_units(quantity: f64) -> i64 {
    scale_units(quantity, 3)
}

/// Quantity in millionths, as carried by the fiscal line operation.
pub fn line_quantity_units(quantity: f64) -> i64 {
    scale_units(quantity, 6)
}

/// Minor units back to money.
pub fn units_to_money(units: i64, digits: u32) -> f64 {
    units as f64 / 10f64.powi(digits as i32)
}

/// Write `value` little-endian into `buf[offset..offset + width]`.
///
/// Fails if the value does not fit the slot or is negative.
pub fn put_le(buf: &mut [u8], offset: usize, width: usize, value: i64) -> Result<()> {
    if value < 0 {
        return Err(EcrError::InvalidArgument(format!("negative value {value}")));
    }
    if width < 8 && (value as u64) >> (width * 8) != 0 {
        return Err(EcrError::InvalidArgument(format!(
            "value {value} does not fit {width} bytes"
        )));
    }
    let slot = buf.get_mut(offset..offset + width).ok_or_else(|| {
        EcrError::InvalidArgument(format!("slot {offset}+{width} outside block"))
    })?;
    slot.copy_from_slice(&(value as u64).to_le_bytes()[..width]);
    Ok(())
}

/// Read up to eight little-endian bytes as an unsigned integer.
pub fn read_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}
