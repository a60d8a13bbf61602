/*! Measurement parameter definitions and the CSV sheet they load from.

The sheet has ten columns: `Name,Address,Size,Bitmask,Unit,Signed,I,
Factor,Offset,Comment`. `Address` and `Bitmask` are hex, `Size` is the
byte count (1..=4), `Signed` and `I` (inverse conversion) are 0/1.
*/
use std::io::Read;

use serde::Deserialize;

use crate::{Error, Result};

/// How a raw sample is interpreted before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    /// Plain (optionally signed) integer.
    #[default]
    Int,
    /// IEEE-754 single-precision float, reinterpreted from the raw
    /// 32-bit value.
    Float,
}

/// One measurement parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct LogParameter {
    name: String,
    addr: u32,
    size: usize,
    data_type: DataType,
    bitmask: u32,
    unit: String,
    is_signed: bool,
    is_inverse: bool,
    factor: f64,
    offset: f64,
    description: String,
}

impl LogParameter {
    /// Build a parameter, validating the size and scaling invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        addr: u32,
        size: usize,
        data_type: DataType,
        bitmask: u32,
        unit: &str,
        is_signed: bool,
        is_inverse: bool,
        factor: f64,
        offset: f64,
        description: &str,
    ) -> Result<Self> {
        if !(1..=4).contains(&size) {
            return Err(Error::invalid(format!(
                "parameter {name:?}: size {size} outside 1..=4"
            )));
        }
        if is_inverse && factor == 0.0 {
            return Err(Error::invalid(format!(
                "parameter {name:?}: inverse conversion with zero factor"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            addr,
            size,
            data_type,
            bitmask,
            unit: unit.to_string(),
            is_signed,
            is_inverse,
            factor,
            offset,
            description: description.to_string(),
        })
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Memory address the value is sampled from.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Sample width in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Unit string for display.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Free-text description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Turn one raw sample into the physical value.
    pub fn format_value(&self, value: u32) -> f64 {
        let base: f64 = if self.data_type == DataType::Float {
            f64::from(f32::from_bits(value))
        } else {
            let mut v = value;
            if self.bitmask != 0 {
                v &= self.bitmask;
            }
            if self.is_signed {
                match self.size {
                    1 => f64::from(v as u8 as i8),
                    2 => f64::from(v as u16 as i16),
                    _ => f64::from(v as i32),
                }
            } else {
                f64::from(v)
            }
        };
        if self.is_inverse {
            self.factor / (base + self.offset)
        } else {
            base * self.factor + self.offset
        }
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Size")]
    size: usize,
    #[serde(rename = "Bitmask")]
    bitmask: String,
    #[serde(rename = "Unit")]
    unit: String,
    #[serde(rename = "Signed")]
    signed: u8,
    #[serde(rename = "I")]
    inverse: u8,
    #[serde(rename = "Factor")]
    factor: f64,
    #[serde(rename = "Offset")]
    offset: f64,
    #[serde(rename = "Comment")]
    comment: String,
}

fn parse_hex(field: &str, what: &str) -> Result<u32> {
    let trimmed = field.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Ok(0);
    }
    u32::from_str_radix(digits, 16)
        .map_err(|_| Error::invalid(format!("bad hex {what} {field:?}")))
}

/// An ordered, immutable set of measurement parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogParameters {
    parameters: Vec<LogParameter>,
}

impl LogParameters {
    /// Wrap a parameter list.
    pub fn new(parameters: Vec<LogParameter>) -> Self {
        Self { parameters }
    }

    /// Load a parameter sheet from CSV.
    pub fn from_csv(input: impl Read) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(input);
        let mut parameters = Vec::new();
        for row in reader.deserialize() {
            let row: CsvRow =
                row.map_err(|e| Error::invalid(format!("parameter sheet: {e}")))?;
            parameters.push(LogParameter::new(
                &row.name,
                parse_hex(&row.address, "address")?,
                row.size,
                DataType::Int,
                parse_hex(&row.bitmask, "bitmask")?,
                &row.unit,
                row.signed > 0,
                row.inverse > 0,
                row.factor,
                row.offset,
                &row.comment,
            )?);
        }
        Ok(Self { parameters })
    }

    /// The parameters, in sheet order.
    pub fn parameters(&self) -> &[LogParameter] {
        &self.parameters
    }

    /// Total sample width of one record in bytes.
    pub fn total_bytes(&self) -> usize {
        self.parameters.iter().map(|p| p.size()).sum()
    }

    /// How many CAN frames one D2 measurement record occupies.
    pub fn can_message_count(&self) -> usize {
        ((self.total_bytes() as f64 - 3.0) / 7.0).ceil() as usize + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHEET: &str = "\
Name,Address,Size,Bitmask,Unit,Signed,I,Factor,Offset,Comment
RPM,0x100A,2,0xFFFF,rpm,0,0,30,0,Engine speed
IAT,0x10C4,1,0xFF,C,1,0,0.75,-48,Intake air temperature
Lambda,0x1180,2,0x0,V,0,1,1250,10,Inverse channel
";

    #[test]
    fn csv_load() -> crate::Result<()> {
        let params = LogParameters::from_csv(SHEET.as_bytes())?;
        assert_eq!(params.parameters().len(), 3);
        let rpm = &params.parameters()[0];
        assert_eq!(rpm.name(), "RPM");
        assert_eq!(rpm.addr(), 0x100A);
        assert_eq!(rpm.size(), 2);
        assert_eq!(rpm.unit(), "rpm");
        assert_eq!(params.total_bytes(), 5);
        Ok(())
    }

    #[test]
    fn scaling() -> crate::Result<()> {
        let params = LogParameters::from_csv(SHEET.as_bytes())?;
        let rpm = &params.parameters()[0];
        assert_eq!(rpm.format_value(25), 750.0);
        // Signed byte: 0xF0 → -16, scaled by 0.75 with -48 offset.
        let iat = &params.parameters()[1];
        assert_eq!(iat.format_value(0xF0), -16.0 * 0.75 - 48.0);
        // Inverse: factor / (value + offset).
        let lambda = &params.parameters()[2];
        assert_eq!(lambda.format_value(240), 1250.0 / 250.0);
        Ok(())
    }

    #[test]
    fn float_reinterpret() -> crate::Result<()> {
        let p = LogParameter::new(
            "Load", 0x2000, 4, DataType::Float, 0, "%", false, false, 1.0, 0.0, "",
        )?;
        assert_eq!(p.format_value(1.5f32.to_bits()), 1.5);
        Ok(())
    }

    #[test]
    fn invariants_enforced() {
        assert!(LogParameter::new("x", 0, 5, DataType::Int, 0, "", false, false, 1.0, 0.0, "").is_err());
        assert!(LogParameter::new("x", 0, 2, DataType::Int, 0, "", false, true, 0.0, 0.0, "").is_err());
    }

    #[test]
    fn frame_count_formula() -> crate::Result<()> {
        let params = LogParameters::from_csv(SHEET.as_bytes())?;
        // 5 bytes → ceil(2/7) + 1 = 2 frames.
        assert_eq!(params.can_message_count(), 2);
        Ok(())
    }
}
