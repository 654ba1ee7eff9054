//! Register/value codec
//!
//! Conversion between raw 16-bit registers and typed parameter values, in
//! both directions. Decoding feeds the poller; encoding feeds the setpoint
//! write path, where every numeric type is range-checked before it is
//! allowed onto the wire.

use crate::bytes::ByteOrder;
use crate::error::{GatewayError, GatewayResult};
use crate::value::{DataType, PointValue};

/// Require at least `need` registers for a decode.
fn require(registers: &[u16], need: usize, data_type: DataType) -> GatewayResult<()> {
    if registers.len() < need {
        return Err(GatewayError::decode(format!(
            "{data_type} needs {need} register(s), got {}",
            registers.len()
        )));
    }
    Ok(())
}

/// Decode raw registers into a typed value.
///
/// `bit_position` selects the bit inside `registers[0]` for BOOL parameters
/// (LSB = 0) and is ignored for every other type. Multi-register types
/// consume registers in wire order and rearrange them per `byte_order`.
pub fn decode_value(
    registers: &[u16],
    data_type: DataType,
    byte_order: ByteOrder,
    bit_position: u8,
) -> GatewayResult<PointValue> {
    match data_type {
        DataType::Bool => {
            require(registers, 1, data_type)?;
            if bit_position > 15 {
                return Err(GatewayError::decode(format!(
                    "Invalid bit position {bit_position} (must be 0-15)"
                )));
            }
            Ok(PointValue::Bool((registers[0] >> bit_position) & 1 != 0))
        }

        DataType::Uint16 => {
            require(registers, 1, data_type)?;
            let raw = u16::from_be_bytes(byte_order.bytes_2(registers[0]));
            Ok(PointValue::Number(f64::from(raw)))
        }

        DataType::Int16 => {
            require(registers, 1, data_type)?;
            let raw = i16::from_be_bytes(byte_order.bytes_2(registers[0]));
            Ok(PointValue::Number(f64::from(raw)))
        }

        DataType::Uint32 => {
            require(registers, 2, data_type)?;
            let raw = u32::from_be_bytes(byte_order.bytes_4(&[registers[0], registers[1]]));
            Ok(PointValue::Number(f64::from(raw)))
        }

        DataType::Int32 => {
            require(registers, 2, data_type)?;
            let raw = i32::from_be_bytes(byte_order.bytes_4(&[registers[0], registers[1]]));
            Ok(PointValue::Number(f64::from(raw)))
        }

        DataType::Float32 => {
            require(registers, 2, data_type)?;
            let raw = f32::from_be_bytes(byte_order.bytes_4(&[registers[0], registers[1]]));
            Ok(PointValue::Number(f64::from(raw)))
        }

        DataType::Float64 => {
            require(registers, 4, data_type)?;
            let raw = f64::from_be_bytes(byte_order.bytes_8(&[
                registers[0],
                registers[1],
                registers[2],
                registers[3],
            ]));
            Ok(PointValue::Number(raw))
        }

        DataType::String => {
            require(registers, 1, data_type)?;
            let mut text = String::with_capacity(registers.len() * 2);
            'words: for &reg in registers {
                for byte in byte_order.bytes_2(reg) {
                    if byte == 0 {
                        break 'words;
                    }
                    // Replace non-ASCII noise rather than failing the entry.
                    text.push(if byte.is_ascii() { byte as char } else { '?' });
                }
            }
            Ok(PointValue::Text(text))
        }

        DataType::Raw => {
            require(registers, 1, data_type)?;
            Ok(PointValue::Raw(registers.to_vec()))
        }
    }
}

/// Encode an engineering value into registers for a write request.
///
/// Numeric inputs are range-checked against the target type; signed types
/// convert through two's complement into the 0..65535 wire representation.
pub fn encode_value(
    value: f64,
    data_type: DataType,
    byte_order: ByteOrder,
) -> GatewayResult<Vec<u16>> {
    if !value.is_finite() {
        return Err(GatewayError::decode(format!(
            "Cannot encode non-finite value as {data_type}"
        )));
    }

    match data_type {
        DataType::Bool => Ok(vec![u16::from(value != 0.0)]),

        DataType::Uint16 => {
            check_range(value, 0.0, 65_535.0, data_type)?;
            let raw = value.round() as u16;
            Ok(vec![byte_order.regs_1(raw.to_be_bytes())])
        }

        DataType::Int16 => {
            check_range(value, -32_768.0, 32_767.0, data_type)?;
            let raw = (value.round() as i16).to_be_bytes();
            Ok(vec![byte_order.regs_1(raw)])
        }

        DataType::Uint32 => {
            check_range(value, 0.0, f64::from(u32::MAX), data_type)?;
            let raw = (value.round() as u32).to_be_bytes();
            Ok(byte_order.regs_2(raw).to_vec())
        }

        DataType::Int32 => {
            check_range(value, f64::from(i32::MIN), f64::from(i32::MAX), data_type)?;
            let raw = (value.round() as i32).to_be_bytes();
            Ok(byte_order.regs_2(raw).to_vec())
        }

        DataType::Float32 => {
            let narrowed = value as f32;
            if !narrowed.is_finite() {
                return Err(GatewayError::decode(format!(
                    "Value {value} overflows FLOAT32"
                )));
            }
            Ok(byte_order.regs_2(narrowed.to_be_bytes()).to_vec())
        }

        DataType::Float64 => Ok(byte_order.regs_4(value.to_be_bytes()).to_vec()),

        DataType::String | DataType::Raw => Err(GatewayError::decode(format!(
            "{data_type} parameters are not writable as numbers"
        ))),
    }
}

#[inline]
fn check_range(value: f64, min: f64, max: f64, data_type: DataType) -> GatewayResult<()> {
    if value < min || value > max {
        return Err(GatewayError::decode(format!(
            "Value {value} out of {data_type} range [{min}, {max}]"
        )));
    }
    Ok(())
}

/// Number of registers a parameter occupies: its explicit `word_count` when
/// set, otherwise the data type's default.
#[inline]
pub fn effective_word_count(data_type: DataType, word_count: Option<u16>) -> u16 {
    word_count.unwrap_or_else(|| data_type.default_word_count())
}
