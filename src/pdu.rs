//! Modbus PDU construction and inspection
//!
//! A PDU is the transport-independent part of every Modbus message: function
//! code plus operation-specific bytes. The same PDU is wrapped in an MBAP
//! header on TCP and in unit id + CRC on RTU (see [`crate::frame`]).
//!
//! Uses a fixed-size stack array to avoid heap allocation on the hot path.

use tracing::debug;

use crate::constants::{
    read_quantity_limit, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
    MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::{GatewayError, GatewayResult};

/// Stack-allocated Modbus PDU.
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU.
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from received bytes.
    #[inline]
    pub fn from_slice(data: &[u8]) -> GatewayResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(GatewayError::frame(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(fc) = pdu.function_code() {
            if pdu.is_exception() {
                debug!(
                    "PDU parsed: FC={:02X} exception, code={:02X}",
                    fc,
                    pdu.exception_code().unwrap_or(0)
                );
            } else {
                debug!(
                    "PDU parsed: FC={:02X} ({}), data_len={}",
                    fc,
                    Self::function_name(fc),
                    pdu.len - 1
                );
            }
        }

        Ok(pdu)
    }

    /// Append a single byte.
    #[inline]
    pub fn push(&mut self, byte: u8) -> GatewayResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(GatewayError::frame("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Append a u16 in big-endian wire order.
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> GatewayResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    /// Append a byte slice.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> GatewayResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(GatewayError::frame(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// View the PDU bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Current length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes have been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte), if present.
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// True when the function-code byte has the exception bit set.
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code().is_some_and(|fc| fc & 0x80 != 0)
    }

    /// Exception code byte of an exception response.
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Fail with [`GatewayError::ModbusException`] when this PDU is an
    /// exception response, otherwise pass it through unchanged.
    pub fn reject_exception(self) -> GatewayResult<Self> {
        if self.is_exception() {
            let fc = self.function_code().unwrap_or(0x80);
            let code = self.exception_code().unwrap_or(0);
            return Err(GatewayError::exception(fc, code));
        }
        Ok(self)
    }

    /// Human-readable function-code name for log output.
    pub fn function_name(fc: u8) -> &'static str {
        match fc & 0x7F {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Request builders
// ============================================================================

/// Builders for the request PDUs of every supported function code.
///
/// All builders validate their inputs against the specification limits so an
/// out-of-range request never reaches the wire.
pub struct PduBuilder;

impl PduBuilder {
    /// Build a read request PDU for FC 01-04.
    ///
    /// The quantity is validated against the per-function limit: 2000 for
    /// coil reads, 125 for register reads. Request PDU length is always 5.
    pub fn read_request(fc: u8, start_address: u16, quantity: u16) -> GatewayResult<ModbusPdu> {
        let limit = read_quantity_limit(fc)
            .ok_or_else(|| GatewayError::config(format!("Not a read function code: {fc:#04X}")))?;
        if quantity == 0 || quantity > limit {
            return Err(GatewayError::config(format!(
                "Read quantity {quantity} out of range 1..={limit} for FC{fc:02X}"
            )));
        }
        if u32::from(start_address) + u32::from(quantity) > 65_536 {
            return Err(GatewayError::config(format!(
                "Read range {start_address}+{quantity} exceeds address space"
            )));
        }

        let mut pdu = ModbusPdu::new();
        pdu.push(fc)?;
        pdu.push_u16(start_address)?;
        pdu.push_u16(quantity)?;
        Ok(pdu)
    }

    /// Build a write-single-coil PDU (FC05). ON is 0xFF00, OFF is 0x0000.
    pub fn write_single_coil(address: u16, value: bool) -> GatewayResult<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_SINGLE_COIL)?;
        pdu.push_u16(address)?;
        pdu.push_u16(if value { 0xFF00 } else { 0x0000 })?;
        Ok(pdu)
    }

    /// Build a write-single-register PDU (FC06).
    pub fn write_single_register(address: u16, value: u16) -> GatewayResult<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_SINGLE_REGISTER)?;
        pdu.push_u16(address)?;
        pdu.push_u16(value)?;
        Ok(pdu)
    }

    /// Build a write-multiple-coils PDU (FC15). Coils pack LSB-first.
    pub fn write_multiple_coils(address: u16, values: &[bool]) -> GatewayResult<ModbusPdu> {
        if values.is_empty() || values.len() > MAX_WRITE_COILS as usize {
            return Err(GatewayError::config(format!(
                "Coil count {} out of range 1..={} for FC15",
                values.len(),
                MAX_WRITE_COILS
            )));
        }

        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_MULTIPLE_COILS)?;
        pdu.push_u16(address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push(values.len().div_ceil(8) as u8)?;

        for chunk in values.chunks(8) {
            let mut byte = 0u8;
            for (i, &coil) in chunk.iter().enumerate() {
                if coil {
                    byte |= 1 << i;
                }
            }
            pdu.push(byte)?;
        }

        Ok(pdu)
    }

    /// Build a write-multiple-registers PDU (FC16).
    pub fn write_multiple_registers(address: u16, values: &[u16]) -> GatewayResult<ModbusPdu> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(GatewayError::config(format!(
                "Register count {} out of range 1..={} for FC16",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }

        let mut pdu = ModbusPdu::new();
        pdu.push(FC_WRITE_MULTIPLE_REGISTERS)?;
        pdu.push_u16(address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push((values.len() * 2) as u8)?;
        for &value in values {
            pdu.push_u16(value)?;
        }

        Ok(pdu)
    }
}

// ============================================================================
// Response parsers
// ============================================================================

/// Parse a read response PDU (FC 01-04) into raw register words.
///
/// For FC01/02 each response byte carries up to eight packed bits and is
/// widened to a `u16` so callers process coils and registers uniformly.
/// An exception response is surfaced as [`GatewayError::ModbusException`].
pub fn parse_read_response(pdu: &ModbusPdu, expected_fc: u8) -> GatewayResult<Vec<u16>> {
    let data = pdu.as_slice();
    if data.is_empty() {
        return Err(GatewayError::frame("Empty response PDU"));
    }

    if pdu.is_exception() {
        return Err(GatewayError::exception(
            data[0],
            pdu.exception_code().unwrap_or(0),
        ));
    }

    if data[0] != expected_fc {
        return Err(GatewayError::frame(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            expected_fc, data[0]
        )));
    }
    if data.len() < 2 {
        return Err(GatewayError::frame("Read response missing byte count"));
    }

    let byte_count = data[1] as usize;
    let payload = &data[2..];
    if payload.len() < byte_count {
        return Err(GatewayError::frame(format!(
            "Read response truncated: byte count {} but {} bytes present",
            byte_count,
            payload.len()
        )));
    }

    match expected_fc {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
            Ok(payload[..byte_count].iter().map(|&b| u16::from(b)).collect())
        }
        _ => Ok(payload[..byte_count]
            .chunks_exact(2)
            .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
            .collect()),
    }
}

/// Unpack the bit payload of an FC01/02 response into booleans.
pub fn unpack_bits(bytes: &[u16], quantity: u16) -> Vec<bool> {
    let mut bits = Vec::with_capacity(quantity as usize);
    for i in 0..quantity as usize {
        let byte = bytes.get(i / 8).copied().unwrap_or(0);
        bits.push((byte >> (i % 8)) & 1 != 0);
    }
    bits
}

/// Validate a write response PDU (FC 05/06/15/16).
///
/// Write responses echo the request header; only the function code and
/// exception status are checked here.
pub fn parse_write_response(pdu: &ModbusPdu, expected_fc: u8) -> GatewayResult<()> {
    let data = pdu.as_slice();
    if data.is_empty() {
        return Err(GatewayError::frame("Empty response PDU"));
    }

    if pdu.is_exception() {
        return Err(GatewayError::exception(
            data[0],
            pdu.exception_code().unwrap_or(0),
        ));
    }

    if data[0] != expected_fc {
        return Err(GatewayError::frame(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            expected_fc, data[0]
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_is_five_bytes() {
        for fc in [0x01, 0x02, 0x03, 0x04] {
            let pdu = PduBuilder::read_request(fc, 0x006B, 3).unwrap();
            assert_eq!(pdu.len(), 5);
            assert_eq!(pdu.function_code(), Some(fc));
        }
        let pdu = PduBuilder::read_request(0x03, 0x006B, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_read_request_limits() {
        assert!(PduBuilder::read_request(0x03, 0, 125).is_ok());
        assert!(PduBuilder::read_request(0x03, 0, 126).is_err());
        assert!(PduBuilder::read_request(0x01, 0, 2000).is_ok());
        assert!(PduBuilder::read_request(0x01, 0, 2001).is_err());
        assert!(PduBuilder::read_request(0x03, 0, 0).is_err());
        assert!(PduBuilder::read_request(0x06, 0, 1).is_err());
    }

    #[test]
    fn test_read_request_address_space() {
        assert!(PduBuilder::read_request(0x03, 65_530, 6).is_ok());
        assert!(PduBuilder::read_request(0x03, 65_530, 7).is_err());
    }

    #[test]
    fn test_write_single_coil() {
        let pdu = PduBuilder::write_single_coil(0x00AC, true).unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x00, 0xAC, 0xFF, 0x00]);

        let pdu = PduBuilder::write_single_coil(0x00AC, false).unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x00, 0xAC, 0x00, 0x00]);
    }

    #[test]
    fn test_write_single_register() {
        let pdu = PduBuilder::write_single_register(0x0001, 0x0003).unwrap();
        assert_eq!(pdu.as_slice(), &[0x06, 0x00, 0x01, 0x00, 0x03]);
    }

    #[test]
    fn test_write_multiple_coils() {
        let pdu = PduBuilder::write_multiple_coils(0x0100, &[true, false, true]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x0F, 0x01, 0x00, 0x00, 0x03, 0x01, 0b0000_0101]
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let pdu = PduBuilder::write_multiple_registers(0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_exception_detection() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));
        assert!(pdu.reject_exception().is_err());
    }

    #[test]
    fn test_parse_read_response_registers() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        let regs = parse_read_response(&pdu, 0x03).unwrap();
        assert_eq!(regs, vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_parse_read_response_coils() {
        let pdu = ModbusPdu::from_slice(&[0x01, 0x01, 0b0000_0101]).unwrap();
        let bytes = parse_read_response(&pdu, 0x01).unwrap();
        let bits = unpack_bits(&bytes, 3);
        assert_eq!(bits, vec![true, false, true]);
    }

    #[test]
    fn test_parse_read_response_exception() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        let err = parse_read_response(&pdu, 0x03).unwrap_err();
        assert!(matches!(err, GatewayError::ModbusException { fc: 3, .. }));
    }

    #[test]
    fn test_parse_read_response_fc_mismatch() {
        let pdu = ModbusPdu::from_slice(&[0x04, 0x02, 0x00, 0x01]).unwrap();
        assert!(parse_read_response(&pdu, 0x03).is_err());
    }

    #[test]
    fn test_parse_read_response_truncated() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x12, 0x34]).unwrap();
        assert!(parse_read_response(&pdu, 0x03).is_err());
    }

    #[test]
    fn test_parse_write_response() {
        let pdu = ModbusPdu::from_slice(&[0x06, 0x00, 0x01, 0x00, 0x03]).unwrap();
        assert!(parse_write_response(&pdu, 0x06).is_ok());

        let pdu = ModbusPdu::from_slice(&[0x86, 0x03]).unwrap();
        assert!(parse_write_response(&pdu, 0x06).is_err());
    }
}
