//! Modbus protocol constants based on the official specification
//!
//! Frame-size limits derive from the RS485 ADU ceiling of 256 bytes; the
//! per-function quantity limits are calculated so the resulting PDU fits
//! within that ceiling.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes; the
/// Unit ID byte is counted by the Length field, not by this constant.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Receive buffer size for assembling Modbus frames
///
/// Theoretical max TCP frame: 6 (MBAP) + 254 = 260 bytes; 512 leaves margin.
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// RTU frame overhead: unit id (1 byte) + CRC-16 (2 bytes)
pub const RTU_FRAME_OVERHEAD: usize = 3;

/// RTU exception responses are always unit + fc + code + CRC = 5 bytes
pub const RTU_EXCEPTION_FRAME_LEN: usize = 5;

/// RTU write echoes (FC 05/06/15/16) are always unit + fc + addr + qty/value
/// + CRC = 8 bytes
pub const RTU_WRITE_ECHO_FRAME_LEN: usize = 8;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum quantity for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: fc (1) + byte count (1) + N * 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum quantity for FC16 (Write Multiple Registers)
///
/// Request PDU: fc (1) + addr (2) + qty (2) + byte count (1) + N * 2 ≤ 253
/// → N ≤ 123
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum quantity for FC01/FC02 (Read Coils/Discrete Inputs)
///
/// Response PDU: fc (1) + byte count (1) + ceil(N / 8) ≤ 253 gives 2008;
/// the specification fixes the limit at 2000.
pub const MAX_READ_COILS: u16 = 2000;

/// Maximum quantity for FC15 (Write Multiple Coils)
///
/// Request PDU: fc (1) + addr (2) + qty (2) + byte count (1) + ceil(N / 8)
/// ≤ 253 gives 1976; the specification fixes the limit at 1968 (0x7B0).
pub const MAX_WRITE_COILS: u16 = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Transport Defaults
// ============================================================================

/// Default per-request timeout for TCP devices (milliseconds)
pub const DEFAULT_TCP_TIMEOUT_MS: u64 = 5000;

/// Default per-request timeout for RTU devices (milliseconds)
pub const DEFAULT_RTU_TIMEOUT_MS: u64 = 1000;

/// Default connect timeout for on-demand connects, e.g. schedule-driven
/// setpoint writes (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default delay between automatic reconnect attempts (milliseconds)
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Return the read-quantity limit for a read function code, if it is one.
pub fn read_quantity_limit(fc: u8) -> Option<u16> {
    match fc {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => Some(MAX_READ_COILS),
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => Some(MAX_READ_REGISTERS),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MAX_READ_REGISTERS, 125);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS as usize * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MAX_WRITE_REGISTERS, 123);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + (MAX_READ_COILS as usize).div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);
        assert_eq!(MAX_READ_COILS, 2000);

        let write_coil_pdu = 1 + 2 + 2 + 1 + (MAX_WRITE_COILS as usize).div_ceil(8);
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
        assert_eq!(MAX_WRITE_COILS, 1968);
    }

    #[test]
    fn test_read_quantity_limit() {
        assert_eq!(read_quantity_limit(0x01), Some(2000));
        assert_eq!(read_quantity_limit(0x02), Some(2000));
        assert_eq!(read_quantity_limit(0x03), Some(125));
        assert_eq!(read_quantity_limit(0x04), Some(125));
        assert_eq!(read_quantity_limit(0x06), None);
    }
}
