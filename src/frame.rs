//! Wire framing for Modbus TCP (MBAP) and RTU (CRC-16)
//!
//! Both transports carry the same PDU; only the envelope differs:
//!
//! - **TCP**: 7-byte MBAP prefix `{transaction_id, protocol_id=0, length,
//!   unit_id}` where `length` counts the unit id plus the PDU.
//! - **RTU**: `unit_id | PDU | CRC-16` with the CRC transmitted low byte
//!   first. Frame boundaries are predicted from the function code instead of
//!   relying on inter-frame silence, which is not observable through a
//!   typical OS serial driver.

use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{Buf, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tracing::{debug, warn};

use crate::constants::{
    MAX_MBAP_LENGTH, MBAP_HEADER_LEN, RTU_EXCEPTION_FRAME_LEN, RTU_FRAME_OVERHEAD,
    RTU_WRITE_ECHO_FRAME_LEN,
};
use crate::error::{GatewayError, GatewayResult};
use crate::pdu::ModbusPdu;

/// CRC-16/MODBUS: polynomial 0xA001 (reflected 0x8005), initial 0xFFFF,
/// low bit processed first.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

// ============================================================================
// Transaction ids
// ============================================================================

/// Monotonic 16-bit transaction id generator, wrapping at 65535.
///
/// One counter per TCP connection; responses are correlated against the id
/// they were issued with.
#[derive(Debug, Default)]
pub struct TransactionCounter {
    next: AtomicU16,
}

impl TransactionCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next transaction id.
    #[inline]
    pub fn next_id(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// MBAP (TCP)
// ============================================================================

/// Decoded MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Correlation id echoed by the server
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    /// Addressed unit behind the endpoint
    pub unit_id: u8,
}

/// Encode a full Modbus TCP frame: MBAP header followed by the PDU.
pub fn encode_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());

    debug!(
        "TCP frame encoded: txid={}, unit={}, len={}",
        transaction_id,
        unit_id,
        frame.len()
    );
    frame
}

/// Try to extract one complete TCP frame from the receive buffer.
///
/// The buffer is fed incrementally by the socket reader; a frame is complete
/// once `length + 6` bytes are available. Returns `Ok(None)` until then.
/// Consumed bytes are removed from the buffer.
pub fn extract_tcp_frame(buf: &mut BytesMut) -> GatewayResult<Option<(MbapHeader, ModbusPdu)>> {
    if buf.len() < MBAP_HEADER_LEN + 1 {
        return Ok(None);
    }

    let length = u16::from_be_bytes([buf[4], buf[5]]);
    if length == 0 || length as usize > MAX_MBAP_LENGTH {
        // The stream is hopelessly out of sync; drop everything buffered
        // so the reader does not spin on the same bad header.
        buf.clear();
        return Err(GatewayError::frame(format!(
            "Invalid MBAP length field: {length}"
        )));
    }

    let total = MBAP_HEADER_LEN + length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let header = MbapHeader {
        transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
        protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
        length,
        unit_id: buf[6],
    };

    if header.protocol_id != 0 {
        // Not Modbus; drop the frame and resynchronise on the next one.
        buf.advance(total);
        return Err(GatewayError::frame(format!(
            "Non-zero MBAP protocol id: {}",
            header.protocol_id
        )));
    }

    let pdu = ModbusPdu::from_slice(&buf[MBAP_HEADER_LEN + 1..total])?;
    buf.advance(total);

    debug!(
        "TCP frame extracted: txid={}, unit={}, pdu_len={}",
        header.transaction_id,
        header.unit_id,
        pdu.len()
    );
    Ok(Some((header, pdu)))
}

// ============================================================================
// CRC-16 (RTU)
// ============================================================================

/// Compute the Modbus CRC-16 of a byte slice.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Append the CRC of `frame` to it, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Verify the trailing CRC of a complete RTU frame.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < RTU_FRAME_OVERHEAD {
        return false;
    }
    let (payload, tail) = frame.split_at(frame.len() - 2);
    crc16(payload).to_le_bytes() == [tail[0], tail[1]]
}

// ============================================================================
// RTU framing
// ============================================================================

/// Encode a full RTU frame: unit id, PDU, CRC-16 (little-endian).
pub fn encode_rtu_frame(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    append_crc(&mut frame);

    debug!("RTU frame encoded: unit={}, len={}", unit_id, frame.len());
    frame
}

/// Predict the total RTU frame length from the bytes received so far.
///
/// Returns `None` while too few bytes have arrived to decide:
/// - exception responses (fc high bit set) are always 5 bytes;
/// - write echoes (FC 05/06/15/16) are always 8 bytes;
/// - read responses (FC 01-04) are `5 + byte_count`, where the byte count
///   is the third byte of the frame.
pub fn predict_rtu_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let fc = buf[1];
    if fc & 0x80 != 0 {
        return Some(RTU_EXCEPTION_FRAME_LEN);
    }
    match fc {
        0x05 | 0x06 | 0x0F | 0x10 => Some(RTU_WRITE_ECHO_FRAME_LEN),
        0x01..=0x04 => {
            if buf.len() < 3 {
                None
            } else {
                Some(RTU_FRAME_OVERHEAD + 2 + buf[2] as usize)
            }
        }
        _ => {
            // Unknown function code; treat like an exception-sized frame so
            // reception terminates and the CRC check rejects it.
            warn!("Cannot predict RTU frame length for FC {fc:#04X}");
            Some(RTU_EXCEPTION_FRAME_LEN)
        }
    }
}

/// Decode a complete RTU frame into its unit id and PDU.
///
/// Frames with an invalid CRC are rejected with a frame error; the RTU
/// transport drops them silently so the pending request times out.
pub fn decode_rtu_frame(frame: &[u8]) -> GatewayResult<(u8, ModbusPdu)> {
    if frame.len() < RTU_FRAME_OVERHEAD + 1 {
        return Err(GatewayError::frame(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    if !verify_crc(frame) {
        return Err(GatewayError::frame("RTU CRC mismatch"));
    }

    let unit_id = frame[0];
    let pdu = ModbusPdu::from_slice(&frame[1..frame.len() - 2])?;
    Ok((unit_id, pdu))
}
