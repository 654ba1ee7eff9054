//! Per-device protocol limits
//!
//! The Modbus specification caps a single request at 125 registers / 2000
//! coils read and 123 registers / 1968 coils written, but plenty of field
//! hardware tolerates far less, or needs a breather between requests.
//! [`DeviceLimits`] captures those caps per device; the session layer uses
//! them to split oversized reads into compliant chunks.

use crate::constants::{
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

/// Device-specific Modbus protocol limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum registers per read request.
    pub max_read_registers: u16,
    /// Maximum registers per write request.
    pub max_write_registers: u16,
    /// Maximum coils per read request.
    pub max_read_coils: u16,
    /// Maximum coils per write request.
    pub max_write_coils: u16,
    /// Minimum delay between consecutive requests (milliseconds).
    pub inter_request_delay_ms: u64,
}

impl DeviceLimits {
    /// Limits straight from the Modbus specification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduced limits for older or slow devices: 50 registers, 500 coils,
    /// 10 ms between requests.
    pub fn conservative() -> Self {
        Self {
            max_read_registers: 50,
            max_write_registers: 50,
            max_read_coils: 500,
            max_write_coils: 500,
            inter_request_delay_ms: 10,
        }
    }

    /// Set maximum read registers.
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count;
        self
    }

    /// Set maximum write registers.
    pub fn with_max_write_registers(mut self, count: u16) -> Self {
        self.max_write_registers = count;
        self
    }

    /// Set maximum read coils.
    pub fn with_max_read_coils(mut self, count: u16) -> Self {
        self.max_read_coils = count;
        self
    }

    /// Set maximum write coils.
    pub fn with_max_write_coils(mut self, count: u16) -> Self {
        self.max_write_coils = count;
        self
    }

    /// Set the inter-request delay in milliseconds.
    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay_ms = delay_ms;
        self
    }

    /// Per-request read cap for a function code.
    pub fn read_limit(&self, fc: u8) -> u16 {
        match fc {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => self.max_read_coils,
            _ => self.max_read_registers,
        }
    }

    /// Split a read of `quantity` items starting at `address` into
    /// `(address, count)` chunks each within this device's limit.
    pub fn read_chunks(&self, fc: u8, address: u16, quantity: u16) -> Vec<(u16, u16)> {
        let limit = self.read_limit(fc).max(1);
        let mut chunks = Vec::new();
        let mut current = address;
        let mut remaining = quantity;
        while remaining > 0 {
            let count = remaining.min(limit);
            chunks.push((current, count));
            current = current.saturating_add(count);
            remaining -= count;
        }
        chunks
    }

    /// True when a register read of `count` fits a single request.
    pub fn read_fits(&self, fc: u8, count: u16) -> bool {
        count <= self.read_limit(fc)
    }

    /// True when a register write of `count` fits a single request.
    pub fn write_fits(&self, count: u16) -> bool {
        count <= self.max_write_registers
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: MAX_READ_REGISTERS,
            max_write_registers: MAX_WRITE_REGISTERS,
            max_read_coils: MAX_READ_COILS,
            max_write_coils: MAX_WRITE_COILS,
            inter_request_delay_ms: 0,
        }
    }
}
