//! Byte/word order handling for multi-register values
//!
//! Field devices disagree on how the 16-bit words of a 32/64-bit value are
//! arranged. Orders are named with the ABCD convention, where A is the most
//! significant byte of the value and D the least significant (for 32-bit):
//!
//! | Order | Register bytes (first..last) | Typical source |
//! |-------|------------------------------|----------------|
//! | ABCD  | A B C D | network order, Schneider |
//! | CDAB  | C D A B | word-swapped, common on Chinese energy analyzers |
//! | BADC  | B A D C | byte-swapped words, Siemens |
//! | DCBA  | D C B A | full little-endian |
//! | AB    | A B     | single-register, high byte first |
//! | BA    | B A     | single-register, low byte first |
//!
//! 64-bit values extend the same patterns across four registers: CDAB
//! reverses the word sequence, BADC swaps the bytes inside each word in
//! place, DCBA reverses everything.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Word/byte arrangement of a multi-register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    /// A B C D - big-endian words in order
    #[serde(rename = "ABCD", alias = "abcd", alias = "BE", alias = "BIG_ENDIAN")]
    Abcd,
    /// C D A B - big-endian words, word-swapped
    #[serde(rename = "CDAB", alias = "cdab")]
    Cdab,
    /// B A D C - little-endian words in order
    #[serde(rename = "BADC", alias = "badc")]
    Badc,
    /// D C B A - full little-endian
    #[serde(rename = "DCBA", alias = "dcba", alias = "LE", alias = "LITTLE_ENDIAN")]
    Dcba,
    /// A B - 16-bit value, high byte first
    #[serde(rename = "AB", alias = "ab")]
    Ab,
    /// B A - 16-bit value, low byte first
    #[serde(rename = "BA", alias = "ba")]
    Ba,
}

impl ByteOrder {
    /// Parse the common string spellings used in device definitions.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" | "BE" | "BIGENDIAN" => Some(Self::Abcd),
            "CDAB" => Some(Self::Cdab),
            "BADC" => Some(Self::Badc),
            "DCBA" | "LE" | "LITTLEENDIAN" => Some(Self::Dcba),
            "AB" => Some(Self::Ab),
            "BA" => Some(Self::Ba),
            _ => None,
        }
    }

    /// Canonical four-letter (or two-letter) name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abcd => "ABCD",
            Self::Cdab => "CDAB",
            Self::Badc => "BADC",
            Self::Dcba => "DCBA",
            Self::Ab => "AB",
            Self::Ba => "BA",
        }
    }

    /// True for the orders that only describe a single register.
    #[inline]
    pub fn is_single_register(&self) -> bool {
        matches!(self, Self::Ab | Self::Ba)
    }

    /// True when 32/64-bit words are swapped relative to big-endian.
    #[inline]
    pub fn has_word_swap(&self) -> bool {
        matches!(self, Self::Cdab | Self::Badc)
    }

    // ------------------------------------------------------------------
    // Registers -> value bytes (MSB first)
    // ------------------------------------------------------------------

    /// Arrange one register's bytes for a 16-bit value.
    #[inline]
    pub fn bytes_2(&self, reg: u16) -> [u8; 2] {
        let [hi, lo] = reg.to_be_bytes();
        match self {
            Self::Ba | Self::Dcba | Self::Badc => [lo, hi],
            _ => [hi, lo],
        }
    }

    /// Arrange two registers' bytes into the value's big-endian byte order.
    #[inline]
    pub fn bytes_4(&self, regs: &[u16; 2]) -> [u8; 4] {
        let [a, b] = regs[0].to_be_bytes();
        let [c, d] = regs[1].to_be_bytes();
        match self {
            Self::Abcd | Self::Ab => [a, b, c, d],
            Self::Cdab => [c, d, a, b],
            Self::Badc => [b, a, d, c],
            Self::Dcba | Self::Ba => [d, c, b, a],
        }
    }

    /// Arrange four registers' bytes into the value's big-endian byte order.
    #[inline]
    pub fn bytes_8(&self, regs: &[u16; 4]) -> [u8; 8] {
        let [a, b] = regs[0].to_be_bytes();
        let [c, d] = regs[1].to_be_bytes();
        let [e, f] = regs[2].to_be_bytes();
        let [g, h] = regs[3].to_be_bytes();
        match self {
            Self::Abcd | Self::Ab => [a, b, c, d, e, f, g, h],
            Self::Cdab => [g, h, e, f, c, d, a, b],
            Self::Badc => [b, a, d, c, f, e, h, g],
            Self::Dcba | Self::Ba => [h, g, f, e, d, c, b, a],
        }
    }

    // ------------------------------------------------------------------
    // Value bytes (MSB first) -> registers
    // ------------------------------------------------------------------

    /// Inverse of [`bytes_2`](Self::bytes_2).
    #[inline]
    pub fn regs_1(&self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::Ba | Self::Dcba | Self::Badc => u16::from_be_bytes([bytes[1], bytes[0]]),
            _ => u16::from_be_bytes(bytes),
        }
    }

    /// Inverse of [`bytes_4`](Self::bytes_4).
    #[inline]
    pub fn regs_2(&self, bytes: [u8; 4]) -> [u16; 2] {
        let wire = match self {
            Self::Abcd | Self::Ab => bytes,
            Self::Cdab => [bytes[2], bytes[3], bytes[0], bytes[1]],
            Self::Badc => [bytes[1], bytes[0], bytes[3], bytes[2]],
            Self::Dcba | Self::Ba => [bytes[3], bytes[2], bytes[1], bytes[0]],
        };
        [
            u16::from_be_bytes([wire[0], wire[1]]),
            u16::from_be_bytes([wire[2], wire[3]]),
        ]
    }

    /// Inverse of [`bytes_8`](Self::bytes_8).
    #[inline]
    pub fn regs_4(&self, bytes: [u8; 8]) -> [u16; 4] {
        let wire = match self {
            Self::Abcd | Self::Ab => bytes,
            Self::Cdab => [
                bytes[6], bytes[7], bytes[4], bytes[5], bytes[2], bytes[3], bytes[0], bytes[1],
            ],
            Self::Badc => [
                bytes[1], bytes[0], bytes[3], bytes[2], bytes[5], bytes[4], bytes[7], bytes[6],
            ],
            Self::Dcba | Self::Ba => [
                bytes[7], bytes[6], bytes[5], bytes[4], bytes[3], bytes[2], bytes[1], bytes[0],
            ],
        };
        [
            u16::from_be_bytes([wire[0], wire[1]]),
            u16::from_be_bytes([wire[2], wire[3]]),
            u16::from_be_bytes([wire[4], wire[5]]),
            u16::from_be_bytes([wire[6], wire[7]]),
        ]
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for ByteOrder {
    /// Big-endian is the Modbus network default.
    fn default() -> Self {
        Self::Abcd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ORDERS_32: [ByteOrder; 4] = [
        ByteOrder::Abcd,
        ByteOrder::Cdab,
        ByteOrder::Badc,
        ByteOrder::Dcba,
    ];

    #[test]
    fn test_parse() {
        assert_eq!(ByteOrder::parse("ABCD"), Some(ByteOrder::Abcd));
        assert_eq!(ByteOrder::parse("ab-cd"), Some(ByteOrder::Abcd));
        assert_eq!(ByteOrder::parse("cdab"), Some(ByteOrder::Cdab));
        assert_eq!(ByteOrder::parse("BADC"), Some(ByteOrder::Badc));
        assert_eq!(ByteOrder::parse("little_endian"), Some(ByteOrder::Dcba));
        assert_eq!(ByteOrder::parse("AB"), Some(ByteOrder::Ab));
        assert_eq!(ByteOrder::parse("BA"), Some(ByteOrder::Ba));
        assert_eq!(ByteOrder::parse("XY"), None);
        assert_eq!(ByteOrder::parse(""), None);
    }

    #[test]
    fn test_bytes_4_all_orders() {
        let regs = [0x1234, 0x5678];
        assert_eq!(ByteOrder::Abcd.bytes_4(&regs), [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(ByteOrder::Cdab.bytes_4(&regs), [0x56, 0x78, 0x12, 0x34]);
        assert_eq!(ByteOrder::Badc.bytes_4(&regs), [0x34, 0x12, 0x78, 0x56]);
        assert_eq!(ByteOrder::Dcba.bytes_4(&regs), [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_bytes_8_all_orders() {
        let regs = [0x1234, 0x5678, 0x9ABC, 0xDEF0];
        assert_eq!(
            ByteOrder::Abcd.bytes_8(&regs),
            [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0]
        );
        assert_eq!(
            ByteOrder::Cdab.bytes_8(&regs),
            [0xDE, 0xF0, 0x9A, 0xBC, 0x56, 0x78, 0x12, 0x34]
        );
        assert_eq!(
            ByteOrder::Badc.bytes_8(&regs),
            [0x34, 0x12, 0x78, 0x56, 0xBC, 0x9A, 0xF0, 0xDE]
        );
        assert_eq!(
            ByteOrder::Dcba.bytes_8(&regs),
            [0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_bytes_2() {
        assert_eq!(ByteOrder::Ab.bytes_2(0x1234), [0x12, 0x34]);
        assert_eq!(ByteOrder::Ba.bytes_2(0x1234), [0x34, 0x12]);
    }

    #[test]
    fn test_f32_decode_cdab() {
        // 3.14f32 is 0x4048F5C3
        let regs = [0x4048, 0xF5C3];
        let value = f32::from_be_bytes(ByteOrder::Abcd.bytes_4(&regs));
        assert!((value - 3.14).abs() < 1e-6);

        // Same value with swapped words on the wire
        let regs = [0xF5C3, 0x4048];
        let value = f32::from_be_bytes(ByteOrder::Cdab.bytes_4(&regs));
        assert!((value - 3.14).abs() < 1e-6);
    }

    #[test]
    fn test_properties() {
        assert!(ByteOrder::Ab.is_single_register());
        assert!(!ByteOrder::Abcd.is_single_register());
        assert!(ByteOrder::Cdab.has_word_swap());
        assert!(ByteOrder::Badc.has_word_swap());
        assert!(!ByteOrder::Dcba.has_word_swap());
    }

    #[test]
    fn test_default() {
        assert_eq!(ByteOrder::default(), ByteOrder::Abcd);
    }

    proptest! {
        #[test]
        fn prop_regs_2_inverts_bytes_4(r0 in any::<u16>(), r1 in any::<u16>()) {
            for order in ORDERS_32 {
                let regs = [r0, r1];
                let bytes = order.bytes_4(&regs);
                prop_assert_eq!(order.regs_2(bytes), regs, "order {}", order);
            }
        }

        #[test]
        fn prop_regs_4_inverts_bytes_8(
            r0 in any::<u16>(), r1 in any::<u16>(), r2 in any::<u16>(), r3 in any::<u16>()
        ) {
            for order in ORDERS_32 {
                let regs = [r0, r1, r2, r3];
                let bytes = order.bytes_8(&regs);
                prop_assert_eq!(order.regs_4(bytes), regs, "order {}", order);
            }
        }

        #[test]
        fn prop_regs_1_inverts_bytes_2(reg in any::<u16>()) {
            for order in [ByteOrder::Ab, ByteOrder::Ba] {
                prop_assert_eq!(order.regs_1(order.bytes_2(reg)), reg);
            }
        }
    }
}
