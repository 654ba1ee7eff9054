//! Typed parameter values
//!
//! A [`DataType`] describes how raw registers are interpreted; a
//! [`PointValue`] is the decoded result carried through scaling, the
//! realtime cache and the push channel. Numeric types normalise to `f64`
//! after decode so the scaling pipeline and setpoint arithmetic operate on
//! a single representation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Register interpretation for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Single bit, either a coil or a bit position within a register
    #[serde(rename = "BOOL", alias = "bool", alias = "boolean")]
    Bool,
    /// Signed 16-bit integer (1 register)
    #[serde(rename = "INT16", alias = "int16", alias = "short")]
    Int16,
    /// Unsigned 16-bit integer (1 register)
    #[serde(rename = "UINT16", alias = "uint16", alias = "word")]
    Uint16,
    /// Signed 32-bit integer (2 registers)
    #[serde(rename = "INT32", alias = "int32", alias = "long")]
    Int32,
    /// Unsigned 32-bit integer (2 registers)
    #[serde(rename = "UINT32", alias = "uint32", alias = "dword")]
    Uint32,
    /// IEEE 754 single precision (2 registers)
    #[serde(rename = "FLOAT32", alias = "float32", alias = "float", alias = "real")]
    Float32,
    /// IEEE 754 double precision (4 registers)
    #[serde(rename = "FLOAT64", alias = "float64", alias = "double", alias = "lreal")]
    Float64,
    /// ASCII text packed two characters per register, NUL-terminated
    #[serde(rename = "STRING", alias = "string")]
    String,
    /// Raw register words, no interpretation
    #[serde(rename = "RAW", alias = "raw")]
    Raw,
}

impl DataType {
    /// Number of 16-bit registers the type occupies by default.
    ///
    /// STRING and RAW have no inherent width; parameters of those types are
    /// expected to carry an explicit `word_count`, and fall back to a single
    /// register when they do not.
    #[inline]
    pub fn default_word_count(&self) -> u16 {
        match self {
            Self::Bool | Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Float64 => 4,
            Self::String | Self::Raw => 1,
        }
    }

    /// True for types decoded to a number.
    #[inline]
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Bool | Self::String | Self::Raw)
    }

    /// Canonical uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::Int16 => "INT16",
            Self::Uint16 => "UINT16",
            Self::Int32 => "INT32",
            Self::Uint32 => "UINT32",
            Self::Float32 => "FLOAT32",
            Self::Float64 => "FLOAT64",
            Self::String => "STRING",
            Self::Raw => "RAW",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded parameter value.
///
/// Serialises untagged so a `Reading` renders naturally in JSON:
/// numbers as numbers, booleans as booleans, strings as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    /// Decoded boolean (coils, discrete inputs, register bits)
    Bool(bool),
    /// Any numeric type after normalisation to f64
    Number(f64),
    /// Decoded ASCII text
    Text(String),
    /// Raw register words for RAW parameters
    Raw(Vec<u16>),
}

impl PointValue {
    /// Numeric view of the value: booleans map to 0/1, text and raw to None.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Number(n) => Some(*n),
            Self::Text(_) | Self::Raw(_) => None,
        }
    }

    /// Boolean view: numbers are truthy when non-zero.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Number(n) => Some(*n != 0.0),
            Self::Text(_) | Self::Raw(_) => None,
        }
    }

    /// True for `Number` variants.
    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Raw(words) => {
                let hex: Vec<String> = words.iter().map(|w| format!("{w:04X}")).collect();
                write!(f, "[{}]", hex.join(" "))
            }
        }
    }
}

impl From<bool> for PointValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for PointValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<String> for PointValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}
