//! Engineering-value scaling pipeline
//!
//! Raw register values pass through four ordered steps on their way to a
//! reading entry:
//!
//! 1. multiply by `scaling_factor`;
//! 2. evaluate `scaling_equation` with `x` bound to the current value;
//! 3. round to `decimal_point` digits;
//! 4. clamp to `[min_value, max_value]`.
//!
//! The pipeline is defensive about device-supplied garbage: a step that
//! produces a non-finite intermediate falls back to its input, equations
//! containing characters outside the arithmetic allowlist are skipped, and
//! a non-finite value after step 1 nulls the entry. Sub-normal noise below
//! 1e-30 is normalised to zero and final floats are rounded to 6 decimal
//! places so JSON serialisation stays stable.

use evalexpr::{eval_number_with_context, ContextWithMutableVariables, HashMapContext, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Magnitude below which a float is treated as zero.
const ZERO_EPSILON: f64 = 1e-30;

/// Scaling configuration attached to a parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    /// Multiplicative factor applied first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_factor: Option<f64>,
    /// Side-effect-free arithmetic expression in `x`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_equation: Option<String>,
    /// Number of decimal digits to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_point: Option<u32>,
    /// Lower clamp bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    /// Upper clamp bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

impl Scaling {
    /// True when every step is absent or an identity.
    pub fn is_identity(&self) -> bool {
        !factor_applies(self.scaling_factor)
            && self.scaling_equation.as_deref().map_or(true, str::is_empty)
            && self.decimal_point.is_none()
            && self.min_value.is_none()
            && self.max_value.is_none()
    }
}

/// A factor participates only when it is present, finite, non-zero and not 1.
#[inline]
fn factor_applies(factor: Option<f64>) -> bool {
    matches!(factor, Some(f) if f.is_finite() && f != 0.0 && f != 1.0)
}

/// Characters permitted in a scaling equation. Anything else makes the
/// equation step a no-op rather than an error.
fn equation_is_safe(equation: &str) -> bool {
    equation.chars().all(|c| {
        c.is_ascii_digit()
            || c == 'x'
            || c.is_whitespace()
            || matches!(c, '+' | '-' | '*' | '/' | '(' | ')' | '.' | ',' | '^' | '%' | '&' | '|')
    })
}

/// Evaluate a scaling equation with `x` bound to the current value.
fn eval_equation(equation: &str, x: f64) -> Option<f64> {
    let mut context = HashMapContext::new();
    context.set_value("x".into(), Value::Float(x)).ok()?;
    eval_number_with_context(equation, &context).ok()
}

/// Round to a fixed number of decimal digits.
#[inline]
fn round_to(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    (value * scale).round() / scale
}

/// Run the full scaling pipeline over a raw numeric value.
///
/// Returns `None` when the value degenerates to a non-finite number, which
/// the poller records as a null entry.
pub fn apply(raw: f64, scaling: &Scaling) -> Option<f64> {
    let mut value = raw;

    // Step 1: multiplicative factor. A non-finite product nulls the entry.
    if factor_applies(scaling.scaling_factor) {
        value *= scaling.scaling_factor.unwrap_or(1.0);
    }
    if !value.is_finite() {
        return None;
    }

    // Step 2: equation, skipped unless it passes the character allowlist.
    if let Some(equation) = scaling.scaling_equation.as_deref() {
        if !equation.is_empty() {
            if equation_is_safe(equation) {
                match eval_equation(equation, value) {
                    Some(result) if result.is_finite() => value = result,
                    _ => debug!("Scaling equation produced no finite result: {equation}"),
                }
            } else {
                debug!("Scaling equation rejected by character filter: {equation}");
            }
        }
    }

    // Step 3: decimal rounding, bypassed for magnitudes the precision
    // cannot represent.
    if let Some(digits) = scaling.decimal_point {
        if value.abs() >= 10f64.powi(-(digits as i32)) {
            let rounded = round_to(value, digits);
            if rounded.is_finite() {
                value = rounded;
            }
        }
    }

    // Step 4: clamp.
    if let Some(min) = scaling.min_value {
        value = value.max(min);
    }
    if let Some(max) = scaling.max_value {
        value = value.min(max);
    }

    if !value.is_finite() {
        return None;
    }
    if value.abs() < ZERO_EPSILON {
        value = 0.0;
    }

    // Keep JSON round-trips stable.
    Some(round_to(value, 6))
}

/// Invert the multiplicative step for the write path.
///
/// Equations are not inverted; a setpoint for a parameter with a scaling
/// factor of 0.1 must be multiplied by 10 before encoding.
pub fn unapply_factor(value: f64, scaling: &Scaling) -> f64 {
    if factor_applies(scaling.scaling_factor) {
        value / scaling.scaling_factor.unwrap_or(1.0)
    } else {
        value
    }
}
