//! Shared motor state: the one record every peer sees.
//!
//! Peers send loosely typed commands (browsers send numbers, some firmware
//! sends strings), so [`StateStore::apply`] never rejects an update. Bad
//! input is normalized to a safe value and the normalized state is what
//! gets broadcast back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::CommandEvent;

/// Motor speed and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    pub speed: i64,
    pub forward: bool,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            speed: 0,
            forward: true,
        }
    }
}

/// Holder of the single [`SharedState`].
///
/// Not synchronized by itself: the [`Relay`](crate::relay::Relay) keeps it
/// behind the same lock as the presence registry.
#[derive(Debug, Default)]
pub struct StateStore {
    current: SharedState,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot copy of the current state.
    pub fn read(&self) -> SharedState {
        self.current
    }

    /// Replace the stored state with the coerced update and return it.
    pub fn apply(&mut self, update: &CommandEvent) -> SharedState {
        self.current = SharedState {
            speed: coerce_speed(update.speed.as_ref()),
            forward: coerce_forward(update.forward.as_ref()),
        };
        self.current
    }
}

/// Integer parse of a speed value; anything unparsable is `0`.
///
/// Floats truncate toward zero. Strings parse their leading integer
/// (`"42rpm"` → 42, `"3.9"` → 3). Out-of-range values saturate.
pub fn coerce_speed(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .unwrap_or_else(|| n.as_f64().map_or(0, truncate)),
        Some(Value::String(s)) => parse_leading_int(s),
        _ => 0,
    }
}

/// Direction flag; absent, `null` or non-boolean means forward.
pub fn coerce_forward(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(forward)) => *forward,
        _ => true,
    }
}

fn truncate(value: f64) -> i64 {
    if value.is_finite() {
        // `as` saturates at the i64 bounds.
        value.trunc() as i64
    } else {
        0
    }
}

fn parse_leading_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, digit| {
            let digit = i64::from(digit - b'0');
            if negative {
                acc.saturating_mul(10).saturating_sub(digit)
            } else {
                acc.saturating_mul(10).saturating_add(digit)
            }
        })
}
