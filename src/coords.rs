//! Mapping of the model's 0-1000 coordinate space onto viewport pixels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound of the normalized coordinate scale used by the model.
pub const NORMALIZED_MAX: f64 = 1000.0;

/// Pixel size of the browser viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1440,
            height: 900,
        }
    }
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn x(&self, value: f64) -> u32 {
        denormalize(value, self.width)
    }

    pub fn y(&self, value: f64) -> u32 {
        denormalize(value, self.height)
    }

    pub fn point(&self, x: f64, y: f64) -> (u32, u32) {
        (self.x(x), self.y(y))
    }
}

/// `clamp(0, extent - 1, floor(value / 1000 * extent))`.
///
/// Never fails: NaN maps to 0 and a zero extent yields 0.
pub fn denormalize(value: f64, extent: u32) -> u32 {
    if extent == 0 || !value.is_finite() {
        return 0;
    }
    let pixel = (value / NORMALIZED_MAX * f64::from(extent)).floor();
    pixel.clamp(0.0, f64::from(extent - 1)) as u32
}

/// Read a coordinate from an untyped argument value.
///
/// Numbers and numeric strings are accepted; anything else reads as 0 so a
/// single malformed coordinate cannot abort the action batch.
pub fn coordinate(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}
