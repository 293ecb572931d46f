//! Detection results from the camera-side detector.

use crate::error::{Result, VisionError};
use serde_json::Value;

/// One labeled bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub score: Option<f64>,
}

impl Detection {
    /// Horizontal box center, for payloads where `(x, y)` is the corner.
    #[must_use]
    pub fn center_x(&self) -> f64 {
        self.x + self.width / 2.0
    }

    /// Vertical box center.
    #[must_use]
    pub fn center_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    /// Box area, used as the tie breaker when scores are equal.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Parse a box from the firmware payload.
    ///
    /// The board emits either an object `{x, y, w, h, score}` or a bare
    /// array `[x, y, w, h, score?]`.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload {
            Value::Object(map) => {
                let field = |keys: &[&str]| -> f64 {
                    keys.iter()
                        .find_map(|key| map.get(*key).and_then(Value::as_f64))
                        .unwrap_or(0.0)
                };
                let score = ["score", "confidence"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_f64));
                Ok(Self {
                    x: field(&["x"]),
                    y: field(&["y"]),
                    width: field(&["w", "width"]),
                    height: field(&["h", "height"]),
                    score,
                })
            }
            Value::Array(items) => {
                if items.len() < 4 {
                    return Err(VisionError::Protocol(format!(
                        "box payload needs at least 4 entries, got {}",
                        items.len()
                    )));
                }
                let number = |index: usize| items[index].as_f64().unwrap_or(0.0);
                Ok(Self {
                    x: number(0),
                    y: number(1),
                    width: number(2),
                    height: number(3),
                    score: items.get(4).and_then(Value::as_f64),
                })
            }
            other => Err(VisionError::Protocol(format!(
                "unexpected box payload: {other}"
            ))),
        }
    }
}
