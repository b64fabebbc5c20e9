//! Captured frames and the per-frame lighting observation.

use chrono::{DateTime, Utc};

/// Mean luma below which a frame is flagged as low light.
pub const DEFAULT_LOW_LIGHT_THRESHOLD: f32 = 80.0;

/// A frame handed to the descriptor oracle.
///
/// `data` is opaque to the core: an encoded image, raw luma, or a detector
/// payload, depending on the oracle. `luma` is optional 8-bit grayscale used
/// only for the lighting observation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub luma: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Average luma brightness (0.0–255.0), or `None` if no luma plane was captured.
    pub fn avg_brightness(&self) -> Option<f32> {
        let luma = self.luma.as_deref()?;
        if luma.is_empty() {
            return None;
        }
        Some(luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32)
    }

    /// Derived lighting hint for operators. Never affects matching.
    pub fn is_low_light(&self, threshold: f32) -> Option<bool> {
        self.avg_brightness().map(|b| b < threshold)
    }
}
