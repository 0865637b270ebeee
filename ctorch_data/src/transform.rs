use crate::error::{DataError, Result};

/// Per-channel `(x - mean) / std` applied to an example's pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalize {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Normalize {
    pub fn new(mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        if mean.is_empty() || mean.len() != std.len() {
            return Err(DataError::InvalidTransform(format!(
                "mean has {} entries, std has {}",
                mean.len(),
                std.len()
            )));
        }
        if let Some(bad) = std.iter().find(|s| !(s.is_finite() && **s != 0.0)) {
            return Err(DataError::InvalidTransform(format!(
                "std entries must be finite and non-zero, got {}",
                bad
            )));
        }
        Ok(Self { mean, std })
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// `pixels` is laid out channel-major, `plane` values per channel. A
    /// single mean/std pair broadcasts over every channel.
    pub fn apply(&self, pixels: &mut [f32], plane: usize) -> Result<()> {
        let channels = if plane == 0 { 0 } else { pixels.len() / plane };
        if self.channels() != 1 && self.channels() != channels {
            return Err(DataError::InvalidTransform(format!(
                "{} normalize channels for {} image channels",
                self.channels(),
                channels
            )));
        }
        for (c, chunk) in pixels.chunks_mut(plane.max(1)).enumerate() {
            let k = if self.channels() == 1 { 0 } else { c };
            let (mean, std) = (self.mean[k], self.std[k]);
            for px in chunk {
                *px = ((*px as f64 - mean) / std) as f32;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Normalize(Normalize),
}

impl Transform {
    pub fn apply(&self, pixels: &mut [f32], plane: usize) -> Result<()> {
        match self {
            Transform::Normalize(n) => n.apply(pixels, plane),
        }
    }
}
