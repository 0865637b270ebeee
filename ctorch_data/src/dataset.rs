use std::sync::Arc;

use crate::error::Result;
use crate::mnist::Mnist;
use crate::transform::{Normalize, Transform};

/// One transformed sample: channel-major `f32` pixels and an `i64` target.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub data: Vec<f32>,
    pub shape: [usize; 3],
    pub target: i64,
}

/// Source records plus a transform pipeline. Cloning is cheap and the
/// clone's pipeline is independent of the original's.
#[derive(Debug, Clone)]
pub struct Dataset {
    source: Arc<Mnist>,
    transforms: Vec<Transform>,
}

impl Dataset {
    pub fn new(source: Mnist) -> Self {
        Self {
            source: Arc::new(source),
            transforms: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn example_shape(&self) -> [usize; 3] {
        [1, self.source.rows(), self.source.cols()]
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn normalize(&mut self, mean: Vec<f64>, std: Vec<f64>) -> Result<()> {
        let normalize = Normalize::new(mean, std)?;
        tracing::debug!(channels = normalize.channels(), "dataset normalize appended");
        self.transforms.push(Transform::Normalize(normalize));
        Ok(())
    }

    /// Pixels scaled from `0..=255` to `[0, 1]`, then run through the pipeline.
    pub fn example(&self, index: usize) -> Result<Example> {
        let shape = self.example_shape();
        let plane = shape[1] * shape[2];
        let mut data: Vec<f32> = self
            .source
            .image(index)
            .iter()
            .map(|&px| px as f32 / 255.0)
            .collect();
        for transform in &self.transforms {
            transform.apply(&mut data, plane)?;
        }
        Ok(Example {
            data,
            shape,
            target: self.source.label(index) as i64,
        })
    }
}
