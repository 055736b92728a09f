use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::pipeline::PipelineInput;

/// A fixed pool of random pipeline inputs, cycled forever.
///
/// Generating inputs up front keeps random number generation off the issuing
/// path; the load generator bounds the run with its own stop conditions or
/// with `Iterator::take`.
#[derive(Debug, Clone)]
pub struct InputPool {
    inputs: Vec<PipelineInput>,
    cursor: usize,
}

impl InputPool {
    /// `sizes` maps each entry stage to the length of its input vector.
    pub fn random(sizes: &BTreeMap<String, usize>, pool_size: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let inputs = (0..pool_size.max(1))
            .map(|_| {
                sizes
                    .iter()
                    .map(|(stage, len)| {
                        let payload = (0..*len).map(|_| rng.random::<f32>()).collect();
                        (stage.clone(), payload)
                    })
                    .collect()
            })
            .collect();
        InputPool { inputs, cursor: 0 }
    }

    pub fn from_inputs(inputs: Vec<PipelineInput>) -> Self {
        InputPool { inputs, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl Iterator for InputPool {
    type Item = PipelineInput;

    fn next(&mut self) -> Option<PipelineInput> {
        if self.inputs.is_empty() {
            return None;
        }
        let input = self.inputs[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.inputs.len();
        Some(input)
    }
}
