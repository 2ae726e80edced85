//! Bias aberration patterns.
//!
//! A *bias polytope* is a base mode vector followed by copies of it with each
//! bias mode pushed up and then down by each step. The generator walks the
//! applied modes through a range of amplitudes and yields one polytope per
//! amplitude, for every imaging area.

/// `n` evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Base vector followed by `+step` and `-step` offsets along each axis.
///
/// Axes beyond the length of `base` are ignored.
pub fn make_bias_polytope(base: &[f64], offset_axes: &[usize], steps: &[f64]) -> Vec<Vec<f64>> {
    let mut betas = vec![base.to_vec()];
    for &axis in offset_axes.iter().filter(|&&a| a < base.len()) {
        for sign in [1.0, -1.0] {
            for step in steps {
                let mut offset = base.to_vec();
                offset[axis] += sign * step;
                betas.push(offset);
            }
        }
    }
    betas
}

/// One set of patterns to image.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasSet {
    /// Mode vectors, one image each
    pub biases: Vec<Vec<f64>>,
    /// File name fragment identifying the set
    pub prefix: String,
    /// First set of a new imaging area (not the first area)
    pub new_area: bool,
}

/// Parameters of the aberration sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameters {
    /// Modes biased in every polytope (0-indexed Noll)
    pub bias_modes: Vec<usize>,
    /// Modes swept through the applied amplitudes
    pub applied_modes: Vec<usize>,
    /// Largest applied amplitude
    pub magnitude: f64,
    /// Number of applied amplitudes
    pub steps: usize,
    /// Number of imaging areas
    pub areas: usize,
}

impl Default for SweepParameters {
    fn default() -> Self {
        Self {
            bias_modes: vec![4, 5, 6, 7, 10],
            applied_modes: vec![4, 5, 6, 7, 10],
            magnitude: 5.0,
            steps: 5,
            areas: 1,
        }
    }
}

impl SweepParameters {
    /// Number of bias sets the sweep produces
    pub fn set_count(&self) -> usize {
        self.steps * self.applied_modes.len() * self.areas
    }

    /// Length of every mode vector
    pub fn vector_len(&self) -> usize {
        self.bias_modes
            .iter()
            .chain(&self.applied_modes)
            .max()
            .map_or(0, |m| m + 1)
    }

    /// Images per bias set
    pub fn images_per_set(&self) -> usize {
        2 * self.bias_modes.len() + 1
    }
}

/// Iterator over the bias sets of a sweep.
///
/// Applied modes keep their last amplitude when the sweep moves on to the
/// next mode.
pub struct AberrationGenerator {
    params: SweepParameters,
    amplitudes: Vec<f64>,
    current: Vec<f64>,
    area: usize,
    mode: usize,
    step: usize,
}

impl AberrationGenerator {
    /// Start a sweep.
    pub fn new(params: SweepParameters) -> Self {
        let amplitudes = linspace(-params.magnitude, params.magnitude, params.steps);
        let current = vec![0.0; params.vector_len()];
        Self {
            params,
            amplitudes,
            current,
            area: 0,
            mode: 0,
            step: 0,
        }
    }
}

impl Iterator for AberrationGenerator {
    type Item = BiasSet;

    fn next(&mut self) -> Option<BiasSet> {
        if self.amplitudes.is_empty() || self.params.applied_modes.is_empty() {
            return None;
        }
        if self.step == self.amplitudes.len() {
            self.step = 0;
            self.mode += 1;
        }
        if self.mode == self.params.applied_modes.len() {
            self.mode = 0;
            self.area += 1;
        }
        if self.area >= self.params.areas {
            return None;
        }

        let applied = self.params.applied_modes[self.mode];
        let amplitude = self.amplitudes[self.step];
        self.current[applied] = amplitude;
        let set = BiasSet {
            biases: make_bias_polytope(&self.current, &self.params.bias_modes, &[1.0]),
            prefix: format!(
                "R{}A{}A{}S{:.1}_",
                self.params.areas, self.area, applied, amplitude
            ),
            new_area: self.area > 0 && self.mode == 0 && self.step == 0,
        };
        self.step += 1;
        Some(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_ends() {
        assert_eq!(linspace(-5.0, 5.0, 5), vec![-5.0, -2.5, 0.0, 2.5, 5.0]);
        assert_eq!(linspace(1.0, 2.0, 1), vec![1.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn polytope_orders_plus_before_minus() {
        let betas = make_bias_polytope(&[0.0, 0.0, 1.0], &[0, 2], &[1.0]);
        assert_eq!(
            betas,
            vec![
                vec![0.0, 0.0, 1.0],
                vec![1.0, 0.0, 1.0],
                vec![-1.0, 0.0, 1.0],
                vec![0.0, 0.0, 2.0],
                vec![0.0, 0.0, 0.0],
            ]
        );
    }

    #[test]
    fn generator_sweeps_modes_and_areas() {
        let params = SweepParameters {
            bias_modes: vec![1],
            applied_modes: vec![0, 2],
            magnitude: 1.0,
            steps: 3,
            areas: 2,
        };
        let sets: Vec<BiasSet> = AberrationGenerator::new(params.clone()).collect();
        assert_eq!(sets.len(), params.set_count());
        assert_eq!(sets[0].prefix, "R2A0A0S-1.0_");
        assert_eq!(sets[5].prefix, "R2A0A2S1.0_");
        assert_eq!(sets[6].prefix, "R2A1A0S-1.0_");

        let new_areas: Vec<usize> = sets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.new_area)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(new_areas, vec![6]);
        assert!(sets.iter().all(|s| s.biases.len() == params.images_per_set()));
    }

    #[test]
    fn earlier_modes_keep_last_amplitude() {
        let params = SweepParameters {
            bias_modes: vec![],
            applied_modes: vec![0, 1],
            magnitude: 2.0,
            steps: 2,
            areas: 1,
        };
        let sets: Vec<BiasSet> = AberrationGenerator::new(params).collect();
        // Mode 0 finished at +2 and stays there while mode 1 sweeps.
        assert_eq!(sets[2].biases[0], vec![2.0, -2.0]);
        assert_eq!(sets[3].biases[0], vec![2.0, 2.0]);
    }
}
