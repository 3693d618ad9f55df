/// Exponentially-weighted moving average.
///
/// Each new sample is given a weight of `decay`, the previous average keeping the rest. The
/// first sample initializes the average.
#[derive(Clone, Debug, PartialEq)]
pub struct Ewma {
    decay: f64,
    estimate: Option<f64>,
}

impl Ewma {
    /// Creates a new `Ewma`. `decay` should be between `0.` and `1.`, `1.` meaning that only
    /// the last sample counts.
    pub fn new(decay: f64) -> Self {
        Self {
            decay: decay.clamp(0., 1.),
            estimate: None,
        }
    }

    /// Adds a new sample and returns the updated estimate.
    pub fn add_sample(&mut self, val: f64) -> f64 {
        let previous = self.estimate.unwrap_or(val);
        let new_estimate = self.decay * val + (1. - self.decay) * previous;
        self.estimate = Some(new_estimate);
        new_estimate
    }

    /// Get the current estimate produced by the `Ewma`, `None` before the first sample.
    pub fn get_estimate(&self) -> Option<f64> {
        self.estimate
    }

    pub fn reset(&mut self) {
        self.estimate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn first_sample_initializes() {
        let mut ewma = Ewma::new(0.25);
        assert_eq!(ewma.get_estimate(), None);
        assert_eq!(ewma.add_sample(1000.), 1000.);
        assert_eq!(ewma.add_sample(2000.), 1250.);
        ewma.reset();
        assert_eq!(ewma.get_estimate(), None);
    }

    #[rstest]
    #[case(1., 3000.)]
    #[case(0., 1000.)]
    #[case(0.5, 2000.)]
    fn decay_weights_last_sample(#[case] decay: f64, #[case] expected: f64) {
        let mut ewma = Ewma::new(decay);
        ewma.add_sample(1000.);
        assert_eq!(ewma.add_sample(3000.), expected);
    }
}
