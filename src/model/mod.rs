//! Regression models predicting runtimes of untested configurations.
//!
//! Both models take the ordered parameter values of a configuration as
//! features and the measured runtime in milliseconds as the label. They are
//! trained on the earlier part of the result log and validated on the rest;
//! the engine then runs the best-predicted configurations for real.
mod linear;
mod network;

pub use self::linear::LinearRegression;
pub use self::network::NeuralNetwork;

use ndarray::{Array1, Array2, Axis};

/// Model selection for `Tuner::model_prediction`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Model {
    LinearRegression,
    NeuralNetwork,
}

/// A trained regression model mapping parameter values to a predicted
/// runtime.
pub trait MlModel {
    /// Fits the model; rows of `x` are observations.
    fn train(&mut self, x: &Array2<f32>, y: &Array1<f32>);

    /// Mean absolute prediction error on held-out samples.
    fn validate(&self, x: &Array2<f32>, y: &Array1<f32>) -> f32 {
        let samples = x.dim().0;
        if samples == 0 {
            return 0.0;
        }
        let total: f32 = x
            .genrows()
            .into_iter()
            .zip(y.iter())
            .map(|(row, &label)| (self.predict(&row.to_vec()) - label).abs())
            .sum();
        total / samples as f32
    }

    /// Predicts the runtime of a single configuration.
    fn predict(&self, features: &[f32]) -> f32;
}

/// Per-feature shift and scale bringing training data to zero mean and unit
/// range. Constant features keep a unit scale.
#[derive(Clone, Debug)]
pub(crate) struct Normalization {
    means: Array1<f32>,
    ranges: Array1<f32>,
}

impl Normalization {
    pub fn fit(x: &Array2<f32>) -> Normalization {
        let means = x.mean_axis(Axis(0));
        let ranges = x
            .axis_iter(Axis(1))
            .map(|column| {
                let min = column.fold(std::f32::INFINITY, |a, &b| a.min(b));
                let max = column.fold(std::f32::NEG_INFINITY, |a, &b| a.max(b));
                let range = max - min;
                if range > 0.0 {
                    range
                } else {
                    1.0
                }
            })
            .collect();
        Normalization { means, ranges }
    }

    pub fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        (x - &self.means) / &self.ranges
    }

    pub fn apply_row(&self, row: &[f32]) -> Array1<f32> {
        (&Array1::from(row.to_vec()) - &self.means) / &self.ranges
    }
}

/// Prepends a bias column of ones.
pub(crate) fn with_bias(x: &Array2<f32>) -> Array2<f32> {
    let (rows, columns) = x.dim();
    let mut out = Array2::ones((rows, columns + 1));
    out.slice_mut(ndarray::s![.., 1..]).assign(x);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn normalization_centers_and_scales() {
        let x = arr2(&[[0.0, 10.0], [4.0, 10.0]]);
        let norm = Normalization::fit(&x);
        let scaled = norm.apply(&x);
        assert_eq!(scaled[[0, 0]], -0.5);
        assert_eq!(scaled[[1, 0]], 0.5);
        // The constant column keeps a unit scale instead of dividing by zero.
        assert_eq!(scaled[[0, 1]], 0.0);
        assert_eq!(scaled[[1, 1]], 0.0);
    }

    #[test]
    fn bias_column_is_prepended() {
        let x = arr2(&[[2.0], [3.0]]);
        let biased = with_bias(&x);
        assert_eq!(biased.dim(), (2, 2));
        assert_eq!(biased[[0, 0]], 1.0);
        assert_eq!(biased[[1, 1]], 3.0);
    }
}
