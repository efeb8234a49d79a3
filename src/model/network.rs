//! A small feed-forward neural network trained with backpropagation.
use log::debug;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{with_bias, MlModel, Normalization};

const WEIGHT_INIT_RANGE: f32 = 0.12;
const WEIGHT_INIT_SEED: u64 = 42;

/// Fully connected network with sigmoid hidden layers and a linear output
/// unit. Labels are normalized alongside the features so the sigmoid layers
/// operate in their useful range.
pub struct NeuralNetwork {
    iterations: usize,
    learning_rate: f32,
    lambda: f32,
    layers: Vec<usize>,
    weights: Vec<Array2<f32>>,
    normalization: Option<Normalization>,
    label_mean: f32,
    label_range: f32,
}

impl NeuralNetwork {
    /// `layers` gives the width of every layer, input and output included;
    /// the output layer must have a single unit.
    pub fn new(
        iterations: usize,
        learning_rate: f32,
        lambda: f32,
        layers: Vec<usize>,
    ) -> NeuralNetwork {
        assert_eq!(
            layers.last().copied(),
            Some(1),
            "a single output unit is required"
        );
        NeuralNetwork {
            iterations,
            learning_rate,
            lambda,
            layers,
            weights: Vec::new(),
            normalization: None,
            label_mean: 0.0,
            label_range: 1.0,
        }
    }

    fn init_weights(&mut self) {
        let mut rng = StdRng::seed_from_u64(WEIGHT_INIT_SEED);
        self.weights = self
            .layers
            .windows(2)
            .map(|pair| {
                let (from, to) = (pair[0], pair[1]);
                Array2::from_shape_fn((from + 1, to), |_| {
                    rng.gen_range(-WEIGHT_INIT_RANGE, WEIGHT_INIT_RANGE)
                })
            })
            .collect();
    }

    /// Forward pass; returns the activations of every layer, the input
    /// included, so `activations[i]` feeds `weights[i]`.
    fn forward(&self, x: &Array2<f32>) -> Vec<Array2<f32>> {
        let mut activations = vec![x.clone()];
        for (layer, weights) in self.weights.iter().enumerate() {
            let z = with_bias(&activations[layer]).dot(weights);
            let a = if layer + 1 == self.weights.len() {
                z
            } else {
                z.mapv(sigmoid)
            };
            activations.push(a);
        }
        activations
    }
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

impl MlModel for NeuralNetwork {
    fn train(&mut self, x: &Array2<f32>, y: &Array1<f32>) {
        let normalization = Normalization::fit(x);
        let x = normalization.apply(x);
        self.normalization = Some(normalization);
        let samples = x.dim().0;

        self.label_mean = y.sum() / samples as f32;
        let label_min = y.fold(std::f32::INFINITY, |a, &b| a.min(b));
        let label_max = y.fold(std::f32::NEG_INFINITY, |a, &b| a.max(b));
        self.label_range = if label_max > label_min {
            label_max - label_min
        } else {
            1.0
        };
        let targets = Array2::from_shape_fn((samples, 1), |(i, _)| {
            (y[i] - self.label_mean) / self.label_range
        });

        self.init_weights();
        for iteration in 0..self.iterations {
            let activations = self.forward(&x);
            let output = activations[self.weights.len()].clone();
            // Output delta for the linear unit, then backpropagate through
            // the sigmoid layers.
            let mut deltas = vec![&output - &targets];
            for layer in (1..self.weights.len()).rev() {
                let weights = &self.weights[layer];
                let propagated = deltas[deltas.len() - 1]
                    .dot(&weights.slice(ndarray::s![1.., ..]).t().to_owned());
                let activation = &activations[layer];
                let delta = propagated * &activation.mapv(|a| a * (1.0 - a));
                deltas.push(delta);
            }
            deltas.reverse();
            for (layer, delta) in deltas.iter().enumerate() {
                let gradient = {
                    let mut gradient =
                        with_bias(&activations[layer]).t().dot(delta) / samples as f32;
                    let mut regularized = self.weights[layer].clone() * (self.lambda / samples as f32);
                    regularized
                        .slice_mut(ndarray::s![0..1, ..])
                        .fill(0.0);
                    gradient += &regularized;
                    gradient
                };
                self.weights[layer] = &self.weights[layer] - &(gradient * self.learning_rate);
            }
            if iteration % 100 == 0 {
                let activations = self.forward(&x);
                let residual = &activations[self.weights.len()] - &targets;
                let cost = residual.mapv(|r| r * r).sum() / (2.0 * samples as f32);
                debug!("neural network iteration {}: cost {:.6}", iteration, cost);
            }
        }
    }

    /// Returns zero until the model has been trained.
    fn predict(&self, features: &[f32]) -> f32 {
        let normalization = match &self.normalization {
            Some(normalization) => normalization,
            None => return 0.0,
        };
        let row = normalization.apply_row(features);
        let x = Array2::from_shape_fn((1, row.len()), |(_, j)| row[j]);
        let activations = self.forward(&x);
        let output = &activations[self.weights.len()];
        output[[0, 0]] * self.label_range + self.label_mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn learns_an_ordering_over_inputs() {
        // Runtime grows with the parameter value; the network only has to
        // get the ranking right for prediction-driven tuning to work.
        let features: Vec<f32> = (0..12).map(|a| a as f32).collect();
        let x = Array2::from_shape_vec((12, 1), features.clone()).unwrap();
        let y = arr1(
            &features
                .iter()
                .map(|a| 1.0 + 0.25 * a)
                .collect::<Vec<f32>>(),
        );
        let mut model = NeuralNetwork::new(800, 0.1, 0.005, vec![1, 20, 1]);
        model.train(&x, &y);
        let low = model.predict(&[1.0]);
        let high = model.predict(&[10.0]);
        assert!(low < high, "expected {} < {}", low, high);
    }

    #[test]
    fn validation_runs_on_held_out_rows() {
        let features: Vec<f32> = (0..10).map(|a| a as f32).collect();
        let x = Array2::from_shape_vec((10, 1), features.clone()).unwrap();
        let y = arr1(&features.iter().map(|a| a * 2.0).collect::<Vec<f32>>());
        let mut model = NeuralNetwork::new(400, 0.1, 0.005, vec![1, 8, 1]);
        model.train(&x, &y);
        let error = model.validate(&x, &y);
        assert!(error.is_finite());
    }
}
