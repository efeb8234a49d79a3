//! Linear regression trained with batch gradient descent.
use log::debug;
use ndarray::{Array1, Array2};

use super::{with_bias, MlModel, Normalization};

/// Ridge-regularized linear regression. Features are normalized before
/// fitting; the bias term is excluded from regularization.
pub struct LinearRegression {
    iterations: usize,
    learning_rate: f32,
    lambda: f32,
    theta: Array1<f32>,
    normalization: Option<Normalization>,
}

impl LinearRegression {
    pub fn new(iterations: usize, learning_rate: f32, lambda: f32) -> LinearRegression {
        LinearRegression {
            iterations,
            learning_rate,
            lambda,
            theta: Array1::zeros(0),
            normalization: None,
        }
    }
}

impl MlModel for LinearRegression {
    fn train(&mut self, x: &Array2<f32>, y: &Array1<f32>) {
        let normalization = Normalization::fit(x);
        let x = with_bias(&normalization.apply(x));
        self.normalization = Some(normalization);
        let (samples, features) = x.dim();
        self.theta = Array1::zeros(features);
        for iteration in 0..self.iterations {
            let residual = x.dot(&self.theta) - y;
            let mut gradient = x.t().dot(&residual) / samples as f32;
            for j in 1..features {
                gradient[j] += self.lambda * self.theta[j] / samples as f32;
            }
            self.theta = &self.theta - &(gradient * self.learning_rate);
            if iteration % 100 == 0 {
                let cost = residual.mapv(|r| r * r).sum() / (2.0 * samples as f32);
                debug!("linear regression iteration {}: cost {:.6}", iteration, cost);
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
        let mut prediction = self.theta[0];
        for (j, value) in row.iter().enumerate() {
            prediction += self.theta[j + 1] * value;
        }
        prediction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn recovers_a_linear_relationship() {
        // y = 2 * a + 3, no noise.
        let features: Vec<f32> = (0..16).map(|a| a as f32).collect();
        let x = Array2::from_shape_vec((16, 1), features.clone()).unwrap();
        let y = arr1(&features.iter().map(|a| 2.0 * a + 3.0).collect::<Vec<f32>>());
        let mut model = LinearRegression::new(800, 0.05, 0.0);
        model.train(&x, &y);
        for &a in &[0.0f32, 5.0, 15.0] {
            let predicted = model.predict(&[a]);
            assert!(
                (predicted - (2.0 * a + 3.0)).abs() < 0.5,
                "predicted {} for a = {}",
                predicted,
                a
            );
        }
    }

    #[test]
    fn validation_error_is_small_on_training_data() {
        let features: Vec<f32> = (0..8).map(|a| a as f32).collect();
        let x = Array2::from_shape_vec((8, 1), features.clone()).unwrap();
        let y = arr1(&features.iter().map(|a| a * 0.5).collect::<Vec<f32>>());
        let mut model = LinearRegression::new(800, 0.05, 0.0);
        model.train(&x, &y);
        assert!(model.validate(&x, &y) < 0.25);
    }
}
