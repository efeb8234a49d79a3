//! Uniform random sampling without replacement.
use std::io::{self, Write};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::kernel::Configuration;

/// Visits a random fraction of the valid set; indices are sampled without
/// replacement from a seeded generator so runs are reproducible.
pub struct RandomSearch {
    configurations: Vec<Configuration>,
    order: Vec<usize>,
    position: usize,
    times: Vec<f64>,
}

impl RandomSearch {
    pub fn new(configurations: Vec<Configuration>, fraction: f64, seed: u64) -> RandomSearch {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..configurations.len()).collect();
        order.shuffle(&mut rng);
        order.truncate(super::budget(configurations.len(), fraction));
        RandomSearch {
            configurations,
            order,
            position: 0,
            times: Vec::new(),
        }
    }

    pub fn num_configurations(&self) -> usize {
        self.order.len()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configurations[self.order[self.position]]
    }

    pub fn push_execution_time(&mut self, elapsed_ms: f64) {
        self.times.push(elapsed_ms);
    }

    pub fn calculate_next_index(&mut self) {
        if self.position + 1 < self.order.len() {
            self.position += 1;
        }
    }

    pub fn print_log(&self, sink: &mut dyn Write) -> io::Result<()> {
        writeln!(sink, "step;index;time_ms")?;
        for (step, (index, time)) in self.order.iter().zip(&self.times).enumerate() {
            writeln!(sink, "{};{};{:.3}", step, index, time)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Setting;

    fn configurations(n: usize) -> Vec<Configuration> {
        (0..n).map(|value| vec![Setting::new("X", value)]).collect()
    }

    #[test]
    fn samples_are_distinct_and_within_budget() {
        let search = RandomSearch::new(configurations(10), 0.5, 7);
        assert_eq!(search.num_configurations(), 5);
        let mut order = search.order.clone();
        order.sort();
        order.dedup();
        assert_eq!(order.len(), 5);
        assert!(order.iter().all(|&i| i < 10));
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = RandomSearch::new(configurations(32), 0.25, 99);
        let b = RandomSearch::new(configurations(32), 0.25, 99);
        assert_eq!(a.order, b.order);
    }
}
