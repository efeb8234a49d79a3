//! Simulated annealing over the valid-configuration lattice.
use std::io::{self, Write};

use fxhash::{FxHashMap, FxHashSet};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::kernel::{Configuration, Parameter};

struct Step {
    index: usize,
    time_ms: f64,
    temperature: f64,
    accepted: bool,
}

/// Starts at a random member of the valid set and walks to neighbours, i.e.
/// configurations differing in exactly one parameter by one position in that
/// parameter's value list. A slower proposal is accepted with probability
/// `exp(-dt / temperature)`; the temperature decays linearly to zero over the
/// visit budget. Visited indices are never revisited.
pub struct Annealing {
    configurations: Vec<Configuration>,
    values: Vec<Vec<usize>>,
    lattice: FxHashMap<Vec<usize>, usize>,
    parameters: Vec<Vec<usize>>,
    budget: usize,
    max_temperature: f64,
    rng: StdRng,
    current: usize,
    candidate: usize,
    candidate_time: f64,
    best_time: f64,
    visited: FxHashSet<usize>,
    step: usize,
    log: Vec<Step>,
}

impl Annealing {
    pub fn new(
        configurations: Vec<Configuration>,
        parameters: &[Parameter],
        fraction: f64,
        max_temperature: f64,
        seed: u64,
    ) -> Annealing {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<Vec<usize>> = configurations
            .iter()
            .map(|config| config.iter().map(|setting| setting.value).collect())
            .collect();
        let lattice = values
            .iter()
            .enumerate()
            .map(|(index, v)| (v.clone(), index))
            .collect();
        let start = if configurations.is_empty() {
            0
        } else {
            rng.gen_range(0, configurations.len())
        };
        Annealing {
            budget: super::budget(configurations.len(), fraction),
            parameters: parameters.iter().map(|p| p.values.clone()).collect(),
            configurations,
            values,
            lattice,
            max_temperature,
            rng,
            current: start,
            candidate: start,
            candidate_time: std::f64::INFINITY,
            best_time: std::f64::INFINITY,
            visited: FxHashSet::default(),
            step: 0,
            log: Vec::new(),
        }
    }

    pub fn num_configurations(&self) -> usize {
        self.budget
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configurations[self.candidate]
    }

    pub fn push_execution_time(&mut self, elapsed_ms: f64) {
        self.candidate_time = elapsed_ms;
        if elapsed_ms < self.best_time {
            self.best_time = elapsed_ms;
        }
    }

    pub fn calculate_next_index(&mut self) {
        self.visited.insert(self.candidate);
        self.step += 1;
        let progress = self.step as f64 / self.budget as f64;
        let temperature = self.max_temperature * (1.0 - progress).max(0.0);
        let delta = self.candidate_time - self.best_time;
        let accepted = if !self.candidate_time.is_finite() {
            false
        } else if delta <= 0.0 {
            true
        } else if temperature <= 0.0 {
            false
        } else {
            self.rng.gen::<f64>() < (-delta / temperature).exp()
        };
        if accepted {
            self.current = self.candidate;
        }
        self.log.push(Step {
            index: self.candidate,
            time_ms: self.candidate_time,
            temperature,
            accepted,
        });
        // Draw among the unvisited neighbours of the accepted state; when the
        // neighbourhood is exhausted, fall back to a uniform unvisited pick.
        let mut pool = self.neighbours(self.current);
        pool.retain(|index| !self.visited.contains(index));
        if pool.is_empty() {
            pool = (0..self.configurations.len())
                .filter(|index| !self.visited.contains(index))
                .collect();
        }
        if let Some(&next) = pool.choose(&mut self.rng) {
            self.candidate = next;
        }
    }

    /// Valid-set indices reachable from `index` by moving one parameter one
    /// position along its value list.
    fn neighbours(&self, index: usize) -> Vec<usize> {
        let values = &self.values[index];
        let mut result = Vec::new();
        for (i, list) in self.parameters.iter().enumerate() {
            let position = match list.iter().position(|&v| v == values[i]) {
                Some(position) => position,
                None => continue,
            };
            for &next in [position.wrapping_sub(1), position + 1].iter() {
                if next >= list.len() {
                    continue;
                }
                let mut proposal = values.clone();
                proposal[i] = list[next];
                if let Some(&neighbour) = self.lattice.get(&proposal) {
                    result.push(neighbour);
                }
            }
        }
        result
    }

    pub fn print_log(&self, sink: &mut dyn Write) -> io::Result<()> {
        writeln!(sink, "step;index;time_ms;temperature;accepted")?;
        for (step, entry) in self.log.iter().enumerate() {
            writeln!(
                sink,
                "{};{};{:.3};{:.3};{}",
                step, entry.index, entry.time_ms, entry.temperature, entry.accepted
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Setting;

    fn grid(parameters: &[Parameter]) -> Vec<Configuration> {
        // Two parameters only, enough for the neighbourhood tests.
        let mut configurations = Vec::new();
        for &a in &parameters[0].values {
            for &b in &parameters[1].values {
                configurations.push(vec![
                    Setting::new(&parameters[0].name, a),
                    Setting::new(&parameters[1].name, b),
                ]);
            }
        }
        configurations
    }

    fn parameters() -> Vec<Parameter> {
        vec![
            Parameter {
                name: "A".to_string(),
                values: vec![1, 2, 4],
            },
            Parameter {
                name: "B".to_string(),
                values: vec![8, 16],
            },
        ]
    }

    #[test]
    fn neighbours_differ_in_one_coordinate_by_one_position() {
        let parameters = parameters();
        let configurations = grid(&parameters);
        let search = Annealing::new(configurations.clone(), &parameters, 1.0, 3.0, 1);
        // (A=2, B=8) is at index 2.
        assert_eq!(search.values[2], vec![2, 8]);
        let mut neighbours = search.neighbours(2);
        neighbours.sort();
        // (1,8), (4,8) and (2,16).
        assert_eq!(neighbours, vec![0, 3, 4]);
    }

    #[test]
    fn visits_are_unique_and_within_budget() {
        let parameters = parameters();
        let configurations = grid(&parameters);
        let mut search = Annealing::new(configurations, &parameters, 1.0, 3.0, 11);
        let mut seen = Vec::new();
        for step in 0..search.num_configurations() {
            seen.push(search.configuration().clone());
            search.push_execution_time(10.0 - step as f64);
            search.calculate_next_index();
        }
        assert_eq!(seen.len(), 6);
        for i in 0..seen.len() {
            for j in i + 1..seen.len() {
                assert_ne!(seen[i], seen[j]);
            }
        }
    }

    #[test]
    fn same_seed_same_walk() {
        let parameters = parameters();
        let configurations = grid(&parameters);
        let mut a = Annealing::new(configurations.clone(), &parameters, 1.0, 3.0, 5);
        let mut b = Annealing::new(configurations, &parameters, 1.0, 3.0, 5);
        for step in 0..a.num_configurations() {
            assert_eq!(a.configuration(), b.configuration());
            let time = (step % 3) as f64 + 1.0;
            a.push_execution_time(time);
            b.push_execution_time(time);
            a.calculate_next_index();
            b.calculate_next_index();
        }
    }
}
