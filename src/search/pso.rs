//! Particle swarm optimization over the parameter-space lattice.
use std::io::{self, Write};

use fxhash::FxHashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::kernel::{Configuration, Parameter};

struct Particle {
    /// Per-parameter position in the parameter's value list.
    position: Vec<usize>,
    /// Per-parameter integer step applied on every update.
    velocity: Vec<i64>,
    /// Valid-set index the particle currently sits on.
    index: usize,
    /// Best runtime this particle observed, with its coordinates.
    best: Option<(f64, Vec<usize>)>,
}

struct Step {
    particle: usize,
    index: usize,
    time_ms: f64,
}

/// A swarm of particles; each update pulls a particle's velocity towards the
/// swarm-wide best and its own best, plus a random unit step, and clamps the
/// position to the parameter's value-list range. Positions falling outside
/// the valid set are redrawn uniformly.
pub struct Pso {
    configurations: Vec<Configuration>,
    values: Vec<Vec<usize>>,
    lattice: FxHashMap<Vec<usize>, usize>,
    parameters: Vec<Vec<usize>>,
    budget: usize,
    influence_global: f64,
    influence_local: f64,
    influence_random: f64,
    rng: StdRng,
    particles: Vec<Particle>,
    swarm_best: Option<(f64, Vec<usize>)>,
    active: usize,
    log: Vec<Step>,
}

impl Pso {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        configurations: Vec<Configuration>,
        parameters: &[Parameter],
        fraction: f64,
        swarm_size: usize,
        influence_global: f64,
        influence_local: f64,
        influence_random: f64,
        seed: u64,
    ) -> Pso {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<Vec<usize>> = configurations
            .iter()
            .map(|config| config.iter().map(|setting| setting.value).collect())
            .collect();
        let lattice: FxHashMap<Vec<usize>, usize> = values
            .iter()
            .enumerate()
            .map(|(index, v)| (v.clone(), index))
            .collect();
        let parameter_values: Vec<Vec<usize>> =
            parameters.iter().map(|p| p.values.clone()).collect();
        let particles = (0..swarm_size.max(1))
            .map(|_| {
                let index = if configurations.is_empty() {
                    0
                } else {
                    rng.gen_range(0, configurations.len())
                };
                Particle {
                    position: coordinates(&parameter_values, values.get(index)),
                    velocity: vec![0; parameter_values.len()],
                    index,
                    best: None,
                }
            })
            .collect();
        Pso {
            budget: super::budget(configurations.len(), fraction),
            configurations,
            values,
            lattice,
            parameters: parameter_values,
            influence_global,
            influence_local,
            influence_random,
            rng,
            particles,
            swarm_best: None,
            active: 0,
            log: Vec::new(),
        }
    }

    pub fn num_configurations(&self) -> usize {
        self.budget
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configurations[self.particles[self.active].index]
    }

    pub fn push_execution_time(&mut self, elapsed_ms: f64) {
        let particle = &mut self.particles[self.active];
        self.log.push(Step {
            particle: self.active,
            index: particle.index,
            time_ms: elapsed_ms,
        });
        if !elapsed_ms.is_finite() {
            return;
        }
        let position = particle.position.clone();
        match &particle.best {
            Some((best, _)) if *best <= elapsed_ms => {}
            _ => particle.best = Some((elapsed_ms, position.clone())),
        }
        match &self.swarm_best {
            Some((best, _)) if *best <= elapsed_ms => {}
            _ => self.swarm_best = Some((elapsed_ms, position)),
        }
    }

    pub fn calculate_next_index(&mut self) {
        if self.configurations.is_empty() {
            return;
        }
        let swarm_best = self.swarm_best.as_ref().map(|(_, p)| p.clone());
        let particle = &mut self.particles[self.active];
        for (i, list) in self.parameters.iter().enumerate() {
            let position = particle.position[i] as f64;
            let global = swarm_best
                .as_ref()
                .map(|p| p[i] as f64)
                .unwrap_or(position);
            let local = particle
                .best
                .as_ref()
                .map(|(_, p)| p[i] as f64)
                .unwrap_or(position);
            let unit: f64 = self.rng.gen_range(-1.0, 1.0);
            let pull = self.influence_global * (global - position)
                + self.influence_local * (local - position)
                + self.influence_random * unit;
            let velocity = (particle.velocity[i] as f64 + pull).round() as i64;
            particle.velocity[i] = velocity;
            let moved = (particle.position[i] as i64 + velocity)
                .max(0)
                .min(list.len() as i64 - 1);
            particle.position[i] = moved as usize;
        }
        let proposal: Vec<usize> = particle
            .position
            .iter()
            .zip(&self.parameters)
            .map(|(&position, list)| list[position])
            .collect();
        particle.index = match self.lattice.get(&proposal) {
            Some(&index) => index,
            None => {
                // The lattice point was filtered out by a constraint; redraw.
                let index = self.rng.gen_range(0, self.configurations.len());
                particle.position = coordinates(&self.parameters, self.values.get(index));
                index
            }
        };
        self.active = (self.active + 1) % self.particles.len();
    }

    pub fn print_log(&self, sink: &mut dyn Write) -> io::Result<()> {
        writeln!(sink, "step;particle;index;time_ms")?;
        for (step, entry) in self.log.iter().enumerate() {
            writeln!(
                sink,
                "{};{};{};{:.3}",
                step, entry.particle, entry.index, entry.time_ms
            )?;
        }
        Ok(())
    }
}

/// Maps a configuration's values to positions in the parameter value lists.
fn coordinates(parameters: &[Vec<usize>], values: Option<&Vec<usize>>) -> Vec<usize> {
    let values = match values {
        Some(values) => values,
        None => return vec![0; parameters.len()],
    };
    parameters
        .iter()
        .zip(values)
        .map(|(list, value)| list.iter().position(|v| v == value).unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Setting;

    fn parameters() -> Vec<Parameter> {
        vec![
            Parameter {
                name: "A".to_string(),
                values: vec![1, 2, 4, 8],
            },
            Parameter {
                name: "B".to_string(),
                values: vec![16, 32],
            },
        ]
    }

    fn grid(parameters: &[Parameter]) -> Vec<Configuration> {
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

    #[test]
    fn emits_budgeted_members_of_the_valid_set() {
        let parameters = parameters();
        let configurations = grid(&parameters);
        let mut search = Pso::new(configurations.clone(), &parameters, 0.5, 3, 0.4, 0.3, 0.7, 3);
        assert_eq!(search.num_configurations(), 4);
        for step in 0..search.num_configurations() {
            let pick = search.configuration().clone();
            assert!(configurations.contains(&pick));
            search.push_execution_time((step + 1) as f64);
            search.calculate_next_index();
        }
    }

    #[test]
    fn same_seed_same_trajectory() {
        let parameters = parameters();
        let configurations = grid(&parameters);
        let mut a = Pso::new(configurations.clone(), &parameters, 1.0, 2, 0.4, 0.3, 0.7, 17);
        let mut b = Pso::new(configurations, &parameters, 1.0, 2, 0.4, 0.3, 0.7, 17);
        for step in 0..a.num_configurations() {
            assert_eq!(a.configuration(), b.configuration());
            let time = ((step * 7) % 5) as f64 + 0.5;
            a.push_execution_time(time);
            b.push_execution_time(time);
            a.calculate_next_index();
            b.calculate_next_index();
        }
    }
}
