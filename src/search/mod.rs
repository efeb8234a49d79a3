//! Search strategies deciding which valid configuration to measure next.
//!
//! A `Searcher` operates on indices into the enumerated valid set. The engine
//! drives it in lock-step: `configuration` returns the current pick,
//! `push_execution_time` feeds back the measured runtime and
//! `calculate_next_index` steps to the next pick. For a fixed seed the
//! resulting visit sequence is deterministic.
mod annealing;
mod full;
mod pso;
mod random;

pub use self::annealing::Annealing;
pub use self::full::FullSearch;
pub use self::pso::Pso;
pub use self::random::RandomSearch;

use std::io::{self, Write};

use crate::kernel::{Configuration, Parameter};

/// Selects the search strategy and its hyper-parameters for one kernel.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchMethod {
    FullSearch,
    RandomSearch {
        fraction: f64,
    },
    Annealing {
        fraction: f64,
        max_temperature: f64,
    },
    Pso {
        fraction: f64,
        swarm_size: usize,
        influence_global: f64,
        influence_local: f64,
        influence_random: f64,
    },
}

impl Default for SearchMethod {
    fn default() -> SearchMethod {
        SearchMethod::FullSearch
    }
}

/// A search strategy with its state. Modeled as a tagged variant rather than
/// a trait object so each strategy owns its state directly.
pub enum Searcher {
    Full(FullSearch),
    Random(RandomSearch),
    Annealing(Annealing),
    Pso(Pso),
}

impl Searcher {
    /// Builds the searcher selected by `method` over the valid set.
    pub fn build(
        method: &SearchMethod,
        configurations: Vec<Configuration>,
        parameters: &[Parameter],
        seed: u64,
    ) -> Searcher {
        match *method {
            SearchMethod::FullSearch => Searcher::Full(FullSearch::new(configurations)),
            SearchMethod::RandomSearch { fraction } => {
                Searcher::Random(RandomSearch::new(configurations, fraction, seed))
            }
            SearchMethod::Annealing {
                fraction,
                max_temperature,
            } => Searcher::Annealing(Annealing::new(
                configurations,
                parameters,
                fraction,
                max_temperature,
                seed,
            )),
            SearchMethod::Pso {
                fraction,
                swarm_size,
                influence_global,
                influence_local,
                influence_random,
            } => Searcher::Pso(Pso::new(
                configurations,
                parameters,
                fraction,
                swarm_size,
                influence_global,
                influence_local,
                influence_random,
                seed,
            )),
        }
    }

    /// Number of configurations the strategy will visit.
    pub fn num_configurations(&self) -> usize {
        match self {
            Searcher::Full(s) => s.num_configurations(),
            Searcher::Random(s) => s.num_configurations(),
            Searcher::Annealing(s) => s.num_configurations(),
            Searcher::Pso(s) => s.num_configurations(),
        }
    }

    /// The currently chosen configuration.
    pub fn configuration(&self) -> &Configuration {
        match self {
            Searcher::Full(s) => s.configuration(),
            Searcher::Random(s) => s.configuration(),
            Searcher::Annealing(s) => s.configuration(),
            Searcher::Pso(s) => s.configuration(),
        }
    }

    /// Feedback from the just-completed launch, in milliseconds.
    pub fn push_execution_time(&mut self, elapsed_ms: f64) {
        match self {
            Searcher::Full(s) => s.push_execution_time(elapsed_ms),
            Searcher::Random(s) => s.push_execution_time(elapsed_ms),
            Searcher::Annealing(s) => s.push_execution_time(elapsed_ms),
            Searcher::Pso(s) => s.push_execution_time(elapsed_ms),
        }
    }

    /// Steps to the next pick.
    pub fn calculate_next_index(&mut self) {
        match self {
            Searcher::Full(s) => s.calculate_next_index(),
            Searcher::Random(s) => s.calculate_next_index(),
            Searcher::Annealing(s) => s.calculate_next_index(),
            Searcher::Pso(s) => s.calculate_next_index(),
        }
    }

    /// Dumps a strategy-specific trace of the search.
    pub fn print_log(&self, sink: &mut dyn Write) -> io::Result<()> {
        match self {
            Searcher::Full(s) => s.print_log(sink),
            Searcher::Random(s) => s.print_log(sink),
            Searcher::Annealing(s) => s.print_log(sink),
            Searcher::Pso(s) => s.print_log(sink),
        }
    }
}

/// Number of configurations a fractional strategy visits: `ceil(fraction * n)`
/// clamped to the size of the valid set.
pub(crate) fn budget(total: usize, fraction: f64) -> usize {
    if total == 0 {
        return 0;
    }
    let raw = (total as f64 * fraction).ceil() as usize;
    raw.max(1).min(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractional_budget() {
        assert_eq!(budget(0, 0.5), 0);
        assert_eq!(budget(10, 0.5), 5);
        assert_eq!(budget(10, 0.51), 6);
        assert_eq!(budget(10, 1.0), 10);
        assert_eq!(budget(10, 0.001), 1);
        assert_eq!(budget(3, 1.0), 3);
    }
}
