//! Exhaustive sweep over the valid set in enumeration order.
use std::io::{self, Write};

use crate::kernel::Configuration;

/// Visits every valid configuration exactly once, in order. This is the
/// default strategy.
pub struct FullSearch {
    configurations: Vec<Configuration>,
    index: usize,
    times: Vec<f64>,
}

impl FullSearch {
    pub fn new(configurations: Vec<Configuration>) -> FullSearch {
        FullSearch {
            configurations,
            index: 0,
            times: Vec::new(),
        }
    }

    pub fn num_configurations(&self) -> usize {
        self.configurations.len()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configurations[self.index]
    }

    pub fn push_execution_time(&mut self, elapsed_ms: f64) {
        self.times.push(elapsed_ms);
    }

    pub fn calculate_next_index(&mut self) {
        if self.index + 1 < self.configurations.len() {
            self.index += 1;
        }
    }

    pub fn print_log(&self, sink: &mut dyn Write) -> io::Result<()> {
        writeln!(sink, "step;time_ms")?;
        for (step, time) in self.times.iter().enumerate() {
            writeln!(sink, "{};{:.3}", step, time)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Setting;

    #[test]
    fn visits_every_configuration_in_order() {
        let configurations: Vec<Configuration> = (0..4)
            .map(|value| vec![Setting::new("X", value)])
            .collect();
        let mut search = FullSearch::new(configurations.clone());
        assert_eq!(search.num_configurations(), 4);
        for expected in &configurations {
            assert_eq!(search.configuration(), expected);
            search.push_execution_time(1.0);
            search.calculate_next_index();
        }
    }
}
