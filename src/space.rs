//! Enumerates the valid configuration set of a kernel.
use itertools::Itertools;
use log::debug;

use crate::device::Executor;
use crate::error::Error;
use crate::kernel::{Configuration, KernelSpec, Setting};

/// Materializes the Cartesian product of the parameter value lists in
/// declaration order and filters it in one pass: user constraints first, then
/// launch-shape admissibility, then local-memory admissibility. The surviving
/// set keeps the product order, which makes full search deterministic and
/// seeded searches reproducible.
pub fn enumerate(
    spec: &KernelSpec,
    executor: &dyn Executor,
) -> Result<Vec<Configuration>, Error> {
    let mut valid = Vec::new();
    let product = spec
        .parameters()
        .iter()
        .map(|parameter| parameter.values.clone().into_iter())
        .multi_cartesian_product();
    for values in product {
        let config: Configuration = spec
            .parameters()
            .iter()
            .zip(values)
            .map(|(parameter, value)| Setting::new(&parameter.name, value))
            .collect();
        if !spec.constraints_hold(&config) {
            continue;
        }
        let (_global, local) = spec.ranges_for(&config)?;
        if !executor.is_thread_config_valid(&local) {
            continue;
        }
        if let Some(bytes) = spec.local_memory_for(&config)? {
            if !executor.is_local_memory_valid(bytes) {
                continue;
            }
        }
        valid.push(config);
    }
    debug!(
        "kernel {}: {} valid configurations",
        spec.name(),
        valid.len()
    );
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeExecutor;
    use crate::kernel::ModifierKind;

    fn values(config: &Configuration) -> Vec<usize> {
        config.iter().map(|setting| setting.value).collect()
    }

    #[test]
    fn constraints_filter_the_product_in_order() {
        let executor = FakeExecutor::new();
        let mut spec = KernelSpec::new("k", "", vec![64], vec![1]);
        spec.add_parameter("A", &[1, 2, 4]).unwrap();
        spec.add_parameter("B", &[1, 2, 4]).unwrap();
        spec.add_constraint(Box::new(|v| v[0] * v[1] <= 4), &["A", "B"])
            .unwrap();
        let valid = enumerate(&spec, &executor).unwrap();
        let expected: Vec<Vec<usize>> = vec![
            vec![1, 1],
            vec![1, 2],
            vec![1, 4],
            vec![2, 1],
            vec![2, 2],
            vec![4, 1],
        ];
        assert_eq!(valid.iter().map(values).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn device_rejects_oversized_work_groups() {
        let mut executor = FakeExecutor::new();
        executor.max_local_threads = 128;
        let mut spec = KernelSpec::new("k", "", vec![1024], vec![1]);
        spec.add_parameter("WG", &[32, 64, 128, 256]).unwrap();
        spec.add_modifier(&["WG"], ModifierKind::LocalMul);
        let valid = enumerate(&spec, &executor).unwrap();
        assert_eq!(
            valid.iter().map(values).collect::<Vec<_>>(),
            vec![vec![32], vec![64], vec![128]]
        );
    }

    #[test]
    fn device_rejects_excessive_local_memory() {
        let mut executor = FakeExecutor::new();
        executor.local_mem_limit = 4096;
        let mut spec = KernelSpec::new("k", "", vec![1024], vec![32]);
        spec.add_parameter("TILE", &[16, 32, 64]).unwrap();
        spec.set_local_memory_usage(Box::new(|v| v[0] * v[0] * 4), &["TILE"])
            .unwrap();
        let valid = enumerate(&spec, &executor).unwrap();
        // 64 * 64 * 4 bytes is above the 4 KiB limit.
        assert_eq!(
            valid.iter().map(values).collect::<Vec<_>>(),
            vec![vec![16], vec![32]]
        );
    }

    #[test]
    fn no_parameters_means_no_candidates() {
        let executor = FakeExecutor::new();
        let spec = KernelSpec::new("k", "", vec![64], vec![8]);
        assert!(enumerate(&spec, &executor).unwrap().is_empty());
    }
}
