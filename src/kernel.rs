//! Per-kernel tuning specification: source, parameters, launch-shape
//! modifiers, constraints and arguments.
use std::fmt;

use serde::Serialize;

use crate::arguments::ArgumentStore;
use crate::error::Error;
use crate::search::SearchMethod;

/// A launch shape: one extent per dimension, up to three dimensions.
pub type NdRange = Vec<usize>;

/// A tuning parameter: a name and the candidate values it ranges over.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub values: Vec<usize>,
}

/// One parameter bound to a concrete value. A full assignment, one setting
/// per parameter in declaration order, forms a `Configuration`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Setting {
    pub name: String,
    pub value: usize,
}

impl Setting {
    pub fn new(name: &str, value: usize) -> Setting {
        Setting {
            name: name.to_string(),
            value,
        }
    }

    /// Renders the setting as a preprocessor define.
    pub fn define(&self) -> String {
        format!("#define {} {}\n", self.name, self.value)
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.name, self.value)
    }
}

pub type Configuration = Vec<Setting>;

/// Looks up the value bound to `name` in a configuration.
pub fn lookup(config: &Configuration, name: &str) -> Option<usize> {
    config.iter().find(|s| s.name == name).map(|s| s.value)
}

/// Operations a modifier can apply to one dimension of the launch shape.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModifierKind {
    GlobalMul,
    GlobalDiv,
    GlobalAdd,
    LocalMul,
    LocalDiv,
}

/// A launch-shape modifier: per-dimension parameter names (an empty string
/// leaves the dimension untouched) plus the operation to apply.
#[derive(Clone, Debug)]
pub struct ShapeModifier {
    pub names: Vec<String>,
    pub kind: ModifierKind,
}

/// Splits a kernel run into several sub-launches over buffer slices; the
/// iteration count is taken from the named parameter.
#[derive(Clone, Debug, Default)]
pub struct IterationsModifier {
    pub parameter_name: String,
    pub valid_iterations: Vec<usize>,
}

pub type ConstraintFn = Box<dyn Fn(&[usize]) -> bool>;
pub type LocalMemoryFn = Box<dyn Fn(&[usize]) -> usize>;

/// A user constraint over a subset of the parameters.
pub struct Constraint {
    pub predicate: ConstraintFn,
    pub parameters: Vec<String>,
}

/// Local-memory demand of a configuration, in bytes.
pub struct LocalMemory {
    pub amount: LocalMemoryFn,
    pub parameters: Vec<String>,
}

/// Holds one kernel's source, parameters and launch settings.
pub struct KernelSpec {
    name: String,
    source: String,
    parameters: Vec<Parameter>,
    constraints: Vec<Constraint>,
    local_memory: Option<LocalMemory>,
    modifiers: Vec<ShapeModifier>,
    iterations: IterationsModifier,
    num_current_iterations: usize,
    global_base: NdRange,
    local_base: NdRange,
    global: NdRange,
    local: NdRange,
    args: ArgumentStore,
    search_method: SearchMethod,
}

impl KernelSpec {
    pub fn new(name: &str, source: &str, global: NdRange, local: NdRange) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            source: source.to_string(),
            parameters: Vec::new(),
            constraints: Vec::new(),
            local_memory: None,
            modifiers: Vec::new(),
            iterations: IterationsModifier::default(),
            num_current_iterations: 1,
            global_base: global.clone(),
            local_base: local.clone(),
            global,
            local,
            args: ArgumentStore::new(),
            search_method: SearchMethod::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn args(&self) -> &ArgumentStore {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut ArgumentStore {
        &mut self.args
    }

    pub fn global(&self) -> &NdRange {
        &self.global
    }

    pub fn local(&self) -> &NdRange {
        &self.local
    }

    pub fn global_base(&self) -> &NdRange {
        &self.global_base
    }

    pub fn local_base(&self) -> &NdRange {
        &self.local_base
    }

    pub fn num_current_iterations(&self) -> usize {
        self.num_current_iterations
    }

    pub fn search_method(&self) -> &SearchMethod {
        &self.search_method
    }

    pub fn set_search_method(&mut self, method: SearchMethod) {
        self.search_method = method;
    }

    /// Resets the base global shape; the effective shape is recomputed from it.
    pub fn set_global_base(&mut self, global: NdRange) {
        self.global = global.clone();
        self.global_base = global;
    }

    pub fn set_local_base(&mut self, local: NdRange) {
        self.local = local.clone();
        self.local_base = local;
    }

    /// Textually concatenates `extra` before the kernel source. Used to inject
    /// `#define` lines.
    pub fn prepend_source(&mut self, extra: &str) {
        self.source = format!("{}\n{}", extra, self.source);
    }

    /// Registers a tuning parameter with its candidate values.
    pub fn add_parameter(&mut self, name: &str, values: &[usize]) -> Result<(), Error> {
        if self.parameter_exists(name) {
            return Err(Error::DuplicateParameter(name.to_string()));
        }
        if values.is_empty() {
            return Err(Error::EmptyParameter(name.to_string()));
        }
        self.parameters.push(Parameter {
            name: name.to_string(),
            values: values.to_vec(),
        });
        Ok(())
    }

    pub fn parameter_exists(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p.name == name)
    }

    /// Appends a launch-shape modifier; names are resolved against the
    /// configuration when ranges are computed.
    pub fn add_modifier(&mut self, names: &[&str], kind: ModifierKind) {
        self.modifiers.push(ShapeModifier {
            names: names.iter().map(|n| n.to_string()).collect(),
            kind,
        });
    }

    /// Makes the named parameter drive the number of sub-launches per run.
    pub fn set_multirun_iterations(&mut self, parameter_name: &str) -> Result<(), Error> {
        let parameter = self
            .parameters
            .iter()
            .find(|p| p.name == parameter_name)
            .ok_or_else(|| Error::UnknownParameter(parameter_name.to_string()))?;
        for &value in &parameter.values {
            if value < 1 {
                return Err(Error::InvalidIterationCount(
                    parameter_name.to_string(),
                    value,
                ));
            }
        }
        self.iterations = IterationsModifier {
            parameter_name: parameter.name.clone(),
            valid_iterations: parameter.values.clone(),
        };
        Ok(())
    }

    pub fn add_constraint(
        &mut self,
        predicate: ConstraintFn,
        parameters: &[&str],
    ) -> Result<(), Error> {
        for name in parameters {
            if !self.parameter_exists(name) {
                return Err(Error::UnknownParameter(name.to_string()));
            }
        }
        self.constraints.push(Constraint {
            predicate,
            parameters: parameters.iter().map(|n| n.to_string()).collect(),
        });
        Ok(())
    }

    pub fn set_local_memory_usage(
        &mut self,
        amount: LocalMemoryFn,
        parameters: &[&str],
    ) -> Result<(), Error> {
        for name in parameters {
            if !self.parameter_exists(name) {
                return Err(Error::UnknownParameter(name.to_string()));
            }
        }
        self.local_memory = Some(LocalMemory {
            amount,
            parameters: parameters.iter().map(|n| n.to_string()).collect(),
        });
        Ok(())
    }

    /// Evaluates all user constraints on the projected parameter values. A
    /// configuration that does not bind every constrained parameter is
    /// rejected outright.
    pub fn constraints_hold(&self, config: &Configuration) -> bool {
        self.constraints.iter().all(|constraint| {
            let mut values = Vec::with_capacity(constraint.parameters.len());
            for name in &constraint.parameters {
                match lookup(config, name) {
                    Some(value) => values.push(value),
                    None => return false,
                }
            }
            (constraint.predicate)(&values)
        })
    }

    /// Binds the local-memory predicate's parameters and evaluates it.
    /// Returns `None` when no predicate was set.
    pub fn local_memory_for(&self, config: &Configuration) -> Result<Option<usize>, Error> {
        let local_memory = match &self.local_memory {
            Some(local_memory) => local_memory,
            None => return Ok(None),
        };
        let mut values = Vec::with_capacity(local_memory.parameters.len());
        for name in &local_memory.parameters {
            match lookup(config, name) {
                Some(value) => values.push(value),
                None => return Err(Error::InvalidLocalMemorySpec(name.clone())),
            }
        }
        Ok(Some((local_memory.amount)(&values)))
    }

    /// Applies every modifier in insertion order to the base shapes and
    /// returns the effective `(global, local)` pair for `config`.
    pub fn ranges_for(&self, config: &Configuration) -> Result<(NdRange, NdRange), Error> {
        let num_dimensions = self.global_base.len();
        if num_dimensions != self.local_base.len() {
            return Err(Error::DimensionMismatch(
                num_dimensions,
                self.local_base.len(),
            ));
        }
        let mut global = self.global_base.clone();
        let mut local = self.local_base.clone();
        for dim in 0..num_dimensions {
            for modifier in &self.modifiers {
                let name = match modifier.names.get(dim) {
                    Some(name) if !name.is_empty() => name,
                    _ => continue,
                };
                let value = lookup(config, name)
                    .ok_or_else(|| Error::UnknownParameter(name.clone()))?;
                match modifier.kind {
                    ModifierKind::GlobalMul => global[dim] *= value,
                    ModifierKind::GlobalAdd => global[dim] += value,
                    ModifierKind::GlobalDiv => {
                        if value == 0 {
                            return Err(Error::ZeroModifier(name.clone()));
                        }
                        global[dim] /= value;
                    }
                    ModifierKind::LocalMul => local[dim] *= value,
                    ModifierKind::LocalDiv => {
                        if value == 0 {
                            return Err(Error::ZeroModifier(name.clone()));
                        }
                        local[dim] /= value;
                    }
                }
            }
        }
        Ok((global, local))
    }

    /// Computes and stores the effective launch shape for `config`.
    pub fn compute_ranges(&mut self, config: &Configuration) -> Result<(), Error> {
        let (global, local) = self.ranges_for(config)?;
        self.global = global;
        self.local = local;
        Ok(())
    }

    /// Updates the sub-launch count from the configuration's value of the
    /// iterations parameter; stays at 1 when no modifier was set.
    pub fn set_num_current_iterations(&mut self, config: &Configuration) -> Result<(), Error> {
        if self.iterations.parameter_name.is_empty() {
            return Ok(());
        }
        match lookup(config, &self.iterations.parameter_name) {
            Some(value) => {
                self.num_current_iterations = value;
                Ok(())
            }
            None => Err(Error::UnknownParameter(
                self.iterations.parameter_name.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> KernelSpec {
        KernelSpec::new("test", "__kernel void test() {}", vec![1024, 8], vec![8, 8])
    }

    fn config(settings: &[(&str, usize)]) -> Configuration {
        settings
            .iter()
            .map(|&(name, value)| Setting::new(name, value))
            .collect()
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let mut spec = spec();
        spec.add_parameter("WG", &[32, 64]).unwrap();
        match spec.add_parameter("WG", &[16]) {
            Err(Error::DuplicateParameter(name)) => assert_eq!(name, "WG"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn modifiers_compose_in_insertion_order() {
        let mut spec = spec();
        spec.add_parameter("A", &[4]).unwrap();
        spec.add_parameter("B", &[2]).unwrap();
        spec.add_modifier(&["A", ""], ModifierKind::GlobalMul);
        spec.add_modifier(&["B", ""], ModifierKind::GlobalDiv);
        spec.add_modifier(&["", "B"], ModifierKind::GlobalAdd);
        spec.add_modifier(&["B", "B"], ModifierKind::LocalMul);
        let (global, local) = spec
            .ranges_for(&config(&[("A", 4), ("B", 2)]))
            .unwrap();
        assert_eq!(global, vec![1024 * 4 / 2, 8 + 2]);
        assert_eq!(local, vec![16, 16]);
    }

    #[test]
    fn unknown_modifier_parameter_fails() {
        let mut spec = spec();
        spec.add_parameter("A", &[4]).unwrap();
        spec.add_modifier(&["MISSING", ""], ModifierKind::GlobalMul);
        assert!(spec.ranges_for(&config(&[("A", 4)])).is_err());
    }

    #[test]
    fn zero_division_is_rejected() {
        let mut spec = spec();
        spec.add_parameter("A", &[0]).unwrap();
        spec.add_modifier(&["A", ""], ModifierKind::GlobalDiv);
        match spec.ranges_for(&config(&[("A", 0)])) {
            Err(Error::ZeroModifier(name)) => assert_eq!(name, "A"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn multirun_iterations_require_declared_positive_values() {
        let mut spec = spec();
        spec.add_parameter("ITERS", &[1, 2, 4]).unwrap();
        spec.add_parameter("BAD", &[0, 1]).unwrap();
        assert!(spec.set_multirun_iterations("ITERS").is_ok());
        assert!(spec.set_multirun_iterations("BAD").is_err());
        assert!(spec.set_multirun_iterations("MISSING").is_err());

        spec.set_num_current_iterations(&config(&[("ITERS", 4)]))
            .unwrap();
        assert_eq!(spec.num_current_iterations(), 4);
    }

    #[test]
    fn constraints_project_declared_parameters() {
        let mut spec = spec();
        spec.add_parameter("A", &[1, 2]).unwrap();
        spec.add_parameter("B", &[1, 2]).unwrap();
        assert!(spec
            .add_constraint(Box::new(|v| v[0] <= v[1]), &["A", "B"])
            .is_ok());
        assert!(spec
            .add_constraint(Box::new(|_| true), &["MISSING"])
            .is_err());
        assert!(spec.constraints_hold(&config(&[("A", 1), ("B", 2)])));
        assert!(!spec.constraints_hold(&config(&[("A", 2), ("B", 1)])));
    }

    #[test]
    fn local_memory_binding_reports_unbound_names() {
        let mut spec = spec();
        spec.add_parameter("TILE", &[8, 16]).unwrap();
        spec.set_local_memory_usage(Box::new(|v| v[0] * v[0] * 4), &["TILE"])
            .unwrap();
        let bytes = spec
            .local_memory_for(&config(&[("TILE", 16)]))
            .unwrap();
        assert_eq!(bytes, Some(16 * 16 * 4));
        // A configuration missing the bound parameter is a hard failure.
        assert!(spec.local_memory_for(&config(&[("A", 1)])).is_err());
    }
}
