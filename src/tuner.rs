//! The tuning session: kernel registration, the compile/execute/measure loop
//! and output verification.
//!
//! A session owns one device queue and drives it sequentially. Every launch
//! is followed by a queue finish before its timing event is read, so
//! measurements have exclusive occupancy of the device.
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::arguments::{bytes_of, ArgumentStore, BufferArg, HostScalar, HostVector, KernelArg};
use crate::device::{BoundArg, BufferHandle, DeviceInfo, Executor, KernelHandle};
use crate::error::Error;
use crate::kernel::{
    Configuration, ConstraintFn, KernelSpec, LocalMemoryFn, ModifierKind, NdRange,
};
use crate::model::{LinearRegression, MlModel, Model, NeuralNetwork};
use crate::report;
use crate::search::{SearchMethod, Searcher};
use crate::space;
use crate::verify::{self, VerificationMethod, DEFAULT_TOLERANCE};

/// Seed from which per-kernel searchers derive their generators. Fixed per
/// session so visit sequences are reproducible.
const DEFAULT_SEARCH_SEED: u64 = 1;

/// Gradient-descent iterations used by both prediction models.
const LEARNING_ITERATIONS: usize = 800;

/// The outcome of running one kernel configuration. A failed run keeps an
/// infinite runtime and `valid == false` in the log.
#[derive(Clone, Debug, Serialize)]
pub struct TunerResult {
    pub kernel_name: String,
    pub elapsed_ms: f64,
    pub local_threads: usize,
    pub valid: bool,
    pub configuration: Configuration,
}

/// A host callback orchestrating one or more launches per configuration,
/// for algorithms that need several passes (iterative reductions, shrinking
/// vectors and the like).
///
/// The engine walks the kernel's searcher and hands every configuration to
/// `customized_computation` together with the launch shape it computed.
/// Implementations usually call back into [`Tuner::run_single_kernel`],
/// possibly modifying scalar arguments or launch ranges between calls, and
/// combine the partial results into the one they return.
pub trait TunerConfigurator {
    fn customized_computation(
        &mut self,
        tuner: &mut Tuner,
        configuration: &Configuration,
        global: &NdRange,
        local: &NdRange,
    ) -> Result<TunerResult, Error>;
}

/// Which kernel a low-level operation targets.
#[derive(Copy, Clone)]
enum KernelSel {
    Tuned(usize),
    Reference,
}

/// A tuning session on one device.
pub struct Tuner {
    executor: Box<dyn Executor>,
    kernels: Vec<KernelSpec>,
    searchers: Vec<Option<Searcher>>,
    reference: Option<KernelSpec>,
    reference_outputs: Vec<HostVector>,
    output_scratch: Vec<BufferArg>,
    results: Vec<TunerResult>,
    verification_method: VerificationMethod,
    tolerance: f64,
    num_runs: usize,
    search_seed: u64,
    suppress_output: bool,
    search_log: Option<PathBuf>,
}

impl Tuner {
    /// Creates a session on an already-initialized device backend.
    pub fn from_executor(executor: Box<dyn Executor>) -> Tuner {
        let info = executor.info();
        info!(
            "initializing on device '{}' ({}, {} compute units)",
            info.name, info.vendor, info.compute_units
        );
        Tuner {
            executor,
            kernels: Vec::new(),
            searchers: Vec::new(),
            reference: None,
            reference_outputs: Vec::new(),
            output_scratch: Vec::new(),
            results: Vec::new(),
            verification_method: VerificationMethod::AbsoluteDifference,
            tolerance: DEFAULT_TOLERANCE,
            num_runs: 1,
            search_seed: DEFAULT_SEARCH_SEED,
            suppress_output: false,
            search_log: None,
        }
    }

    /// Opens platform `platform_id` / device `device_id` through OpenCL.
    #[cfg(feature = "opencl")]
    pub fn new(platform_id: usize, device_id: usize) -> Result<Tuner, Error> {
        let executor = crate::device::opencl::OpenClExecutor::new(platform_id, device_id)?;
        Ok(Tuner::from_executor(Box::new(executor)))
    }

    /// Returns the description of the session's device.
    pub fn device_info(&self) -> DeviceInfo {
        self.executor.info()
    }

    /// The append-only result log of this session.
    pub fn results(&self) -> &[TunerResult] {
        &self.results
    }

    // ---------------------------------------------------------------------
    // Kernel registration
    // ---------------------------------------------------------------------

    /// Registers a kernel from its source string and base launch shape;
    /// returns the kernel id used by every other operation.
    pub fn add_kernel_from_string(
        &mut self,
        source: &str,
        kernel_name: &str,
        global: &[usize],
        local: &[usize],
    ) -> usize {
        self.kernels.push(KernelSpec::new(
            kernel_name,
            source,
            global.to_vec(),
            local.to_vec(),
        ));
        self.searchers.push(None);
        self.kernels.len() - 1
    }

    /// Loads and concatenates the given source files, then registers the
    /// kernel.
    pub fn add_kernel<P: AsRef<Path>>(
        &mut self,
        filenames: &[P],
        kernel_name: &str,
        global: &[usize],
        local: &[usize],
    ) -> Result<usize, Error> {
        let source = load_files(filenames)?;
        Ok(self.add_kernel_from_string(&source, kernel_name, global, local))
    }

    /// Sets the reference kernel; a second call overwrites the first.
    pub fn set_reference_from_string(
        &mut self,
        source: &str,
        kernel_name: &str,
        global: &[usize],
        local: &[usize],
    ) {
        self.reference = Some(KernelSpec::new(
            kernel_name,
            source,
            global.to_vec(),
            local.to_vec(),
        ));
        self.reference_outputs.clear();
    }

    pub fn set_reference<P: AsRef<Path>>(
        &mut self,
        filenames: &[P],
        kernel_name: &str,
        global: &[usize],
        local: &[usize],
    ) -> Result<(), Error> {
        let source = load_files(filenames)?;
        self.set_reference_from_string(&source, kernel_name, global, local);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Parameters, modifiers and constraints
    // ---------------------------------------------------------------------

    fn kernel(&self, id: usize) -> Result<&KernelSpec, Error> {
        self.kernels.get(id).ok_or(Error::InvalidKernelId(id))
    }

    fn kernel_mut(&mut self, id: usize) -> Result<&mut KernelSpec, Error> {
        self.kernels.get_mut(id).ok_or(Error::InvalidKernelId(id))
    }

    pub fn add_parameter(&mut self, id: usize, name: &str, values: &[usize]) -> Result<(), Error> {
        self.kernel_mut(id)?.add_parameter(name, values)
    }

    /// Textually defines a single constant on the reference kernel's source.
    pub fn add_parameter_reference(&mut self, name: &str, value: usize) -> Result<(), Error> {
        let reference = self.reference.as_mut().ok_or(Error::MissingReference)?;
        reference.prepend_source(&format!("#define {} {}", name, value));
        Ok(())
    }

    pub fn mul_global_size(&mut self, id: usize, names: &[&str]) -> Result<(), Error> {
        self.kernel_mut(id)?.add_modifier(names, ModifierKind::GlobalMul);
        Ok(())
    }

    pub fn div_global_size(&mut self, id: usize, names: &[&str]) -> Result<(), Error> {
        self.kernel_mut(id)?.add_modifier(names, ModifierKind::GlobalDiv);
        Ok(())
    }

    pub fn add_global_size(&mut self, id: usize, names: &[&str]) -> Result<(), Error> {
        self.kernel_mut(id)?.add_modifier(names, ModifierKind::GlobalAdd);
        Ok(())
    }

    pub fn mul_local_size(&mut self, id: usize, names: &[&str]) -> Result<(), Error> {
        self.kernel_mut(id)?.add_modifier(names, ModifierKind::LocalMul);
        Ok(())
    }

    pub fn div_local_size(&mut self, id: usize, names: &[&str]) -> Result<(), Error> {
        self.kernel_mut(id)?.add_modifier(names, ModifierKind::LocalDiv);
        Ok(())
    }

    /// Makes the named parameter drive the number of sub-launches per run,
    /// each over its own slice of every buffer argument.
    pub fn set_multirun_kernel_iterations(
        &mut self,
        id: usize,
        parameter_name: &str,
    ) -> Result<(), Error> {
        self.kernel_mut(id)?.set_multirun_iterations(parameter_name)
    }

    pub fn add_constraint(
        &mut self,
        id: usize,
        predicate: ConstraintFn,
        parameters: &[&str],
    ) -> Result<(), Error> {
        self.kernel_mut(id)?.add_constraint(predicate, parameters)
    }

    pub fn set_local_memory_usage(
        &mut self,
        id: usize,
        amount: LocalMemoryFn,
        parameters: &[&str],
    ) -> Result<(), Error> {
        self.kernel_mut(id)?.set_local_memory_usage(amount, parameters)
    }

    /// Replaces the base global range; used by configurators to reshape the
    /// launch between runs.
    pub fn modify_global_range(&mut self, id: usize, range: &[usize]) -> Result<(), Error> {
        self.kernel_mut(id)?.set_global_base(range.to_vec());
        Ok(())
    }

    pub fn modify_local_range(&mut self, id: usize, range: &[usize]) -> Result<(), Error> {
        self.kernel_mut(id)?.set_local_base(range.to_vec());
        Ok(())
    }

    pub fn global_range(&self, id: usize) -> Result<NdRange, Error> {
        Ok(self.kernel(id)?.global_base().clone())
    }

    pub fn local_range(&self, id: usize) -> Result<NdRange, Error> {
        Ok(self.kernel(id)?.local_base().clone())
    }

    // ---------------------------------------------------------------------
    // Arguments
    // ---------------------------------------------------------------------

    /// Uploads `data` and registers it as the next input buffer argument.
    pub fn add_argument_input<T: HostScalar>(
        &mut self,
        id: usize,
        data: &[T],
    ) -> Result<(), Error> {
        if id >= self.kernels.len() {
            return Err(Error::InvalidKernelId(id));
        }
        let handle = upload(self.executor.as_mut(), data)?;
        self.kernels[id]
            .args_mut()
            .push_input(data.len(), T::mem_type(), handle);
        Ok(())
    }

    /// Uploads `data` and registers it as the next output buffer argument.
    /// The uploaded copy stays pristine: launches run against fresh scratch
    /// copies, and verification reads those.
    pub fn add_argument_output<T: HostScalar>(
        &mut self,
        id: usize,
        data: &[T],
    ) -> Result<(), Error> {
        if id >= self.kernels.len() {
            return Err(Error::InvalidKernelId(id));
        }
        let handle = upload(self.executor.as_mut(), data)?;
        self.kernels[id]
            .args_mut()
            .push_output(data.len(), T::mem_type(), handle);
        Ok(())
    }

    pub fn add_argument_scalar<T: HostScalar>(&mut self, id: usize, value: T) -> Result<(), Error> {
        self.kernel_mut(id)?.args_mut().push_scalar(value.into_arg());
        Ok(())
    }

    /// Replaces the scalar argument at `index` with a new value of the same
    /// type.
    pub fn modify_argument_scalar<T: HostScalar>(
        &mut self,
        id: usize,
        value: T,
        index: usize,
    ) -> Result<(), Error> {
        self.kernel_mut(id)?
            .args_mut()
            .modify_scalar(index, value.into_arg())
    }

    pub fn add_argument_input_reference<T: HostScalar>(&mut self, data: &[T]) -> Result<(), Error> {
        if self.reference.is_none() {
            return Err(Error::MissingReference);
        }
        let handle = upload(self.executor.as_mut(), data)?;
        let reference = self.reference.as_mut().ok_or(Error::MissingReference)?;
        reference.args_mut().push_input(data.len(), T::mem_type(), handle);
        Ok(())
    }

    pub fn add_argument_output_reference<T: HostScalar>(
        &mut self,
        data: &[T],
    ) -> Result<(), Error> {
        if self.reference.is_none() {
            return Err(Error::MissingReference);
        }
        let handle = upload(self.executor.as_mut(), data)?;
        let reference = self.reference.as_mut().ok_or(Error::MissingReference)?;
        reference.args_mut().push_output(data.len(), T::mem_type(), handle);
        Ok(())
    }

    pub fn add_argument_scalar_reference<T: HostScalar>(&mut self, value: T) -> Result<(), Error> {
        let reference = self.reference.as_mut().ok_or(Error::MissingReference)?;
        reference.args_mut().push_scalar(value.into_arg());
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Search strategy and verification selection
    // ---------------------------------------------------------------------

    fn set_search_method(&mut self, id: usize, method: SearchMethod) -> Result<(), Error> {
        self.kernel_mut(id)?.set_search_method(method);
        self.searchers[id] = None;
        Ok(())
    }

    /// Visits every valid configuration. This is the default.
    pub fn use_full_search(&mut self, id: usize) -> Result<(), Error> {
        self.set_search_method(id, SearchMethod::FullSearch)
    }

    pub fn use_random_search(&mut self, id: usize, fraction: f64) -> Result<(), Error> {
        self.set_search_method(id, SearchMethod::RandomSearch { fraction })
    }

    pub fn use_annealing(
        &mut self,
        id: usize,
        fraction: f64,
        max_temperature: f64,
    ) -> Result<(), Error> {
        self.set_search_method(
            id,
            SearchMethod::Annealing {
                fraction,
                max_temperature,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn use_pso(
        &mut self,
        id: usize,
        fraction: f64,
        swarm_size: usize,
        influence_global: f64,
        influence_local: f64,
        influence_random: f64,
    ) -> Result<(), Error> {
        self.set_search_method(
            id,
            SearchMethod::Pso {
                fraction,
                swarm_size,
                influence_global,
                influence_local,
                influence_random,
            },
        )
    }

    /// Overrides the seed stochastic searchers derive their generators from.
    pub fn set_search_seed(&mut self, seed: u64) {
        self.search_seed = seed;
    }

    pub fn choose_verification_method(
        &mut self,
        method: VerificationMethod,
        tolerance: f64,
    ) -> Result<(), Error> {
        if tolerance < 0.0 {
            return Err(Error::InvalidTolerance(tolerance));
        }
        self.verification_method = method;
        self.tolerance = tolerance;
        Ok(())
    }

    /// Uses the minimum over `n` launches for every timing measurement.
    pub fn set_num_runs(&mut self, n: usize) {
        self.num_runs = n.max(1);
    }

    /// Disables screen reporting. Logging through the `log` facade is not
    /// affected.
    pub fn suppress_output(&mut self) {
        self.suppress_output = true;
    }

    /// Dumps the searcher's trace to `filename` after each tuning run.
    pub fn output_search_log<P: Into<PathBuf>>(&mut self, filename: P) {
        self.search_log = Some(filename.into());
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Tunes one kernel: runs the reference first (when set), then walks the
    /// kernel's search strategy over its valid configuration set. Clears the
    /// result log and returns a copy of it.
    pub fn tune_single_kernel(&mut self, id: usize) -> Result<Vec<TunerResult>, Error> {
        if id >= self.kernels.len() {
            return Err(Error::InvalidKernelId(id));
        }
        self.tune_kernel(id, true, true)?;
        Ok(self.results.clone())
    }

    /// Tunes every registered kernel against one reference run.
    pub fn tune_all_kernels(&mut self) -> Result<Vec<TunerResult>, Error> {
        self.results.clear();
        self.run_reference_kernel()?;
        for id in 0..self.kernels.len() {
            self.tune_kernel(id, false, false)?;
        }
        Ok(self.results.clone())
    }

    fn tune_kernel(
        &mut self,
        id: usize,
        test_reference: bool,
        clear_results: bool,
    ) -> Result<(), Error> {
        if clear_results {
            self.results.clear();
        }
        if test_reference {
            self.run_reference_kernel()?;
        }
        info!("testing kernel {}", self.kernels[id].name());

        // Without tuning parameters there is exactly one variant to run.
        if self.kernels[id].parameters().is_empty() {
            let result = self.run_one(KernelSel::Tuned(id), &Vec::new(), 0, 1);
            self.report_entry(&result);
            self.results.push(result);
            return Ok(());
        }

        let mut searcher = self.build_searcher(id)?;
        let num_configurations = searcher.num_configurations();
        for step in 0..num_configurations {
            let configuration = searcher.configuration().clone();
            debug!(
                "exploring configuration {} out of {}",
                step + 1,
                num_configurations
            );
            let result = self.run_one(KernelSel::Tuned(id), &configuration, step, num_configurations);
            searcher.push_execution_time(result.elapsed_ms);
            searcher.calculate_next_index();
            self.report_entry(&result);
            self.results.push(result);
        }
        if let Some(path) = self.search_log.clone() {
            let mut file = File::create(path)?;
            searcher.print_log(&mut file)?;
        }
        Ok(())
    }

    /// Runs one kernel with an explicit configuration and returns the
    /// verified result without touching the log. An empty configuration runs
    /// the source as-is.
    pub fn run_single_kernel(
        &mut self,
        id: usize,
        configuration: &Configuration,
    ) -> Result<TunerResult, Error> {
        if id >= self.kernels.len() {
            return Err(Error::InvalidKernelId(id));
        }
        info!("running kernel {}", self.kernels[id].name());
        if !configuration.is_empty() {
            let kernel = &mut self.kernels[id];
            kernel.compute_ranges(configuration)?;
            kernel.set_num_current_iterations(configuration)?;
        }
        let result = self.run_one(KernelSel::Tuned(id), configuration, 0, 1);
        self.report_entry(&result);
        Ok(result)
    }

    /// Runs the reference kernel (when set) and snapshots its outputs into
    /// host memory as the verification baseline.
    pub fn run_reference_kernel(&mut self) -> Result<(), Error> {
        match &self.reference {
            Some(reference) => info!("testing reference {}", reference.name()),
            None => return Ok(()),
        }
        let result = self.run_one(KernelSel::Reference, &Vec::new(), 0, 1);
        if !result.elapsed_ms.is_finite() {
            return Err(Error::DeviceError(format!(
                "reference kernel {} failed",
                result.kernel_name
            )));
        }
        self.reference_outputs.clear();
        for buffer in &self.output_scratch {
            self.reference_outputs
                .push(download(self.executor.as_ref(), buffer)?);
        }
        Ok(())
    }

    /// Compiles, runs and verifies one configuration of the selected kernel.
    /// Device and compile failures are converted into a failed entry.
    fn run_one(
        &mut self,
        sel: KernelSel,
        configuration: &Configuration,
        configuration_id: usize,
        num_configurations: usize,
    ) -> TunerResult {
        let spec = match sel {
            KernelSel::Tuned(id) => &mut self.kernels[id],
            KernelSel::Reference => match self.reference.as_mut() {
                Some(reference) => reference,
                None => {
                    warn!("no reference kernel to run");
                    return failed_result("<reference>", configuration.clone());
                }
            },
        };
        if !configuration.is_empty() {
            // Ranges were validated when the configuration was enumerated;
            // a failure here is a bug in the caller.
            if let Err(err) = spec
                .compute_ranges(configuration)
                .and_then(|()| spec.set_num_current_iterations(configuration))
            {
                warn!("kernel {} failed: {}", spec.name(), err);
                return failed_result(spec.name(), configuration.clone());
            }
        }
        let plan = LaunchPlan::of(spec);
        let source = configured_source(spec, configuration);
        let mut result = run_plan(
            self.executor.as_mut(),
            &mut self.output_scratch,
            self.num_runs,
            &source,
            &plan,
            configuration_id,
            num_configurations,
        );
        result.configuration = configuration.clone();
        result.valid = result.elapsed_ms.is_finite()
            && verify_outputs(
                self.executor.as_ref(),
                &self.output_scratch,
                &self.reference_outputs,
                self.verification_method,
                self.tolerance,
            );
        result
    }

    fn build_searcher(&self, id: usize) -> Result<Searcher, Error> {
        let configurations = space::enumerate(&self.kernels[id], self.executor.as_ref())?;
        Ok(Searcher::build(
            self.kernels[id].search_method(),
            configurations,
            self.kernels[id].parameters(),
            self.search_seed,
        ))
    }

    fn report_entry(&self, result: &TunerResult) {
        if self.suppress_output {
            return;
        }
        let stdout = io::stdout();
        let tag = if !result.elapsed_ms.is_finite() {
            report::TAG_FAILED
        } else if !result.valid {
            report::TAG_WARNING
        } else {
            return;
        };
        let _ = report::print_result(&mut stdout.lock(), result, tag);
    }

    // ---------------------------------------------------------------------
    // Configurator primitives
    // ---------------------------------------------------------------------

    /// Number of configurations the kernel's searcher will visit; lazily
    /// builds the persistent searcher.
    pub fn num_configurations(&mut self, id: usize) -> Result<usize, Error> {
        if id >= self.kernels.len() {
            return Err(Error::InvalidKernelId(id));
        }
        if self.searchers[id].is_none() {
            self.searchers[id] = Some(self.build_searcher(id)?);
        }
        match &self.searchers[id] {
            Some(searcher) => Ok(searcher.num_configurations()),
            None => Err(Error::SearcherNotInitialized),
        }
    }

    /// The configuration the kernel's searcher currently proposes.
    pub fn next_configuration(&self, id: usize) -> Result<Configuration, Error> {
        let searcher = self
            .searchers
            .get(id)
            .ok_or(Error::InvalidKernelId(id))?
            .as_ref()
            .ok_or(Error::SearcherNotInitialized)?;
        Ok(searcher.configuration().clone())
    }

    /// Feeds the previous runtime back to the searcher and advances it. Must
    /// be called once after every `next_configuration`.
    pub fn update_configuration(&mut self, id: usize, elapsed_ms: f64) -> Result<(), Error> {
        let searcher = self
            .searchers
            .get_mut(id)
            .ok_or(Error::InvalidKernelId(id))?
            .as_mut()
            .ok_or(Error::SearcherNotInitialized)?;
        searcher.push_execution_time(elapsed_ms);
        searcher.calculate_next_index();
        Ok(())
    }

    /// Walks the kernel's searcher, delegating every configuration to the
    /// configurator. Results are collected in the session log.
    pub fn tune_kernel_with(
        &mut self,
        id: usize,
        configurator: &mut dyn TunerConfigurator,
    ) -> Result<Vec<TunerResult>, Error> {
        if id >= self.kernels.len() {
            return Err(Error::InvalidKernelId(id));
        }
        self.searchers[id] = None;
        self.results.clear();
        self.run_reference_kernel()?;
        let total = self.num_configurations(id)?;
        for _ in 0..total {
            let configuration = self.next_configuration(id)?;
            {
                let kernel = &mut self.kernels[id];
                kernel.compute_ranges(&configuration)?;
                kernel.set_num_current_iterations(&configuration)?;
            }
            let global = self.kernels[id].global().clone();
            let local = self.kernels[id].local().clone();
            let result =
                configurator.customized_computation(self, &configuration, &global, &local)?;
            self.update_configuration(id, result.elapsed_ms)?;
            self.report_entry(&result);
            self.results.push(result);
        }
        Ok(self.results.clone())
    }

    // ---------------------------------------------------------------------
    // Prediction
    // ---------------------------------------------------------------------

    /// Trains a model on the measured part of the result log, ranks every
    /// valid configuration by predicted runtime, and actually runs the top
    /// `test_top_x` predictions, appending their true results to the log.
    pub fn model_prediction(
        &mut self,
        model: Model,
        validation_fraction: f32,
        test_top_x: usize,
    ) -> Result<(), Error> {
        for id in 0..self.kernels.len() {
            let (x, y) = {
                let samples: Vec<&TunerResult> = self
                    .results
                    .iter()
                    .filter(|r| r.elapsed_ms.is_finite() && !r.configuration.is_empty())
                    .collect();
                if samples.is_empty() {
                    warn!("no measured results to train on");
                    return Ok(());
                }
                let features = samples[0].configuration.len();
                let mut x = Vec::with_capacity(samples.len() * features);
                let mut y = Vec::with_capacity(samples.len());
                for sample in &samples {
                    y.push(sample.elapsed_ms as f32);
                    for setting in &sample.configuration {
                        x.push(setting.value as f32);
                    }
                }
                let x = match ndarray::Array2::from_shape_vec((samples.len(), features), x) {
                    Ok(x) => x,
                    Err(..) => {
                        warn!("result log mixes kernels with different parameter counts");
                        return Ok(());
                    }
                };
                (x, ndarray::Array1::from(y))
            };
            let samples = x.dim().0;
            let features = x.dim().1;
            let validation_samples = (samples as f32 * validation_fraction) as usize;
            let training_samples = samples - validation_samples;
            let x_train = x.slice(ndarray::s![..training_samples, ..]).to_owned();
            let y_train = y.slice(ndarray::s![..training_samples]).to_owned();

            let mut trained: Box<dyn MlModel> = match model {
                Model::LinearRegression => {
                    info!("training a linear regression model");
                    Box::new(LinearRegression::new(LEARNING_ITERATIONS, 0.05, 0.2))
                }
                Model::NeuralNetwork => {
                    info!("training a neural network model");
                    Box::new(NeuralNetwork::new(
                        LEARNING_ITERATIONS,
                        0.1,
                        0.005,
                        vec![features, 20, 1],
                    ))
                }
            };
            trained.train(&x_train, &y_train);
            if validation_samples > 0 {
                let x_validation = x.slice(ndarray::s![training_samples.., ..]).to_owned();
                let y_validation = y.slice(ndarray::s![training_samples..]).to_owned();
                let error = trained.validate(&x_validation, &y_validation);
                info!("validation mean absolute error: {:.3} ms", error);
            }

            info!("predicting the remaining configurations using the model");
            let configurations = space::enumerate(&self.kernels[id], self.executor.as_ref())?;
            let mut ranked: Vec<(usize, f32)> = configurations
                .iter()
                .enumerate()
                .map(|(index, configuration)| {
                    let row: Vec<f32> =
                        configuration.iter().map(|s| s.value as f32).collect();
                    (index, trained.predict(&row))
                })
                .collect();
            ranked.sort_by(|a, b| {
                a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
            });

            info!("testing the best-found configurations");
            for &(index, predicted) in ranked.iter().take(test_top_x) {
                info!("the model predicted: {:.3} ms", predicted);
                let configuration = configurations[index].clone();
                let result =
                    self.run_one(KernelSel::Tuned(id), &configuration, index, test_top_x);
                self.report_entry(&result);
                self.results.push(result);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reporting
    // ---------------------------------------------------------------------

    /// Prints every valid result and the best one to stdout; returns the
    /// best runtime in milliseconds.
    pub fn print_to_screen(&self) -> f64 {
        let best = report::best(&self.results).map(|r| r.elapsed_ms).unwrap_or(0.0);
        if self.suppress_output {
            return best;
        }
        let stdout = io::stdout();
        report::print_to_screen(&mut stdout.lock(), &self.results).unwrap_or(best)
    }

    /// Prints the best configuration in a database format keyed by device.
    pub fn print_formatted(&self) {
        if self.suppress_output {
            return;
        }
        let stdout = io::stdout();
        let _ = report::print_formatted(
            &mut stdout.lock(),
            &self.executor.info().name,
            &self.results,
        );
    }

    pub fn print_json<P: AsRef<Path>>(
        &self,
        path: P,
        descriptions: &[(String, String)],
    ) -> Result<(), Error> {
        report::write_json(path, descriptions, &self.executor.info(), &self.results)
    }

    pub fn print_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        report::write_csv(path, &self.results)
    }
}

impl Drop for Tuner {
    fn drop(&mut self) {
        let executor = self.executor.as_mut();
        for buffer in self.output_scratch.drain(..) {
            executor.free(buffer.handle);
        }
        for kernel in self.kernels.iter().chain(self.reference.iter()) {
            for buffer in kernel.args().buffers() {
                executor.free(buffer.handle);
            }
        }
        info!("end of the tuning process");
    }
}

// -------------------------------------------------------------------------
// Launch machinery
// -------------------------------------------------------------------------

/// Everything needed to compile and launch one configuration, detached from
/// the session so the executor can be borrowed mutably alongside it.
struct LaunchPlan {
    name: String,
    global: NdRange,
    local: NdRange,
    num_iterations: usize,
    args: ArgumentStore,
}

impl LaunchPlan {
    fn of(spec: &KernelSpec) -> LaunchPlan {
        LaunchPlan {
            name: spec.name().to_string(),
            global: spec.global().clone(),
            local: spec.local().clone(),
            num_iterations: spec.num_current_iterations(),
            args: spec.args().clone(),
        }
    }
}

/// Per-configuration source: the `#define` block in declaration order,
/// followed by the kernel source.
fn configured_source(spec: &KernelSpec, configuration: &Configuration) -> String {
    let mut source = String::new();
    for setting in configuration {
        source.push_str(&setting.define());
    }
    source.push_str(spec.source());
    source
}

fn failed_result(name: &str, configuration: Configuration) -> TunerResult {
    TunerResult {
        kernel_name: name.to_string(),
        elapsed_ms: std::f64::INFINITY,
        local_threads: 0,
        valid: false,
        configuration,
    }
}

fn load_files<P: AsRef<Path>>(filenames: &[P]) -> Result<String, Error> {
    let mut source = String::new();
    for filename in filenames {
        source.push_str(&std::fs::read_to_string(filename)?);
    }
    Ok(source)
}

fn upload<T: HostScalar>(
    executor: &mut dyn Executor,
    data: &[T],
) -> Result<BufferHandle, Error> {
    let bytes = bytes_of(data);
    let handle = executor.allocate(bytes.len())?;
    executor.write_buffer(handle, bytes)?;
    Ok(handle)
}

fn download(executor: &dyn Executor, buffer: &BufferArg) -> Result<HostVector, Error> {
    let mut host = HostVector::zeroed(buffer.mem_type, buffer.elements);
    executor.read_buffer(buffer.handle, 0, host.as_bytes_mut())?;
    Ok(host)
}

/// Compiles and launches one plan; converts any failure into an entry with an
/// infinite runtime.
fn run_plan(
    executor: &mut dyn Executor,
    scratch: &mut Vec<BufferArg>,
    num_runs: usize,
    source: &str,
    plan: &LaunchPlan,
    configuration_id: usize,
    num_configurations: usize,
) -> TunerResult {
    match try_run_plan(
        executor,
        scratch,
        num_runs,
        source,
        plan,
        configuration_id,
        num_configurations,
    ) {
        Ok(result) => result,
        Err(err) => {
            warn!("kernel {} failed: {}", plan.name, err);
            failed_result(&plan.name, Vec::new())
        }
    }
}

fn try_run_plan(
    executor: &mut dyn Executor,
    scratch: &mut Vec<BufferArg>,
    num_runs: usize,
    source: &str,
    plan: &LaunchPlan,
    configuration_id: usize,
    num_configurations: usize,
) -> Result<TunerResult, Error> {
    debug!("compiling {}", plan.name);
    let kernel = executor.compile(source, &plan.name)?;
    let result = run_compiled(
        executor,
        scratch,
        num_runs,
        kernel,
        plan,
        configuration_id,
        num_configurations,
    );
    executor.release_kernel(kernel);
    result
}

fn run_compiled(
    executor: &mut dyn Executor,
    scratch: &mut Vec<BufferArg>,
    num_runs: usize,
    kernel: KernelHandle,
    plan: &LaunchPlan,
    configuration_id: usize,
    num_configurations: usize,
) -> Result<TunerResult, Error> {
    // Drop the previous run's scratch copies and snapshot the output buffers
    // anew, so every run starts from the originally uploaded contents.
    for buffer in scratch.drain(..) {
        executor.free(buffer.handle);
    }
    for output in plan.args.outputs() {
        let copy = executor.copy_buffer(output.handle, output.size_bytes())?;
        scratch.push(BufferArg {
            handle: copy,
            ..*output
        });
    }

    let local_mem = executor.local_mem_usage(kernel);
    if !executor.is_local_memory_valid(local_mem) {
        return Err(Error::LocalMemoryExceeded(local_mem));
    }

    let mut total_elapsed = 0.0;
    for iteration in 0..plan.num_iterations {
        let bound = bind_arguments(plan, scratch, iteration);
        executor.finish();
        if plan.num_iterations == 1 {
            info!("running {}", plan.name);
        } else {
            info!(
                "running {} (iteration {} / {})",
                plan.name,
                iteration + 1,
                plan.num_iterations
            );
        }
        let mut elapsed = std::f64::INFINITY;
        for _ in 0..num_runs {
            let event = executor.launch(kernel, &plan.global, &plan.local, &bound)?;
            executor.finish();
            elapsed = elapsed.min(executor.elapsed_ms(event)?);
        }
        total_elapsed += elapsed;
    }
    info!(
        "completed {} ({:.1} ms) - {} out of {}",
        plan.name,
        total_elapsed,
        configuration_id + 1,
        num_configurations
    );
    Ok(TunerResult {
        kernel_name: plan.name.clone(),
        elapsed_ms: total_elapsed,
        local_threads: plan.local.iter().product(),
        valid: false,
        configuration: Vec::new(),
    })
}

/// Binds arguments in positional order. With several iterations, every
/// buffer is split into equal byte regions and iteration `i` binds the
/// `i`-th region; outputs bind their scratch copies.
fn bind_arguments(plan: &LaunchPlan, scratch: &[BufferArg], iteration: usize) -> Vec<BoundArg> {
    let mut bound = Vec::with_capacity(plan.args.len());
    let mut output_position = 0;
    for arg in plan.args.iter() {
        match arg {
            KernelArg::Scalar(scalar) => bound.push(BoundArg::Scalar {
                mem_type: scalar.mem_type(),
                bytes: scalar.to_bytes(),
            }),
            KernelArg::Input(buffer) => {
                bound.push(region_of(buffer, plan.num_iterations, iteration))
            }
            KernelArg::Output(..) => {
                let buffer = &scratch[output_position];
                output_position += 1;
                bound.push(region_of(buffer, plan.num_iterations, iteration));
            }
        }
    }
    bound
}

fn region_of(buffer: &BufferArg, num_iterations: usize, iteration: usize) -> BoundArg {
    let len = buffer.size_bytes() / num_iterations;
    BoundArg::Region {
        handle: buffer.handle,
        offset: len * iteration,
        len,
    }
}

fn verify_outputs(
    executor: &dyn Executor,
    scratch: &[BufferArg],
    references: &[HostVector],
    method: VerificationMethod,
    tolerance: f64,
) -> bool {
    if references.is_empty() {
        return true;
    }
    let mut status = true;
    for (i, buffer) in scratch.iter().enumerate() {
        let reference = match references.get(i) {
            Some(reference) => reference,
            None => {
                warn!("no reference stored for output {}", i);
                status = false;
                continue;
            }
        };
        match download(executor, buffer) {
            Ok(downloaded) => {
                status &= verify::verify(method, tolerance, reference, &downloaded);
            }
            Err(err) => {
                warn!("could not download output {}: {}", i, err);
                status = false;
            }
        }
    }
    status
}
