//! Conformance driver.
//!
//! For every device × case × element type the driver builds fresh tensors, computes
//! the reference answer, binds a descriptor, invalidates the exported tensor views,
//! executes, synchronizes and compares. Devices run on scoped threads; trials on one
//! device run in enumeration order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use blake3::Hash;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::abi::OperatorBackend;
use crate::cases::{InplaceMode, TestCase, Trial};
use crate::compare::{compare, Comparison};
use crate::device::{enumerate_devices, Device, DeviceKind};
use crate::dtype::ElementType;
use crate::error::{FailureKind, OpError, Result};
use crate::ops::Operator;
use crate::oracle;
use crate::profile::{ProfileReport, Profiler, DEFAULT_ITERATIONS, DEFAULT_WARMUP};
use crate::protocol::OpClient;
use crate::telemetry::{TelemetryEvent, TelemetryRecorder, TelemetrySink};
use crate::tensor::{Fill, TestTensor};
use crate::workspace::WorkspaceManager;

/// Offending elements printed per failed trial in debug mode.
const DEBUG_DUMP_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Run every trial and report all failures.
    #[default]
    CollectAll,
    /// Stop scheduling trials after the first failure.
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub debug: bool,
    pub profile: bool,
    pub warmup: usize,
    pub iterations: usize,
    pub policy: FailurePolicy,
    pub seed: u64,
    pub devices: Vec<DeviceKind>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            debug: false,
            profile: false,
            warmup: DEFAULT_WARMUP,
            iterations: DEFAULT_ITERATIONS,
            policy: FailurePolicy::CollectAll,
            seed: 42,
            devices: vec![DeviceKind::Cpu],
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by `OPCHECK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("OPCHECK_DEBUG") {
            config.debug = parse_flag("OPCHECK_DEBUG", &value)?;
        }
        if let Some(value) = lookup("OPCHECK_PROFILE") {
            config.profile = parse_flag("OPCHECK_PROFILE", &value)?;
        }
        if let Some(value) = lookup("OPCHECK_NUM_PRERUN") {
            config.warmup = parse_number("OPCHECK_NUM_PRERUN", &value)?;
        }
        if let Some(value) = lookup("OPCHECK_NUM_ITERATIONS") {
            config.iterations = parse_number("OPCHECK_NUM_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("OPCHECK_FAIL_FAST") {
            if parse_flag("OPCHECK_FAIL_FAST", &value)? {
                config.policy = FailurePolicy::FailFast;
            }
        }
        if let Some(value) = lookup("OPCHECK_SEED") {
            config.seed = parse_number("OPCHECK_SEED", &value)?;
        }
        if let Some(value) = lookup("OPCHECK_DEVICES") {
            config.devices = parse_devices(&value)?;
        }
        Ok(config)
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_devices(mut self, devices: &[DeviceKind]) -> Self {
        self.devices = devices.to_vec();
        self
    }

    pub fn profiler(&self) -> Profiler {
        Profiler::new(self.warmup, self.iterations)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(OpError::InvalidArgument {
            op: "harness_config.from_env",
            msg: format!("{key} expects a boolean, got '{other}'"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| OpError::InvalidArgument {
            op: "harness_config.from_env",
            msg: format!("{key} expects a non-negative integer, got '{value}'"),
        })
}

pub fn parse_devices(value: &str) -> Result<Vec<DeviceKind>> {
    let devices = value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(DeviceKind::parse)
        .collect::<Result<Vec<_>>>()?;
    if devices.is_empty() {
        return Err(OpError::InvalidArgument {
            op: "harness_config.devices",
            msg: "at least one device is required".to_string(),
        });
    }
    Ok(devices)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrialOutcome {
    Passed,
    Failed { kind: FailureKind, message: String },
}

impl TrialOutcome {
    fn from_error(err: &OpError) -> Self {
        TrialOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialProfile {
    pub backend: ProfileReport,
    pub reference: ProfileReport,
}

impl TrialProfile {
    /// Reference time over backend time; above 1.0 means the backend is faster.
    pub fn speedup(&self) -> f64 {
        if self.backend.mean_us <= 0.0 {
            return f64::INFINITY;
        }
        self.reference.mean_us / self.backend.mean_us
    }
}

/// Wall time of one step of a trial.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialReport {
    pub device: String,
    pub dtype: ElementType,
    pub case: TestCase,
    pub seed: u64,
    pub workspace_bytes: usize,
    pub duration_ms: f64,
    pub outcome: TrialOutcome,
    pub comparison: Option<Comparison>,
    pub profile: Option<TrialProfile>,
    /// Set when profiling a passing trial failed; the outcome is unaffected.
    pub profile_error: Option<String>,
    pub stages: Vec<StageTiming>,
}

impl TrialReport {
    pub fn passed(&self) -> bool {
        self.outcome == TrialOutcome::Passed
    }

    pub fn label(&self) -> String {
        format!("{} {} {}", self.device, self.dtype, self.case.label())
    }

    fn record_stage(&mut self, stage: &'static str, start: Instant) {
        self.stages.push(StageTiming {
            stage,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub op: String,
    pub backend: String,
    pub seed: u64,
    pub policy: FailurePolicy,
    pub devices: Vec<String>,
    pub passed: usize,
    pub failed: usize,
    /// Set when `FailFast` stopped scheduling before every trial ran.
    pub stopped_early: bool,
    pub duration_ms: f64,
    pub trials: Vec<TrialReport>,
}

impl HarnessReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.trials.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TrialReport> {
        self.trials.iter().filter(|trial| !trial.passed())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| OpError::InvalidArgument {
            op: "harness_report.to_json",
            msg: err.to_string(),
        })
    }
}

struct DeviceRun {
    trials: Vec<TrialReport>,
    stopped_early: bool,
}

pub struct Harness {
    config: HarnessConfig,
    backend: Arc<dyn OperatorBackend>,
}

impl Harness {
    pub fn new(config: HarnessConfig, backend: Arc<dyn OperatorBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn OperatorBackend> {
        &self.backend
    }

    /// Devices named by the configuration.
    pub fn devices(&self) -> Vec<Device> {
        enumerate_devices(&self.config.devices)
    }

    /// Runs the operator's whole case table. Protocol misuse aborts with the error;
    /// every other failure is reported per trial.
    pub fn run<S: TelemetrySink>(
        &self,
        op: &dyn Operator,
        devices: &[Device],
        telemetry: Option<&TelemetryRecorder<S>>,
    ) -> Result<HarnessReport> {
        if devices.is_empty() {
            return Err(OpError::InvalidArgument {
                op: "harness.run",
                msg: "no devices to run on".to_string(),
            });
        }
        let start = Instant::now();
        let _run_timer = telemetry.map(|recorder| {
            recorder
                .timer("opcheck.run")
                .with_tag("op", op.name())
                .with_tag("backend", self.backend.name())
                .with_tag("devices", devices.len().to_string())
        });
        let stop = AtomicBool::new(false);
        info!(
            "opcheck start: op={} backend={} devices={} cases={} dtypes={:?} policy={:?}",
            op.name(),
            self.backend.name(),
            devices.len(),
            op.case_table().len(),
            op.dtypes(),
            self.config.policy
        );

        let runs = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(devices.len());
            for device in devices {
                let stop = &stop;
                handles.push(scope.spawn(move || self.run_device(op, device, stop)));
            }
            let mut runs = Vec::with_capacity(handles.len());
            for handle in handles {
                let run = handle.join().map_err(|_| OpError::DeviceFault {
                    op: "harness.run",
                    msg: "device worker panicked".to_string(),
                })?;
                runs.push(run);
            }
            Ok::<_, OpError>(runs)
        })?;

        let mut trials = Vec::new();
        let mut stopped_early = false;
        for run in runs {
            let run = run?;
            stopped_early |= run.stopped_early;
            trials.extend(run.trials);
        }

        if let Some(recorder) = telemetry {
            for trial in &trials {
                record_trial(recorder, op, trial);
            }
        }

        let failed = trials.iter().filter(|trial| !trial.passed()).count();
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let report = HarnessReport {
            op: op.name().to_string(),
            backend: self.backend.name().to_string(),
            seed: self.config.seed,
            policy: self.config.policy,
            devices: devices.iter().map(Device::name).collect(),
            passed: trials.len() - failed,
            failed,
            stopped_early,
            duration_ms,
            trials,
        };
        info!(
            "opcheck completed: op={} passed={} failed={} duration_ms={:.3}",
            report.op, report.passed, report.failed, report.duration_ms
        );
        Ok(report)
    }

    fn run_device(
        &self,
        op: &dyn Operator,
        device: &Device,
        stop: &AtomicBool,
    ) -> Result<DeviceRun> {
        let table = op.case_table();
        let dtypes = op.dtypes();
        let mut trials = Vec::with_capacity(table.len() * dtypes.len());
        let mut stopped_early = false;
        for trial in table.trials_for(device, &dtypes) {
            if stop.load(Ordering::Relaxed) {
                stopped_early = true;
                break;
            }
            let report = match self.run_trial(op, &trial) {
                Ok(report) => report,
                Err(err) => {
                    stop.store(true, Ordering::Relaxed);
                    warn!("{}: protocol misuse, aborting run: {err}", trial.label());
                    return Err(err);
                }
            };
            if !report.passed() && self.config.policy == FailurePolicy::FailFast {
                stop.store(true, Ordering::Relaxed);
            }
            trials.push(report);
        }
        Ok(DeviceRun {
            trials,
            stopped_early,
        })
    }

    /// Runs one trial. Returns `Err` only for protocol misuse.
    pub fn run_trial(&self, op: &dyn Operator, trial: &Trial) -> Result<TrialReport> {
        let start = Instant::now();
        let label = trial.label();
        let seed = trial_seed(self.config.seed, &label);
        let mut report = TrialReport {
            device: trial.device.name(),
            dtype: trial.dtype,
            case: trial.case.clone(),
            seed,
            workspace_bytes: 0,
            duration_ms: 0.0,
            outcome: TrialOutcome::Passed,
            comparison: None,
            profile: None,
            profile_error: None,
            stages: Vec::new(),
        };
        match self.execute_trial(op, trial, seed, &mut report) {
            Ok(()) => {}
            Err(err) if err.is_protocol_misuse() => return Err(err),
            Err(err) => {
                warn!("{label}: {err}");
                report.outcome = TrialOutcome::from_error(&err);
            }
        }
        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!("{label}: {:?} in {:.3} ms", report.outcome, report.duration_ms);
        Ok(report)
    }

    fn execute_trial(
        &self,
        op: &dyn Operator,
        trial: &Trial,
        seed: u64,
        report: &mut TrialReport,
    ) -> Result<()> {
        let case = &trial.case;
        let device = &trial.device;
        let dtype = trial.dtype;
        let mut inputs = (0..op.num_inputs())
            .map(|idx| {
                TestTensor::new(
                    &case.shape,
                    case.input_strides.as_deref(),
                    dtype,
                    device,
                    Fill::Random {
                        seed: input_seed(seed, idx),
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let mut output = match case.inplace {
            InplaceMode::OutOfPlace => TestTensor::new(
                &case.shape,
                case.output_strides.as_deref(),
                dtype,
                device,
                Fill::Zeros,
            )?,
            InplaceMode::Input(idx) => inputs
                .get(idx)
                .ok_or_else(|| OpError::InvalidArgument {
                    op: "harness.trial",
                    msg: format!("{} has no input {idx} to run in place on", op.name()),
                })?
                .alias(),
        };

        let stage = Instant::now();
        let values = inputs
            .iter()
            .map(TestTensor::read_logical)
            .collect::<Result<Vec<_>>>()?;
        let expected = oracle::expected(op, dtype, &case.shape, &values)?;
        report.record_stage("reference", stage);

        let stage = Instant::now();
        let client = OpClient::new(Arc::clone(&self.backend), device);
        let descriptor = {
            let input_descs = inputs
                .iter()
                .map(TestTensor::descriptor)
                .collect::<Result<Vec<_>>>()?;
            client.create(op.kind(), output.descriptor()?, &input_descs)?
        };
        output.destroy_desc();
        for input in inputs.iter_mut() {
            input.destroy_desc();
        }

        let descriptor = descriptor.prepare()?;
        report.workspace_bytes = descriptor.workspace_bytes();
        let workspaces = WorkspaceManager::new(device);
        let workspace = workspaces.acquire(descriptor.workspace_bytes())?;
        let buffers: Vec<_> = inputs.iter().map(TestTensor::data).collect();
        report.record_stage("create", stage);

        let stage = Instant::now();
        descriptor.execute(&workspace, output.data(), &buffers)?;
        device.synchronize()?;
        report.record_stage("execute", stage);

        let stage = Instant::now();
        let actual = output.read_logical()?;
        let tolerance = op.tolerance().get(dtype);
        let comparison = compare(&actual, &expected, &case.shape, tolerance)?;
        if !comparison.passed() && self.config.debug {
            warn!("{}:\n{}", trial.label(), comparison.debug_dump(DEBUG_DUMP_LIMIT));
        }
        let verdict = comparison.clone().into_result();
        report.comparison = Some(comparison);
        report.record_stage("compare", stage);

        if verdict.is_ok() && self.config.profile {
            let stage = Instant::now();
            let profiled = self.profile_trial(op, trial, &values, || {
                descriptor.execute(&workspace, output.data(), &buffers)
            });
            match profiled {
                Ok(profile) => report.profile = Some(profile),
                Err(err) if err.is_protocol_misuse() => return Err(err),
                Err(err) => {
                    warn!("{}: profiling failed: {err}", trial.label());
                    if let Err(pending) = device.synchronize() {
                        debug!("{}: drained pending fault: {pending}", trial.label());
                    }
                    report.profile_error = Some(err.to_string());
                }
            }
            report.record_stage("profile", stage);
        }

        drop(workspace);
        descriptor.destroy()?;
        verdict.map(|_| ())
    }

    fn profile_trial<F>(
        &self,
        op: &dyn Operator,
        trial: &Trial,
        values: &[Vec<f64>],
        execute: F,
    ) -> Result<TrialProfile>
    where
        F: FnMut() -> Result<()>,
    {
        let profiler = self.config.profiler();
        let label = format!("{} {}", op.name(), trial.dtype);
        let backend = profiler.profile(&label, &trial.device, execute)?;
        let host = Device::cpu();
        let reference = profiler.profile(&format!("{label} ref"), &host, || {
            oracle::expected(op, trial.dtype, &trial.case.shape, values).map(|_| ())
        })?;
        Ok(TrialProfile { backend, reference })
    }
}

fn record_trial<S: TelemetrySink>(
    recorder: &TelemetryRecorder<S>,
    op: &dyn Operator,
    trial: &TrialReport,
) {
    let status = match &trial.outcome {
        TrialOutcome::Passed => "passed".to_string(),
        TrialOutcome::Failed { kind, .. } => format!("{kind:?}"),
    };
    let event = TelemetryEvent::new("opcheck.trial", trial.duration_ms)
        .with_tag("op", op.name())
        .with_tag("device", trial.device.clone())
        .with_tag("dtype", trial.dtype.name())
        .with_tag("case", trial.case.label())
        .with_tag("workspace_bytes", trial.workspace_bytes.to_string())
        .with_tag("status", status);
    if let Err(err) = recorder.record(event) {
        warn!("failed to record trial telemetry: {err}");
    }
    for timing in &trial.stages {
        let event = TelemetryEvent::new("opcheck.stage", timing.duration_ms)
            .with_tag("op", op.name())
            .with_tag("device", trial.device.clone())
            .with_tag("dtype", trial.dtype.name())
            .with_tag("case", trial.case.label())
            .with_tag("stage", timing.stage);
        if let Err(err) = recorder.record(event) {
            warn!("failed to record stage telemetry: {err}");
        }
    }
    if let Some(profile) = &trial.profile {
        for report in [&profile.backend, &profile.reference] {
            if let Err(err) = recorder.record(TelemetryEvent::profile(op.name(), report)) {
                warn!("failed to record profile telemetry: {err}");
            }
        }
    }
}

/// Per-trial seed, independent of enumeration order.
pub fn trial_seed(seed: u64, label: &str) -> u64 {
    let payload = format!("{seed}:{label}");
    seed_from_hash(blake3::hash(payload.as_bytes()))
}

fn input_seed(trial_seed: u64, index: usize) -> u64 {
    let payload = format!("{trial_seed}:input{index}");
    seed_from_hash(blake3::hash(payload.as_bytes()))
}

fn seed_from_hash(hash: Hash) -> u64 {
    let bytes = hash.as_bytes();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[0..8]);
    u64::from_le_bytes(buf)
}
