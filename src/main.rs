use std::env;
use std::sync::Arc;

use opcheck::harness::parse_devices;
use opcheck::telemetry::{jsonl_recorder_from_env, TELEMETRY_ENV};
use opcheck::{
    builtin_operators, enumerate_devices, operator_by_name, FailurePolicy, Harness, HarnessConfig,
    HarnessReport, HostBackend, OpError, Operator, Result, TrialOutcome,
};

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    }
}

fn run() -> Result<bool> {
    let args: Vec<String> = env::args().collect();
    if args.len() == 1 {
        print_usage();
        return Ok(true);
    }

    match args[1].as_str() {
        "run" => run_check(&args[2..]),
        "cases" => run_cases(&args[2..]).map(|_| true),
        "--help" | "-h" => {
            print_usage();
            Ok(true)
        }
        command => Err(OpError::InvalidArgument {
            op: "cli",
            msg: format!("unknown command {command}"),
        }),
    }
}

fn run_check(args: &[String]) -> Result<bool> {
    let parser = ArgParser::new(args);
    let mut config = HarnessConfig::from_env()?;
    if parser.has_flag("debug") {
        config.debug = true;
    }
    if parser.has_flag("profile") {
        config.profile = true;
    }
    if let Some(warmup) = parser.get_usize("num-prerun")? {
        config.warmup = warmup;
    }
    if let Some(iterations) = parser.get_usize("num-iterations")? {
        config.iterations = iterations;
    }
    if parser.has_flag("fail-fast") {
        config.policy = FailurePolicy::FailFast;
    }
    if let Some(seed) = parser.get_u64("seed")? {
        config.seed = seed;
    }
    if let Some(devices) = parser.get("devices")? {
        config.devices = parse_devices(&devices)?;
    }
    let format = parser.get("format")?.unwrap_or_else(|| "table".to_string());
    let operators: Vec<Box<dyn Operator>> = match parser.get_csv("op")? {
        Some(names) => names
            .iter()
            .map(|name| operator_by_name(name))
            .collect::<Result<Vec<_>>>()?,
        None => builtin_operators(),
    };

    let telemetry = match jsonl_recorder_from_env(TELEMETRY_ENV) {
        Ok(recorder) => recorder,
        Err(err) => {
            eprintln!("telemetry disabled: {err:?}");
            None
        }
    };
    let harness = Harness::new(config, Arc::new(HostBackend::new()));
    let devices = harness.devices();
    let mut success = true;
    for op in &operators {
        let report = harness.run(op.as_ref(), &devices, telemetry.as_ref())?;
        match format.as_str() {
            "json" => println!("{}", report.to_json()?),
            "table" => print_report(&report),
            other => {
                return Err(OpError::InvalidArgument {
                    op: "cli",
                    msg: format!("--format expects table|json, got '{other}'"),
                })
            }
        }
        success &= report.is_success();
    }
    Ok(success)
}

fn run_cases(args: &[String]) -> Result<()> {
    let parser = ArgParser::new(args);
    let devices = match parser.get("devices")? {
        Some(devices) => enumerate_devices(&parse_devices(&devices)?),
        None => enumerate_devices(&HarnessConfig::default().devices),
    };
    let operators: Vec<Box<dyn Operator>> = match parser.get("op")? {
        Some(name) => vec![operator_by_name(&name)?],
        None => builtin_operators(),
    };
    for op in &operators {
        let table = op.case_table();
        let dtypes = op.dtypes();
        println!(
            "{}: {} cases x {} dtypes x {} devices",
            op.name(),
            table.len(),
            dtypes.len(),
            devices.len()
        );
        for trial in table.trials(&devices, &dtypes) {
            println!("  {}", trial.label());
        }
    }
    Ok(())
}

fn print_report(report: &HarnessReport) {
    println!(
        "{} on {} [{}]: {} passed, {} failed{} ({:.1} ms)",
        report.op,
        report.backend,
        report.devices.join(","),
        report.passed,
        report.failed,
        if report.stopped_early {
            ", stopped early"
        } else {
            ""
        },
        report.duration_ms
    );
    for trial in &report.trials {
        let status = match &trial.outcome {
            TrialOutcome::Passed => "PASS".to_string(),
            TrialOutcome::Failed { kind, message } => format!("FAIL {kind:?}: {message}"),
        };
        println!("  {} ... {status}", trial.label());
        if let Some(profile) = &trial.profile {
            println!(
                "    backend {:.3} us/call, reference {:.3} us/call ({:.2}x)",
                profile.backend.mean_us,
                profile.reference.mean_us,
                profile.speedup()
            );
        }
    }
}

fn print_usage() {
    println!(
        "opcheck\n\nUSAGE:\n  opcheck run [options]\n  opcheck cases [options]\n\nOPTIONS (run):\n  --op <csv>               Operators to check (default: all)\n  --devices <csv>          Devices: cpu, cpu-stream (default: cpu)\n  --debug                  Dump offending elements of failed comparisons\n  --profile                Time backend and reference after a passing check\n  --num-prerun <n>         Untimed warm-up calls (default: 10)\n  --num-iterations <n>     Timed calls (default: 1000)\n  --fail-fast              Stop after the first failing trial\n  --seed <n>               Seed for generated inputs (default: 42)\n  --format <name>          Output format: table|json (default: table)\n\nOPTIONS (cases):\n  --op <name>              Operator to list (default: all)\n  --devices <csv>          Devices to enumerate\n  -h, --help               Print this help text\n\nENVIRONMENT:\n  OPCHECK_DEBUG, OPCHECK_PROFILE, OPCHECK_NUM_PRERUN, OPCHECK_NUM_ITERATIONS,\n  OPCHECK_FAIL_FAST, OPCHECK_SEED, OPCHECK_DEVICES set defaults for `run`.\n  OPCHECK_TELEMETRY=<path> writes trial and profile events as JSONL.\n"
    );
}

struct ArgParser {
    args: Vec<String>,
}

impl ArgParser {
    fn new(args: &[String]) -> Self {
        Self {
            args: args.to_vec(),
        }
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let flag = format!("--{key}");
        Ok(self
            .args
            .iter()
            .position(|value| value == &flag)
            .and_then(|idx| self.args.get(idx + 1))
            .cloned())
    }

    fn has_flag(&self, key: &str) -> bool {
        let flag = format!("--{key}");
        self.args.iter().any(|value| value == &flag)
    }

    fn get_csv(&self, key: &str) -> Result<Option<Vec<String>>> {
        let value = self.get(key)?;
        Ok(value.map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect::<Vec<String>>()
        }))
    }

    fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key)? {
            Some(value) => value
                .parse::<usize>()
                .map(Some)
                .map_err(|_| OpError::InvalidArgument {
                    op: "cli",
                    msg: format!("--{key} expects usize, got '{value}'"),
                }),
            None => Ok(None),
        }
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key)? {
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| OpError::InvalidArgument {
                    op: "cli",
                    msg: format!("--{key} expects u64, got '{value}'"),
                }),
            None => Ok(None),
        }
    }
}
