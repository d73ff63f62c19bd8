use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use mneme_bridge::{
    Bridge, BridgeConfig, BridgeError, CorrelationMode, WorkerCommand, logging,
};

const USAGE: &str = "\
Usage: mneme-bridge [options] <action> [<params-json>]

Arguments:
  <action>             Worker action, e.g. ping or vault.search
  <params-json>        JSON object of parameters [default: {}]

Options:
  --worker <program>   Worker executable [env: MNEME_WORKER]
  --arg <arg>          Extra worker argument (repeatable)
  --cwd <dir>          Worker working directory
  --script <path>      Worker entry script (passed as first argument)
  --timeout <secs>     Request timeout in seconds [default: 30]
  --sequential         One request at a time; for workers that do not echo ids
  --version            Print version information";

#[derive(Debug, Default)]
struct Options {
    worker: Option<String>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    script: Option<PathBuf>,
    timeout: Option<Duration>,
    sequential: bool,
    version: bool,
    action: Option<String>,
    params: Option<String>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => usage_error(&msg),
    };

    if opts.version {
        let worker = opts
            .worker
            .clone()
            .or_else(|| std::env::var("MNEME_WORKER").ok());
        println!("{}", version_line(worker.as_deref()));
        return;
    }

    let (config, action, params) = match build_request(opts) {
        Ok(v) => v,
        Err(msg) => usage_error(&msg),
    };

    logging::init_tracing();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        }
    };

    match rt.block_on(run(config, &action, params)) {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(details) = e.downcast_ref::<BridgeError>().and_then(BridgeError::details) {
                eprintln!();
                eprintln!("{details}");
            }
            process::exit(1);
        }
    }
}

/// `mneme-bridge <version>`, plus the configured worker when there is one.
fn version_line(worker: Option<&str>) -> String {
    let version = env!("CARGO_PKG_VERSION");
    match worker {
        Some(worker) => format!("mneme-bridge {version} (worker: {worker})"),
        None => format!("mneme-bridge {version}"),
    }
}

fn usage_error(msg: &str) -> ! {
    if !msg.is_empty() {
        eprintln!("error: {msg}");
        eprintln!();
    }
    eprintln!("{USAGE}");
    process::exit(2);
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                opts.worker = Some(args.get(i).ok_or("--worker requires a value")?.clone());
            }
            "--arg" => {
                i += 1;
                opts.args
                    .push(args.get(i).ok_or("--arg requires a value")?.clone());
            }
            "--cwd" => {
                i += 1;
                opts.cwd = Some(PathBuf::from(args.get(i).ok_or("--cwd requires a value")?));
            }
            "--script" => {
                i += 1;
                opts.script = Some(PathBuf::from(
                    args.get(i).ok_or("--script requires a value")?,
                ));
            }
            "--timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout requires a value")?;
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout value: {raw}"))?;
                let timeout = Duration::try_from_secs_f64(secs)
                    .map_err(|_| format!("invalid --timeout value: {raw}"))?;
                opts.timeout = Some(timeout);
            }
            "--sequential" => opts.sequential = true,
            "--version" | "-V" => opts.version = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => {
                if opts.action.is_none() {
                    opts.action = Some(arg.to_string());
                } else if opts.params.is_none() {
                    opts.params = Some(arg.to_string());
                } else {
                    return Err(format!("unexpected argument: {arg}"));
                }
            }
        }
        i += 1;
    }

    Ok(opts)
}

/// Resolve flags against `MNEME_*` variables. Flags win.
fn build_request(opts: Options) -> Result<(BridgeConfig, String, Value), String> {
    let action = opts.action.ok_or("missing required argument: <action>")?;
    let params = match opts.params {
        Some(raw) => {
            let value: Value =
                serde_json::from_str(&raw).map_err(|e| format!("invalid params JSON: {e}"))?;
            if !value.is_object() {
                return Err("params must be a JSON object".to_string());
            }
            value
        }
        None => Value::Object(Default::default()),
    };

    let mut config = match (opts.worker, BridgeConfig::from_env()) {
        (Some(program), Some(env)) => BridgeConfig {
            worker: WorkerCommand::new(program),
            ..env
        },
        (Some(program), None) => BridgeConfig::new(WorkerCommand::new(program)),
        (None, Some(env)) => env,
        (None, None) => return Err("no worker configured (use --worker or MNEME_WORKER)".into()),
    };

    config.worker = config.worker.args(opts.args);
    if let Some(script) = opts.script {
        config.worker = config.worker.entry_script(script);
    }
    if let Some(cwd) = opts.cwd {
        config.worker = config.worker.working_dir(cwd);
    }
    if let Some(timeout) = opts.timeout {
        config = config.with_request_timeout(timeout);
    }
    if opts.sequential {
        config = config.with_correlation(CorrelationMode::Sequential);
    }
    Ok((config, action, params))
}

async fn run(config: BridgeConfig, action: &str, params: Value) -> anyhow::Result<Value> {
    let bridge = Bridge::new(config);
    bridge.start().await.context("failed to start worker")?;

    let result = bridge.request(action, params).await;
    bridge.stop().await;

    Ok(result?)
}
