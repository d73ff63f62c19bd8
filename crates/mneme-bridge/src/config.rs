//! Bridge configuration.
//!
//! Where the worker lives is decided by the embedding application; this module
//! only carries that decision plus the timing knobs of the bridge.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::supervisor::{CommandSpawner, WorkerSpawner};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Directory names checked next to the entry script for an isolated runtime.
const ISOLATED_ENV_DIRS: &[&str] = &["venv", ".venv"];

#[cfg(windows)]
const ISOLATED_ENV_BIN: &str = "Scripts";
#[cfg(not(windows))]
const ISOLATED_ENV_BIN: &str = "bin";

/// How responses are matched to pending requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorrelationMode {
    /// The worker echoes `id`; any number of requests may be in flight.
    #[default]
    EchoId,
    /// The worker may not echo `id`; one request in flight at a time and an
    /// id-less response belongs to it.
    Sequential,
}

impl CorrelationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "echo-id" | "echo_id" | "id" => Some(Self::EchoId),
            "sequential" | "fifo" => Some(Self::Sequential),
            _ => None,
        }
    }
}

/// The worker executable and how to launch it.
#[derive(Debug, Clone, Default)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Entry script of the worker. An isolated runtime (`venv/` or `.venv/`)
    /// next to it has its binary directory prepended to `PATH`.
    pub entry_script: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the entry script; it is also passed as the first argument.
    pub fn entry_script(mut self, script: impl Into<PathBuf>) -> Self {
        let script = script.into();
        self.args.insert(0, script.to_string_lossy().into_owned());
        self.entry_script = Some(script);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Isolated runtime root and its binary directory, if one exists on disk.
    pub fn isolated_env(&self) -> Option<(PathBuf, PathBuf)> {
        let script_dir = self.entry_script.as_deref()?.parent()?;
        ISOLATED_ENV_DIRS.iter().find_map(|name| {
            let root = script_dir.join(name);
            let bin = root.join(ISOLATED_ENV_BIN);
            bin.is_dir().then_some((root, bin))
        })
    }

    /// Environment overrides applied on top of the inherited environment.
    pub fn environment(&self) -> Vec<(OsString, OsString)> {
        let mut vars = Vec::new();
        if let Some((root, bin)) = self.isolated_env() {
            if let Some(path) = prepend_search_path(&bin, std::env::var_os("PATH")) {
                vars.push((OsString::from("PATH"), path));
            }
            vars.push((OsString::from("VIRTUAL_ENV"), root.into_os_string()));
        }
        vars.extend(
            self.env
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        vars
    }
}

/// Put `dir` in front of an existing search path.
fn prepend_search_path(dir: &Path, current: Option<OsString>) -> Option<OsString> {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(current) = current {
        paths.extend(std::env::split_paths(&current));
    }
    match std::env::join_paths(paths) {
        Ok(joined) => Some(joined),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot prepend to PATH");
            None
        }
    }
}

#[derive(Clone)]
pub struct BridgeConfig {
    pub worker: WorkerCommand,
    pub request_timeout: Duration,
    pub startup_grace: Duration,
    pub shutdown_grace: Duration,
    pub correlation: CorrelationMode,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("worker", &self.worker)
            .field("request_timeout", &self.request_timeout)
            .field("startup_grace", &self.startup_grace)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("correlation", &self.correlation)
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_grace: DEFAULT_STARTUP_GRACE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            correlation: CorrelationMode::default(),
            spawner: Arc::new(CommandSpawner),
        }
    }

    /// Build from `MNEME_*` environment variables.
    ///
    /// Returns `None` when `MNEME_WORKER` is unset. Other variables fall back to
    /// defaults when unset or unparsable.
    pub fn from_env() -> Option<Self> {
        let program = std::env::var_os("MNEME_WORKER")?;
        let mut worker = WorkerCommand::new(program);
        if let Ok(args) = std::env::var("MNEME_WORKER_ARGS") {
            worker = worker.args(args.split_whitespace());
        }
        if let Some(script) = std::env::var_os("MNEME_WORKER_SCRIPT") {
            worker = worker.entry_script(script);
        }
        if let Some(dir) = std::env::var_os("MNEME_WORKER_DIR") {
            worker = worker.working_dir(dir);
        }

        let mut config = Self::new(worker);
        if let Some(timeout) = env_secs("MNEME_REQUEST_TIMEOUT") {
            config.request_timeout = timeout;
        }
        if let Some(grace) = env_secs("MNEME_STARTUP_GRACE") {
            config.startup_grace = grace;
        }
        if let Some(mode) = std::env::var("MNEME_CORRELATION")
            .ok()
            .and_then(|s| CorrelationMode::parse(&s))
        {
            config.correlation = mode;
        }
        Some(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_correlation(mut self, mode: CorrelationMode) -> Self {
        self.correlation = mode;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
