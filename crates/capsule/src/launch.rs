//! Worker command line.
//!
//! Argument order is fixed so a failing launch can be reproduced by copying
//! the logged command:
//!
//! ```text
//! <program> [--library-path=P] [pass-through flags...] [--agent=A]
//!           --data-dir=D --ui-port=N [--mem-db] [--aggregate-interval=S]
//!           [extra worker flags...] <entry-point> <control-port>
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Flags copied from our own argv when they start with this prefix.
pub const DEFAULT_PASSTHROUGH_PREFIX: &str = "--instrument=";

/// Environment override forwarded as `--aggregate-interval`.
pub const AGGREGATE_INTERVAL_ENV: &str = "CAPSULE_AGGREGATE_INTERVAL";

pub const DEFAULT_ENTRY_POINT: &str = "capsule-worker";

/// Immutable argument list. The control port is filled in by the supervisor
/// once its listener is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: PathBuf,
    args: Vec<String>,
    control_port: Option<u16>,
}

impl LaunchSpec {
    pub fn builder(program: impl Into<PathBuf>) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(program)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments after the program, including the control port when set.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(port) = self.control_port {
            args.push(port.to_string());
        }
        args
    }

    pub fn control_port(&self) -> Option<u16> {
        self.control_port
    }

    /// Copy of this spec bound to `port`.
    pub fn with_control_port(&self, port: u16) -> Self {
        Self {
            control_port: Some(port),
            ..self.clone()
        }
    }

    /// Program and arguments as one line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpecBuilder {
    program: PathBuf,
    library_path: Option<String>,
    passthrough: Vec<String>,
    agent: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    ui_port: u16,
    use_file_db: bool,
    aggregate_interval: Option<u32>,
    extra_args: Vec<String>,
    entry_point: String,
}

impl LaunchSpecBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            library_path: None,
            passthrough: Vec::new(),
            agent: None,
            data_dir: None,
            ui_port: 0,
            use_file_db: true,
            aggregate_interval: aggregate_interval_from_env(),
            extra_args: Vec::new(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        }
    }

    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    /// Copy every argument starting with `prefix`, verbatim and in order.
    pub fn with_passthrough_from<I, S>(mut self, args: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.passthrough.extend(
            args.into_iter()
                .filter_map(|arg| arg.into().into_string().ok())
                .filter(|arg| arg.starts_with(prefix)),
        );
        self
    }

    /// Pass through instrumentation flags from this process's own argv.
    pub fn with_current_passthrough(self) -> Self {
        self.with_passthrough_from(std::env::args_os().skip(1), DEFAULT_PASSTHROUGH_PREFIX)
    }

    pub fn with_agent(mut self, agent: impl Into<PathBuf>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// 0 lets the worker pick a free port.
    pub fn with_ui_port(mut self, port: u16) -> Self {
        self.ui_port = port;
        self
    }

    pub fn with_file_db(mut self, use_file_db: bool) -> Self {
        self.use_file_db = use_file_db;
        self
    }

    pub fn with_aggregate_interval(mut self, seconds: Option<u32>) -> Self {
        self.aggregate_interval = seconds;
        self
    }

    /// Worker-specific flags, placed just before the entry point.
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn build(&self) -> LaunchSpec {
        let mut args = Vec::new();

        if let Some(ref path) = self.library_path {
            args.push(format!("--library-path={path}"));
        }
        args.extend(self.passthrough.iter().cloned());
        if let Some(ref agent) = self.agent {
            args.push(format!("--agent={}", agent.display()));
        }
        if let Some(ref dir) = self.data_dir {
            let dir = std::path::absolute(dir).unwrap_or_else(|_| dir.clone());
            args.push(format!("--data-dir={}", dir.display()));
        }
        args.push(format!("--ui-port={}", self.ui_port));
        if !self.use_file_db {
            args.push("--mem-db".to_string());
        }
        if let Some(interval) = self.aggregate_interval {
            args.push(format!("--aggregate-interval={interval}"));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.entry_point.clone());

        LaunchSpec {
            program: self.program.clone(),
            args,
            control_port: None,
        }
    }
}

fn aggregate_interval_from_env() -> Option<u32> {
    std::env::var(AGGREGATE_INTERVAL_ENV)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
