use std::{ffi::OsString, path::PathBuf};

const DEFAULT_WORKERS: usize = 1;
const DEFAULT_WORKER_PROGRAM: &str = "sandpool-worker";

/// How a [`Cluster`](super::Cluster) spawns and sizes its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) envs: Vec<(OsString, OsString)>,
    pub(crate) workers: usize,
    pub(crate) template: String,
    #[cfg(unix)]
    pub(crate) uid: Option<u32>,
    #[cfg(unix)]
    pub(crate) gid: Option<u32>,
    pub(crate) handle_signals: bool,
}

impl ClusterConfig {
    /// One worker running `program`, with signal handling enabled. See
    /// [`ClusterConfig::with_signal_handling`] before embedding a cluster in
    /// an application that handles signals itself.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            workers: DEFAULT_WORKERS,
            template: String::new(),
            #[cfg(unix)]
            uid: None,
            #[cfg(unix)]
            gid: None,
            handle_signals: true,
        }
    }

    /// Read `SANDPOOL_WORKERS` and `SANDPOOL_WORKER_PROGRAM`, falling back to
    /// defaults for missing or invalid values.
    #[must_use]
    pub fn from_env() -> Self {
        let workers = std::env::var("SANDPOOL_WORKERS").map_or(DEFAULT_WORKERS, |raw| {
            match raw.parse::<usize>() {
                Ok(parsed) if parsed > 0 => parsed,
                Ok(_) => {
                    tracing::warn!(%raw, "SANDPOOL_WORKERS must be positive; falling back to default");
                    DEFAULT_WORKERS
                }
                Err(err) => {
                    tracing::warn!(%raw, ?err, "Invalid SANDPOOL_WORKERS; falling back to default");
                    DEFAULT_WORKERS
                }
            }
        });

        let program = match std::env::var_os("SANDPOOL_WORKER_PROGRAM") {
            Some(value) if !value.is_empty() => PathBuf::from(value),
            _ => PathBuf::from(DEFAULT_WORKER_PROGRAM),
        };

        tracing::debug!(workers, program = %program.display(), "resolved cluster config");
        Self::new(program).with_workers(workers)
    }

    /// Pool size; also the number of tasks that may run at once. At least 1.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Code each worker runs after its registration shims.
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    #[cfg(unix)]
    #[must_use]
    pub const fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    #[cfg(unix)]
    #[must_use]
    pub const fn with_gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Shut the pool down on Ctrl-C / SIGTERM, then **terminate the whole
    /// process** with `std::process::exit` (130 for Ctrl-C, 143 for SIGTERM).
    /// On by default.
    ///
    /// Applications that own their shutdown sequence should pass `false` and
    /// call [`Cluster::shutdown`](super::Cluster::shutdown) from their own
    /// signal handling.
    #[must_use]
    pub const fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    pub(crate) fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            if let Some(uid) = self.uid {
                command.uid(uid);
            }
            if let Some(gid) = self.gid {
                command.gid(gid);
            }
        }
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::ClusterConfig;

    #[test]
    fn worker_count_is_at_least_one() {
        let config = ClusterConfig::new("worker").with_workers(0);
        assert_eq!(config.workers(), 1);
        assert_eq!(ClusterConfig::new("worker").with_workers(4).workers(), 4);
    }

    #[test]
    fn signal_handling_can_be_turned_off() {
        assert!(ClusterConfig::new("worker").handle_signals);
        assert!(!ClusterConfig::new("worker").with_signal_handling(false).handle_signals);
    }

    #[test]
    fn builder_collects_args_and_env() {
        let config = ClusterConfig::new("worker")
            .with_arg("--quiet")
            .with_env("RUST_LOG", "warn")
            .with_template("return 1")
            .with_signal_handling(false);
        assert_eq!(config.args, vec![std::ffi::OsString::from("--quiet")]);
        assert_eq!(config.envs.len(), 1);
        assert_eq!(config.template, "return 1");
        assert!(!config.handle_signals);
    }
}
