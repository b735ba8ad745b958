use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use weftcore::RuntimeError;

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Program started for process-range spawns. `None` re-executes the
    /// current executable.
    pub worker_program: Option<PathBuf>,
    /// Arguments placed before `--spec <json>` on the worker command line
    pub worker_args: Vec<String>,
    /// Address the shared-object manager binds to
    pub manager_bind: SocketAddr,
    /// Idle connections a shared-object client keeps open
    pub client_pool_size: usize,
    pub connect_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            worker_args: vec!["worker".to_string()],
            manager_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            client_pool_size: 4,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `WEFT_WORKER_PROGRAM` and `WEFT_MANAGER_BIND`
    pub fn from_env() -> Result<Self, RuntimeError> {
        let mut config = Self::default();

        if let Ok(program) = std::env::var("WEFT_WORKER_PROGRAM") {
            if !program.is_empty() {
                config.worker_program = Some(PathBuf::from(program));
            }
        }

        if let Ok(bind) = std::env::var("WEFT_MANAGER_BIND") {
            config.manager_bind = bind.parse().map_err(|e| {
                RuntimeError::InvalidConfiguration(format!(
                    "WEFT_MANAGER_BIND '{}' is not a socket address: {}",
                    bind, e
                ))
            })?;
        }

        Ok(config)
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Resolves the worker program, falling back to the running executable
    pub fn resolve_worker_program(&self) -> std::io::Result<PathBuf> {
        match &self.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        }
    }
}
