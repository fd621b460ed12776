//! The managed Dex process.
//!
//! [`Launcher`] starts a process for a config path; [`ManagedProcess`]
//! stops it gracefully within a deadline, escalating to a kill.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

/// Errors from process lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The executable could not be found.
    #[error("executable '{program}' not found on PATH")]
    NotFound {
        /// Program name.
        program: String,
    },
    /// The process could not be spawned.
    #[error("failed to start {program}: {detail}")]
    Start {
        /// Program name.
        program: String,
        /// Error detail.
        detail: String,
    },
    /// The termination signal could not be delivered.
    #[error("failed to signal process {pid}: {detail}")]
    Signal {
        /// Process id.
        pid: u32,
        /// Error detail.
        detail: String,
    },
    /// Waiting for the process to exit failed.
    #[error("failed to wait for process {pid}: {detail}")]
    Wait {
        /// Process id.
        pid: u32,
        /// Error detail.
        detail: String,
    },
}

/// How a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own or after SIGTERM.
    Exited {
        /// Exit code, when the process was not ended by a signal.
        code: Option<i32>,
    },
    /// The process ignored SIGTERM past the deadline and was killed.
    Killed,
}

/// A running process owned by the supervisor.
#[async_trait]
pub trait ManagedProcess: Send {
    /// Operating system process id.
    fn pid(&self) -> u32;

    /// Ask the process to stop and wait up to `grace` for it to exit, then
    /// kill it.
    async fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessError>;
}

/// Starts managed processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a process that reads its configuration from `config_path`.
    async fn launch(&self, config_path: &Path) -> Result<Box<dyn ManagedProcess>, ProcessError>;
}

/// Launches Dex as `<program> <args..> <config path>`.
///
/// Standard output and error are inherited. The child is killed if its
/// handle is dropped without being terminated.
#[derive(Debug, Clone)]
pub struct DexLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl DexLauncher {
    /// Resolve `program` on `PATH` and build a launcher for it.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NotFound`] if no executable matches.
    pub fn new(program: &str, args: Vec<String>) -> Result<Self, ProcessError> {
        let program = find_executable(program).ok_or_else(|| ProcessError::NotFound {
            program: program.to_owned(),
        })?;
        Ok(Self { program, args })
    }

    /// Resolved executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl Launcher for DexLauncher {
    async fn launch(&self, config_path: &Path) -> Result<Box<dyn ManagedProcess>, ProcessError> {
        let program = self.program.display().to_string();
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Start {
                program: program.clone(),
                detail: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| ProcessError::Start {
            program: program.clone(),
            detail: "process exited before its id could be read".to_owned(),
        })?;

        info!(pid, program = %program, config = %config_path.display(), "dex started");
        Ok(Box::new(DexProcess { child, pid }))
    }
}

/// A spawned Dex child process.
#[derive(Debug)]
pub struct DexProcess {
    child: tokio::process::Child,
    pid: u32,
}

#[async_trait]
impl ManagedProcess for DexProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessError> {
        let pid = self.pid;
        let wait_error = |e: std::io::Error| ProcessError::Wait {
            pid,
            detail: e.to_string(),
        };

        if let Some(status) = self.child.try_wait().map_err(wait_error)? {
            warn!(pid, code = ?status.code(), "dex had already exited");
            return Ok(Termination::Exited {
                code: status.code(),
            });
        }

        send_terminate(&mut self.child, pid)?;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status.map_err(wait_error)?;
                info!(pid, code = ?status.code(), "dex stopped");
                Ok(Termination::Exited {
                    code: status.code(),
                })
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_secs = grace.as_secs_f64(),
                    "dex did not stop in time, killing"
                );
                self.child.kill().await.map_err(|e| ProcessError::Signal {
                    pid,
                    detail: e.to_string(),
                })?;
                Ok(Termination::Killed)
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut tokio::process::Child, pid: u32) -> Result<(), ProcessError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        detail: "pid out of range".to_owned(),
    })?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| ProcessError::Signal {
        pid,
        detail: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_terminate(child: &mut tokio::process::Child, pid: u32) -> Result<(), ProcessError> {
    child.start_kill().map_err(|e| ProcessError::Signal {
        pid,
        detail: e.to_string(),
    })
}

/// Look up `program` the way a shell would.
///
/// Names containing a path separator are used as given; bare names are
/// searched for in each `PATH` entry.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
