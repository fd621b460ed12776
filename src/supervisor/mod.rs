//! The watch, render, diff, restart loop around a single Dex process.
//!
//! ```text
//! bootstrap ─▶ render ─┬─ empty ─────▶ NoProcess ─┐
//!                      └─ non-empty ─▶ Running ───┤
//!                                                 ▼
//!          ┌──────────── unmodified ◀──── wait for snapshot, re-render
//!          ▼                                      │ modified
//!     wait again                     terminate (bounded) ─▶ render
//! ```
//!
//! The [`Supervisor`] value owns the last rendered document and the process
//! handle. Every error is returned from [`Supervisor::run`]; nothing is
//! retried.

pub mod process;

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn, Level};

use crate::dex::{RenderError, Renderer};
use crate::files::{write_with_mode, PUBLIC_FILE_MODE};
use crate::redactor::LOG_RULES;
use crate::settings::{Settings, SettingsError, SettingsSource};

pub use process::{DexLauncher, Launcher, ManagedProcess, ProcessError, Termination};

/// Errors that end the supervisor loop.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The initial settings snapshot could not be fetched.
    #[error("failed to fetch settings: {0}")]
    SettingsFetch(#[source] SettingsError),
    /// The settings subscription could not be opened.
    #[error("failed to subscribe to settings: {0}")]
    Subscribe(#[source] SettingsError),
    /// A snapshot could not be rendered.
    #[error(transparent)]
    Render(#[from] RenderError),
    /// The rendered config could not be written.
    #[error("failed to write dex config to {path}: {source}")]
    Persist {
        /// Config path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Starting, signalling or waiting on Dex failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Fixed parameters of a supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Render the HTTP listener without TLS.
    pub disable_tls: bool,
    /// Where the rendered config is written and passed to Dex.
    pub config_path: PathBuf,
    /// How long Dex gets to exit after SIGTERM before it is killed.
    pub shutdown_timeout: Duration,
}

/// Supervises one Dex process against a settings source.
pub struct Supervisor<S, R, L> {
    source: S,
    renderer: R,
    launcher: L,
    options: SupervisorOptions,
    /// Document the running process was started with; empty when none.
    active_config: Vec<u8>,
    process: Option<Box<dyn ManagedProcess>>,
    config_changes: u64,
}

impl<S, R, L> Supervisor<S, R, L>
where
    S: SettingsSource,
    R: Renderer,
    L: Launcher,
{
    /// Create a supervisor. Nothing runs until [`Supervisor::run`].
    pub fn new(source: S, renderer: R, launcher: L, options: SupervisorOptions) -> Self {
        Self {
            source,
            renderer,
            launcher,
            options,
            active_config: Vec::new(),
            process: None,
            config_changes: 0,
        }
    }

    /// Number of rendered config changes applied after the first one.
    ///
    /// Every change counts, including the first start after an unconfigured
    /// snapshot and a stop without replacement.
    pub fn config_changes(&self) -> u64 {
        self.config_changes
    }

    /// Run until `shutdown` turns `true`, the settings subscription closes,
    /// or an error occurs.
    ///
    /// Dex is stopped before this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] on the first failure to fetch, render,
    /// persist, start or stop.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let initial = tokio::select! {
            result = self.source.current() => result.map_err(SupervisorError::SettingsFetch)?,
            () = wait_for_shutdown(&mut shutdown) => {
                info!("shutdown requested before settings were loaded");
                return Ok(());
            }
        };
        let mut updates = self
            .source
            .subscribe()
            .map_err(SupervisorError::Subscribe)?;

        let mut pending = self.render(&initial)?;

        'supervise: loop {
            if *shutdown.borrow() {
                break;
            }

            self.apply(pending).await?;

            loop {
                let next = tokio::select! {
                    next = updates.recv() => next,
                    () = wait_for_shutdown(&mut shutdown) => break 'supervise,
                };
                let Some(settings) = next else {
                    warn!("settings subscription closed");
                    break 'supervise;
                };

                let rendered = self.render(&settings)?;
                if rendered == self.active_config {
                    info!(generation = settings.generation, "dex config unmodified");
                    continue;
                }

                info!(generation = settings.generation, "dex config modified, restarting dex");
                self.stop().await?;
                self.config_changes = self.config_changes.saturating_add(1);
                pending = rendered;
                break;
            }
        }

        info!("supervisor shutting down");
        self.stop().await
    }

    fn render(&self, settings: &Settings) -> Result<Vec<u8>, SupervisorError> {
        Ok(self.renderer.render(settings, self.options.disable_tls)?)
    }

    /// Persist `config` and start Dex with it, or stay idle when it is empty.
    async fn apply(&mut self, config: Vec<u8>) -> Result<(), SupervisorError> {
        if config.is_empty() {
            info!("dex is not configured");
            self.active_config = config;
            return Ok(());
        }

        let path = &self.options.config_path;
        write_with_mode(path, &config, PUBLIC_FILE_MODE).map_err(|source| {
            SupervisorError::Persist {
                path: path.clone(),
                source,
            }
        })?;
        log_redacted(&config);

        let process = self.launcher.launch(path).await?;
        self.process = Some(process);
        self.active_config = config;
        Ok(())
    }

    /// Terminate the running process, if any, within the shutdown timeout.
    async fn stop(&mut self) -> Result<(), SupervisorError> {
        if let Some(mut process) = self.process.take() {
            let pid = process.pid();
            let termination = process.terminate(self.options.shutdown_timeout).await?;
            debug!(pid, termination = ?termination, "dex terminated");
        }
        self.active_config.clear();
        Ok(())
    }
}

/// Resolve once the shutdown flag is `true` or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        debug!("shutdown sender dropped");
    }
}

fn log_redacted(config: &[u8]) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    match LOG_RULES.redact_document(config) {
        Ok(redacted) => debug!(config = %redacted, "rendered dex config"),
        Err(e) => warn!(error = %e, "failed to redact dex config for logging"),
    }
}
