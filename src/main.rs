//! dexkeeper CLI entry point.
//!
//! Provides `rundex` for supervising Dex and `gendexcfg` for rendering the
//! Dex config once.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use dexkeeper::config::{load_or_default, DexkeeperConfig};
use dexkeeper::dex::{DexRenderer, Renderer};
use dexkeeper::files::{write_with_mode, PUBLIC_FILE_MODE};
use dexkeeper::logging::{self, LogFormat};
use dexkeeper::redactor::DISPLAY_RULES;
use dexkeeper::settings::{FileSettingsSource, SettingsSource};
use dexkeeper::supervisor::{DexLauncher, Supervisor, SupervisorOptions};
use dexkeeper::tls;

/// Runs Dex with a config rendered from live settings.
#[derive(Parser)]
#[command(name = "dexkeeper", version, about)]
struct Cli {
    /// Supervisor config file (TOML).
    #[arg(long, env = "DEXKEEPER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Settings file Dex is configured from. Overrides `[settings].path`.
    #[arg(long, env = "DEXKEEPER_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    /// Secrets file referenced from the settings. Overrides `[settings].secrets_path`.
    #[arg(long, env = "DEXKEEPER_SECRETS", global = true)]
    secrets: Option<PathBuf>,

    /// Log format.
    #[arg(
        long = "logformat",
        value_enum,
        env = "DEXKEEPER_LOGFORMAT",
        default_value = "json",
        global = true
    )]
    log_format: LogFormat,

    /// Log level (trace, debug, info, warn, error).
    #[arg(
        long = "loglevel",
        env = "DEXKEEPER_LOGLEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    /// Also write JSON logs with daily rotation to this directory.
    #[arg(long, env = "DEXKEEPER_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run Dex with a generated config and restart it when the config changes.
    Rundex {
        /// Serve Dex over plain HTTP.
        #[arg(long, env = "DEXKEEPER_DISABLE_TLS")]
        disable_tls: bool,
    },
    /// Generate the Dex config once and print it (masked) or write it.
    Gendexcfg {
        /// Render the config for plain HTTP.
        #[arg(long, env = "DEXKEEPER_DISABLE_TLS")]
        disable_tls: bool,

        /// Write the unmasked config to this file instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_format, &cli.log_level, cli.log_dir.as_deref())?;
    install_panic_hook();

    let config = load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Rundex { disable_tls } => handle_rundex(&cli, config, disable_tls).await,
        Command::Gendexcfg { disable_tls, ref out } => {
            handle_gendexcfg(&cli, config, disable_tls, out.clone()).await
        }
    }
}

/// Log panics through `tracing` so they reach the configured outputs.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic| {
        let trace = std::backtrace::Backtrace::force_capture();
        error!(panic = %panic, trace = %trace, "recovered from panic");
    }));
}

fn settings_source(cli: &Cli, config: &DexkeeperConfig) -> FileSettingsSource {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(|| config.settings.path.clone());
    let secrets = cli
        .secrets
        .clone()
        .or_else(|| config.settings.secrets_path.clone());
    FileSettingsSource::new(path, secrets)
}

fn renderer(cli: &Cli, config: &DexkeeperConfig) -> DexRenderer {
    DexRenderer::new(&cli.log_level, cli.log_format.as_str()).with_tls_paths(
        &config.tls.cert_path.display().to_string(),
        &config.tls.key_path.display().to_string(),
    )
}

/// Run the Dex supervisor until SIGINT/SIGTERM or a fatal error.
async fn handle_rundex(cli: &Cli, config: DexkeeperConfig, disable_tls: bool) -> anyhow::Result<()> {
    let source = settings_source(cli, &config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        settings = %source.settings_path().display(),
        disable_tls,
        "dexkeeper starting"
    );

    let launcher = DexLauncher::new(&config.dex.binary, config.dex.args.clone())
        .context("dex executable is not available")?;
    info!(program = %launcher.program().display(), "using dex executable");

    if !disable_tls {
        let material = tls::provision(&config.tls.source_cert, &config.tls.source_key, &config.tls.hosts)
            .context("could not create TLS material")?;
        material
            .persist(&config.tls.cert_path, &config.tls.key_path)
            .context("could not write TLS material")?;
    }

    let options = SupervisorOptions {
        disable_tls,
        config_path: config.dex.config_path.clone(),
        shutdown_timeout: config.shutdown.timeout(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown_signals(shutdown_tx));

    let mut supervisor = Supervisor::new(source, renderer(cli, &config), launcher, options);
    supervisor
        .run(shutdown_rx)
        .await
        .context("dex supervisor failed")?;

    info!(config_changes = supervisor.config_changes(), "dexkeeper stopped");
    Ok(())
}

/// Render the Dex config once.
///
/// With `out`, the unmasked config is written there. Without it, the config
/// is printed to stdout with static client secrets masked.
async fn handle_gendexcfg(
    cli: &Cli,
    config: DexkeeperConfig,
    disable_tls: bool,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let source = settings_source(cli, &config);
    let settings = source
        .current()
        .await
        .with_context(|| format!("failed to load {}", source.settings_path().display()))?;

    let rendered = renderer(cli, &config)
        .render(&settings, disable_tls)
        .context("failed to render dex config")?;
    if rendered.is_empty() {
        info!("dex is not configured");
        return Ok(());
    }

    match out {
        Some(path) => {
            write_with_mode(&path, &rendered, PUBLIC_FILE_MODE)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "dex config written");
        }
        None => {
            let masked = DISPLAY_RULES
                .redact_document(&rendered)
                .context("failed to mask dex config")?;
            print!("{masked}");
        }
    }

    Ok(())
}

/// Flip `shutdown` to `true` on SIGINT or SIGTERM.
async fn forward_shutdown_signals(shutdown: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler, only SIGINT is handled");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }

    let _ = shutdown.send(true);
}
