//! vhostgen - nginx virtual hosts and Vault certificates from running containers

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use vhostgen::{
    Result,
    cli::{Cli, Command},
    config::Config,
    control::{self, ControlState},
    generator::ConfGen,
    pki::{CertFiles, CertificateManager, ValidityPolicy, VaultClient},
    qualify::Qualifier,
    reload,
    render::Renderer,
    runtime::{DockerRuntime, DynContainerRuntime},
    setup_tracing,
    watcher::{Debouncer, Regenerate, Regenerator, Watcher},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Command::Generate { reload }) => run_generate(&config, reload).await,
        Some(Command::Watch { no_control }) => run_watch(config, no_control).await,
        None => run_watch(config, false).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Runtime handle plus the regenerator wired from `config`
fn build(config: &Config) -> Result<(DynContainerRuntime, Arc<Regenerator>)> {
    let runtime: DynContainerRuntime =
        Arc::new(DockerRuntime::connect(config.watch.docker_host.as_deref())?);

    let store = Arc::new(VaultClient::new(&config.vault)?);
    let certs = CertificateManager::new(
        store,
        CertFiles::new(&config.paths.cert_dir),
        ValidityPolicy::from_config(&config.vault),
    );
    let qualifier = Arc::new(Qualifier::new(Arc::new(certs), config.naming.clone()));
    let renderer = Renderer::new(&config.render, &config.paths.cert_dir)?;
    let confgen = ConfGen::new(Arc::clone(&runtime), qualifier, renderer, &config.paths);

    let regenerator = Regenerator::new(confgen, reload::from_config(&config.reload));
    Ok((runtime, Arc::new(regenerator)))
}

async fn run_generate(config: &Config, force_reload: bool) -> Result<()> {
    let (_, regenerator) = build(config)?;
    let outcome = regenerator.run_cycle(force_reload).await?;
    info!(
        rewritten = outcome.rewritten,
        reloaded = outcome.reloaded,
        path = %regenerator.confgen().conf_path().display(),
        "Generation complete"
    );
    Ok(())
}

async fn run_watch(config: Config, no_control: bool) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        conf = %config.paths.conf_path().display(),
        debounce = ?config.watch.debounce,
        "Starting vhostgen"
    );

    let (runtime, regenerator) = build(&config)?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (debouncer, debounce_task) = Debouncer::spawn(
        Arc::clone(&regenerator) as Arc<dyn Regenerate>,
        config.watch.debounce,
        shutdown_tx.subscribe(),
    );

    let control_task = if config.control.enabled && !no_control {
        let state = Arc::new(ControlState {
            regenerator: Arc::clone(&regenerator),
        });
        let control_config = config.control.clone();
        let rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = control::serve(&control_config, state, rx).await {
                error!(error = %e, "Control surface failed");
            }
        }))
    } else {
        info!("Control surface disabled");
        None
    };

    let watcher = Watcher::new(runtime, debouncer, config.watch.reconnect_delay);
    let watch_rx = shutdown_tx.subscribe();
    tokio::select! {
        () = watcher.run(watch_rx) => {}
        () = shutdown_signal(shutdown_tx.clone()) => {}
    }
    let _ = shutdown_tx.send(());

    if let Err(e) = debounce_task.await {
        warn!(error = %e, "Debouncer task ended abnormally");
    }
    if let Some(task) = control_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Control task ended abnormally");
        }
    }

    info!("vhostgen shutdown complete");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
