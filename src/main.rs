use podgate::client::BackendClient;
use podgate::config::Config;
use podgate::controlplane::{ControlPlane, ControlPlaneClient};
use podgate::gateway::{GatewayServer, ProxyApp};
use podgate::idle::IdleMonitor;
use podgate::lifecycle::LifecycleController;
use podgate::reporter::StatusReporter;
use podgate::state::GlobalState;
use podgate::tunnel::TunnelSupervisor;
use podgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("podgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let control_plane = Arc::new(ControlPlaneClient::new(&config.control_plane)?);

    // Seed local state from the control plane's current truth so an
    // already-running pod is adopted instead of shut down
    let initially_running = control_plane
        .find_pod(&config.control_plane.pod_name)
        .await
        .map_err(|e| {
            error!(error = %e, "Initial control-plane query failed");
            e
        })?
        .map_or(false, |p| p.is_running());
    info!(
        pod = %config.control_plane.pod_name,
        running = initially_running,
        "Initial pod state"
    );

    let state = GlobalState::new(&config.web.apps, initially_running)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One listener per configured application
    let mut proxy_handles = Vec::new();
    for (app_config, proxy) in config.web.apps.iter().zip(&state.proxies) {
        let addr: SocketAddr = format!("{}:{}", config.web.bind, app_config.local_port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.web.bind, port = app_config.local_port, error = %e, "Invalid bind address");
                anyhow::anyhow!("Invalid bind address: {}", e)
            })?;

        let backend =
            (app_config.remote_port > 0).then(|| BackendClient::new(app_config.remote_port));
        let app = Arc::new(ProxyApp {
            name: app_config.name.clone(),
            proxy: Arc::clone(proxy),
            global: Arc::clone(&state),
            backend,
            dont_wake_paths: config.web.dont_wake_paths.clone(),
        });

        let server = GatewayServer::new(addr, app, shutdown_rx.clone());
        let name = app_config.name.clone();
        proxy_handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(app = %name, error = %e, "Proxy server error");
            }
        }));
    }

    // Monitor loops
    let lifecycle = LifecycleController::new(
        Arc::clone(&control_plane),
        Arc::clone(&state),
        &config,
        shutdown_rx.clone(),
    );
    let lifecycle_handle = tokio::spawn(lifecycle.run());

    let tunnel = TunnelSupervisor::new(
        Arc::clone(&control_plane),
        Arc::clone(&state),
        config.ssh.clone(),
        config.control_plane.pod_name.clone(),
        config.forward_ports(),
        shutdown_rx.clone(),
    );
    let tunnel_handle = tokio::spawn(tunnel.run());

    let mut monitor_handles = Vec::new();
    for proxy in &state.proxies {
        let monitor = IdleMonitor::new(
            Arc::clone(proxy),
            Arc::clone(&state),
            config.web.shutdown_timeout(),
            shutdown_rx.clone(),
        );
        monitor_handles.push(tokio::spawn(monitor.run()));
    }

    let reporter = StatusReporter::new(Arc::clone(&state), shutdown_rx.clone());
    monitor_handles.push(tokio::spawn(reporter.run()));

    if config.ssh.update_ssh_config {
        let host = config
            .ssh
            .host_alias
            .clone()
            .unwrap_or_else(|| config.control_plane.pod_name.clone());
        monitor_handles.push(tokio::spawn(podgate::sshconfig::run(
            Arc::clone(&state),
            host,
            shutdown_rx.clone(),
        )));
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers and monitors to stop (with timeout). The SSH child
    // is killed when the tunnel supervisor drops (kill_on_drop).
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in proxy_handles {
            let _ = handle.await;
        }
        let _ = lifecycle_handle.await;
        let _ = tunnel_handle.await;
        for handle in monitor_handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting pod gateway");
    info!(
        bind = %config.web.bind,
        apps = ?config.web.apps.iter().map(|a| &a.name).collect::<Vec<_>>(),
        "Configured applications"
    );
    info!(
        pod = %config.control_plane.pod_name,
        api_base = %config.control_plane.api_base,
        check_pod_interval_secs = config.web.check_pod_interval_secs,
        startup_wait_secs = config.web.startup_wait_secs,
        "Control plane settings"
    );
    info!(
        web_timeout_secs = config.web.shutdown_timeout_secs,
        cpu_util_threshold = config.ssh.cpu_util_threshold,
        gpu_util_threshold = config.ssh.gpu_util_threshold,
        cpu_gpu_timeout_secs = config.ssh.shutdown_timeout_secs,
        "Idle detection settings"
    );
}
