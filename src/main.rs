use clap::Parser;
use hibergate::backend::Backend;
use hibergate::cloud::docker::DockerClient;
use hibergate::cloud::gcp::GcpClient;
use hibergate::cloud::{CloudStatus, Provider};
use hibergate::config::Config;
use hibergate::proxy::Proxy;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Minecraft-aware reverse proxy that hibernates idle backend servers.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file. The CONFIG environment
    /// variable, when set and non-empty, takes precedence over this file.
    #[arg(long, value_name = "PATH", default_value = "./config/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hibergate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).map_err(|e| {
        error!(path = %args.config.display(), error = %e, "failed to load configuration");
        e
    })?;
    info!(
        path = %args.config.display(),
        listen = %config.listen_address,
        servers = config.servers.len(),
        "configuration loaded"
    );

    // Docker servers share one daemon connection.
    let mut docker: Option<Arc<DockerClient>> = None;

    let mut backends = Vec::with_capacity(config.servers.len());
    for server in &config.servers {
        let (provider, instance_id): (Arc<dyn Provider>, String) = if let Some(gcp) = &server.gcp {
            info!(
                server = %server.hostname,
                project = %gcp.project,
                zone = %gcp.zone,
                instance = %gcp.instance_id,
                "using gcp provider"
            );
            let client: Arc<dyn Provider> = Arc::new(GcpClient::new(&gcp.project, &gcp.zone)?);
            (client, gcp.instance_id.clone())
        } else if let Some(container) = &server.docker {
            info!(
                server = %server.hostname,
                container = %container.container_id,
                "using docker provider"
            );
            let client = match &docker {
                Some(client) => Arc::clone(client),
                None => {
                    let client = Arc::new(DockerClient::new().await?);
                    docker = Some(Arc::clone(&client));
                    client
                }
            };
            (client as Arc<dyn Provider>, container.container_id.clone())
        } else {
            anyhow::bail!("server {:?} has no cloud provider", server.hostname);
        };

        backends.push(Backend::new(server.clone(), provider, instance_id)?);
    }

    // Prime each backend's status caches so the first status ping after
    // startup already has a version string to show. Failures are fine; the
    // caches fill opportunistically later.
    for backend in &backends {
        let backend = Arc::clone(backend);
        tokio::spawn(async move {
            match backend.cloud_status().await {
                Ok(CloudStatus::Running) => {
                    if let Err(e) = backend.minecraft_status().await {
                        warn!(server = backend.hostname(), error = %e, "initial status probe failed");
                    }
                }
                Ok(status) => {
                    info!(server = backend.hostname(), %status, "server status");
                }
                Err(e) => {
                    warn!(server = backend.hostname(), error = %e, "failed to get initial server status");
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = Proxy::bind(&config.listen_address, backends, shutdown_rx).await?;
    let mut proxy_task = tokio::spawn(proxy.run());

    tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            proxy_task.await??;
        }
        result = &mut proxy_task => {
            result??;
            warn!("proxy exited before shutdown signal");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("received ctrl-c, shutting down");
    }
}
