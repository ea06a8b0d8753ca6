use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use reservd::clock::{Clock, SystemClock};
use reservd::config::Config;
use reservd::engine::Engine;
use reservd::registry::{self, CachedRegistry, Catalog, MemoryRegistry, Ports, RemoteRegistry};
use reservd::{compactor, wire};

/// Registry ports per config: remote (optionally cached) or in-process.
async fn build_ports(config: &Config) -> Result<Ports, Box<dyn Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let Some(addr) = &config.registry_addr else {
        let catalog: Catalog = match &config.registry_seed {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => Catalog::default(),
        };
        info!(
            persons = catalog.persons.len(),
            rooms = catalog.rooms.len(),
            articles = catalog.articles.len(),
            "using in-process registry"
        );
        let local = Arc::new(MemoryRegistry::from_catalog(catalog));
        if let Some(listen) = &config.registry_listen {
            let listener = TcpListener::bind(listen).await?;
            info!("registry listening on {listen}");
            tokio::spawn(registry::remote::serve(listener, local.clone()));
        }
        return Ok(Ports::shared(local, clock));
    };

    let remote = RemoteRegistry::new(addr.clone(), config.registry_timeout);
    info!("using remote registry at {addr} (timeout {:?})", config.registry_timeout);
    if config.registry_cache_ttl.is_zero() {
        Ok(Ports::shared(Arc::new(remote), clock))
    } else {
        info!("registry cache ttl {:?}", config.registry_cache_ttl);
        Ok(Ports::shared(
            Arc::new(CachedRegistry::new(remote, config.registry_cache_ttl)),
            clock,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    reservd::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let ports = build_ports(&config).await?;
    let engine = Arc::new(Engine::new(config.wal_path(), ports, config.admission())?);
    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));

    let retry = config.retry_policy();
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("reservd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  grace: {} min", config.grace_minutes);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(reservd::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(reservd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(reservd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, retry).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(reservd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("reservd stopped");
    Ok(())
}
