use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotbook::cache::{CacheLayer, Cacheable, DurableTier, FileTier, keys};
use slotbook::config::Config;
use slotbook::engine::{AuditLog, BookingEngine};
use slotbook::limits::OUTBOX_CAPACITY;
use slotbook::notify::{LogNotifier, Outbox};
use slotbook::store::WalStore;
use slotbook::{observability, reaper, wire};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

fn durable_layer<V: Cacheable>(config: &Config, name: &'static str, capacity: u64) -> std::io::Result<CacheLayer<V>> {
    let tier: Box<dyn DurableTier> = Box::new(FileTier::open(&config.data_dir.join(format!("{name}.cache")), capacity)?);
    Ok(CacheLayer::new(name, Some(tier)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    let tls_acceptor = slotbook::tls::acceptor_for(&config)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(WalStore::open(&config.data_dir.join("store.wal"))?);

    let (lessons, slots) = if config.cache.durable {
        // the byte budget is split evenly between the two caches
        let capacity = config.cache.durable_capacity_bytes / 2;
        (
            durable_layer(&config, keys::LESSONS, capacity)?,
            durable_layer(&config, keys::SLOTS, capacity)?,
        )
    } else {
        (CacheLayer::in_memory(keys::LESSONS), CacheLayer::in_memory(keys::SLOTS))
    };

    let mut engine = BookingEngine::new(store.clone(), config.engine.clone())
        .with_caches(lessons, slots)
        .with_audit(AuditLog::open(&config.data_dir.join("overrides.jsonl"))?);
    if config.notify_enabled {
        let (outbox, _worker) = Outbox::spawn(Arc::new(LogNotifier), OUTBOX_CAPACITY);
        engine = engine.with_outbox(outbox);
    }
    let engine = Arc::new(engine);

    tokio::spawn(reaper::run_cache_sweeper(
        engine.clone(),
        config.cache.sweep_interval,
        config.cache.max_stale,
    ));
    tokio::spawn(reaper::run_compactor(
        store.clone(),
        COMPACT_CHECK_INTERVAL,
        config.compact_threshold,
    ));

    let factory = wire::SlotbookFactory::new(engine, config.password.clone());
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  durable cache: {}", if config.cache.durable { "enabled" } else { "disabled" });
    info!("  notifications: {}", if config.notify_enabled { "enabled" } else { "disabled" });

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
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
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
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
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    if let Err(e) = store.compact().await {
        tracing::warn!("final WAL compaction failed: {e}");
    }
    info!("slotbook stopped");
    Ok(())
}
