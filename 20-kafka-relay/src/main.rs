use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kafka_relay::{
    cli::Cli,
    dispatch::DispatchQueue,
    http::{self, AppState},
    hub,
    producer::{BrokerCell, kafka::KafkaFactory},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let brokers = cli.broker_list();
    anyhow::ensure!(!brokers.is_empty(), "KAFKA_BROKERS is not set");

    let cell = BrokerCell::new();
    let producer = tokio::task::block_in_place(|| {
        cell.initialize(&brokers, cli.producer_config(), &KafkaFactory)
    })
    .context("failed to connect to Kafka")?;

    let shutdown = CancellationToken::new();
    let queue = Arc::new(DispatchQueue::start(
        Arc::clone(&producer),
        cli.dispatch_config(),
    ));

    let (hub, hub_task) = if cli.enable_websocket {
        let (hub, handle) = hub::channel(Arc::clone(&producer), cli.hub_config());
        (Some(handle), Some(tokio::spawn(hub.run(shutdown.clone()))))
    } else {
        (None, None)
    };

    let app = http::router(AppState {
        queue: Arc::clone(&queue),
        hub,
        mailbox_capacity: cli.mailbox_capacity,
    })
    .layer(http::cors_layer(&cli.client_origin)?);

    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    info!("kafka relay listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutting down server ...");
            // Stream clients only disconnect once the hub lets go of them.
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = hub_task {
        if let Err(err) = task.await {
            warn!("hub task failed: {err:?}");
        }
    }
    queue.shutdown().await;

    tokio::task::spawn_blocking(move || producer.close())
        .await?
        .context("failed to close Kafka producer")?;

    info!("server exiting");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
