mod main_runtime;

use clap::Parser;
use ibconnect::cli::{self, Cli, Commands};
use ibconnect::config::AppConfig;
use ibconnect::coordination::{
    install_signal_handlers, ClusterMembership, LockManager, Shutdown,
};
use ibconnect::error::Result;
use ibconnect::pubsub::PubSubBus;
use ibconnect::{Node, PostgresStore};
use main_runtime::{init_logging, init_logging_simple, LoggingController};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }

    match cli.command {
        Commands::Run { node_id } => {
            init_logging(&config.logging);
            if node_id.is_some() {
                config.node.id = node_id;
            }
            run_node(config).await?;
        }
        Commands::Migrate => {
            init_logging_simple();
            let store = PostgresStore::new(&config.database).await?;
            store.migrate().await?;
            println!("\x1b[32m✓\x1b[0m migrations applied");
        }
        Commands::Publish { channel, payload } => {
            init_logging_simple();
            let bus = connect_bus(&config).await?;
            cli::publish(&bus, &channel, &payload).await?;
        }
        Commands::Notify { kind, id } => {
            init_logging_simple();
            let bus = connect_bus(&config).await?;
            cli::notify(&bus, &kind, id).await?;
        }
        Commands::Tail {
            channel,
            subscriber,
            from,
        } => {
            init_logging_simple();
            let store = Arc::new(PostgresStore::new(&config.database).await?);
            let shutdown = Arc::new(Shutdown::new());
            install_signal_handlers(shutdown.clone())?;
            let listener = store.start_change_listener(shutdown.token()).await?;

            let bus = PubSubBus::new(store, config.pubsub.clone(), config.retry.policy());
            cli::tail(&bus, &channel, subscriber.as_deref(), from, shutdown.token()).await?;
            listener.abort();
        }
        Commands::Nodes { json } => {
            init_logging_simple();
            let store = Arc::new(PostgresStore::new(&config.database).await?);
            let membership = ClusterMembership::new(
                store,
                "cli",
                config.election.lock_name.clone(),
                config.membership.clone(),
                config.retry.policy(),
            );
            cli::show_nodes(&membership, json).await?;
        }
        Commands::Lock { name } => {
            init_logging_simple();
            let store = Arc::new(PostgresStore::new(&config.database).await?);
            let locks = LockManager::new(store, config.retry.policy());
            cli::show_lock(&locks, &name).await?;
        }
        Commands::Prune => {
            init_logging_simple();
            let bus = connect_bus(&config).await?;
            cli::prune(&bus).await?;
        }
    }

    Ok(())
}

async fn connect_bus(config: &AppConfig) -> Result<PubSubBus> {
    let store = Arc::new(PostgresStore::new(&config.database).await?);
    Ok(PubSubBus::new(
        store,
        config.pubsub.clone(),
        config.retry.policy(),
    ))
}

async fn run_node(config: AppConfig) -> Result<()> {
    let shutdown = Arc::new(Shutdown::new());
    install_signal_handlers(shutdown.clone())?;

    let store = Arc::new(PostgresStore::new(&config.database).await?);
    let listen = config.database.listen_notifications;
    let node = Node::start(store.clone(), config, Arc::new(LoggingController)).await?;

    let listener = if listen {
        match store.start_change_listener(node.shutdown_token()).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "change notifications unavailable, polling only");
                None
            }
        }
    } else {
        None
    };

    info!(node_id = %node.node_id(), "node running, waiting for shutdown signal");
    shutdown.token().cancelled().await;

    node.shutdown().await;
    if let Some(listener) = listener {
        let _ = listener.await;
    }
    Ok(())
}
