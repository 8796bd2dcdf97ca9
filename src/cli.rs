use clap::{Parser, Subcommand};

use crate::coordination::{ClusterMembership, LockManager, ShutdownToken};
use crate::domain::{Message, Notification, NotificationKind, SequenceId};
use crate::error::{IbcError, Result};
use crate::pubsub::PubSubBus;

#[derive(Parser)]
#[command(name = "ibconnect")]
#[command(version)]
#[command(about = "Database-backed locks, leader election and pub-sub for gateway nodes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,

    /// Database URL, overrides the configured one
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a coordination node until SIGINT/SIGTERM
    Run {
        /// Node identifier (defaults to hostname plus a random suffix)
        #[arg(long)]
        node_id: Option<String>,
    },
    /// Apply database migrations
    Migrate,
    /// Publish a message on a channel
    Publish {
        channel: String,
        payload: String,
    },
    /// Publish a typed notification (refreshall, accountrefresh, accountfeeddone)
    Notify {
        kind: String,
        #[arg(default_value = "0")]
        id: i64,
    },
    /// Print messages on a channel as they arrive
    Tail {
        channel: String,
        /// Persist progress under this subscriber id
        #[arg(long)]
        subscriber: Option<String>,
        /// Start after this sequence id when the subscriber is new
        #[arg(long, default_value = "0")]
        from: SequenceId,
    },
    /// List cluster nodes and their liveness
    Nodes {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the state of a lock
    Lock {
        #[arg(default_value = "gateway-leader")]
        name: String,
    },
    /// Run one retention pass over every channel
    Prune,
}

pub async fn publish(bus: &PubSubBus, channel: &str, payload: &str) -> Result<()> {
    let seq = bus.publish(channel, payload.as_bytes()).await?;
    println!("\x1b[32m✓\x1b[0m published {}#{}", channel, seq);
    Ok(())
}

pub async fn notify(bus: &PubSubBus, kind: &str, id: i64) -> Result<()> {
    let kind: NotificationKind = kind.parse()?;
    let seq = bus.publish_notification(&Notification::new(kind, id)).await?;
    println!("\x1b[32m✓\x1b[0m notified {} id={} ({}#{})", kind, id, kind.channel(), seq);
    Ok(())
}

/// Follow `channel` until shutdown. Without a subscriber id a throwaway one is
/// used and removed on exit.
pub async fn tail(
    bus: &PubSubBus,
    channel: &str,
    subscriber: Option<&str>,
    from: SequenceId,
    shutdown: ShutdownToken,
) -> Result<()> {
    let ephemeral = subscriber.is_none();
    let subscriber_id = match subscriber {
        Some(id) => id.to_string(),
        None => format!("tail-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
    };

    let mut subscription = bus.subscribe(channel, &subscriber_id, from).await?;
    println!(
        "Tailing {} as {} from #{} (Ctrl+C to stop)\n",
        channel,
        subscriber_id,
        subscription.position()
    );

    let outcome = async {
        while let Some(message) = subscription.next(&shutdown).await? {
            print_message(&message);
            if !ephemeral {
                subscription.ack(message.sequence_id).await?;
            }
        }
        Ok::<_, IbcError>(())
    }
    .await;

    if ephemeral {
        bus.unsubscribe(channel, &subscriber_id).await?;
    }
    outcome
}

fn print_message(message: &Message) {
    let body = match message.payload_str() {
        Some(text) => text.to_string(),
        None => format!("<{} bytes>", message.payload.len()),
    };
    println!(
        "  #{:<6} {}  {}",
        message.sequence_id,
        message.published_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        body
    );
}

pub async fn show_nodes(membership: &ClusterMembership, json: bool) -> Result<()> {
    let nodes = membership.list_nodes().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    if nodes.is_empty() {
        println!("  No nodes registered.");
        return Ok(());
    }

    println!("  {:<32} {:<16} {:<8} {:>12}", "NODE", "ROLE", "ALIVE", "HEARTBEAT");
    for status in &nodes {
        let alive = if status.alive {
            "\x1b[32myes\x1b[0m"
        } else {
            "\x1b[31mno\x1b[0m "
        };
        println!(
            "  {:<32} {:<16} {:<8} {:>10}ms",
            status.node.node_id,
            status.node.role.as_str(),
            alive,
            status.heartbeat_age_ms
        );
    }
    Ok(())
}

pub async fn show_lock(locks: &LockManager, name: &str) -> Result<()> {
    match locks.inspect(name).await? {
        None => println!("  Lock {} has never been acquired.", name),
        Some(record) => {
            println!("  Lock:          {}", record.name);
            println!("  Fencing token: {}", record.fencing_token);
            match (&record.holder_id, record.expires_at) {
                (Some(holder), Some(expires_at)) => {
                    println!("  Holder:        {}", holder);
                    println!("  Expires at:    {}", expires_at);
                }
                _ => println!("  Holder:        (released)"),
            }
        }
    }
    Ok(())
}

pub async fn prune(bus: &PubSubBus) -> Result<()> {
    let report = bus.prune().await?;
    if report.is_empty() {
        println!("  Nothing to prune.");
    }
    for (channel, deleted) in &report {
        println!("  {:<32} {} deleted", channel, deleted);
    }
    Ok(())
}
