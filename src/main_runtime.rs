use async_trait::async_trait;
use ibconnect::config::LoggingConfig;
use ibconnect::coordination::{GatewayController, LeadershipLoss};
use ibconnect::domain::Lease;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Controller for nodes run from the command line. The gateway business logic
/// lives outside this crate, so leadership changes are only logged.
pub struct LoggingController;

#[async_trait]
impl GatewayController for LoggingController {
    async fn on_become_leader(&self, lease: &Lease) -> anyhow::Result<()> {
        info!(
            lock = %lease.name,
            token = %lease.fencing_token,
            expires_at = %lease.expires_at,
            "gateway leadership acquired"
        );
        Ok(())
    }

    async fn on_lose_leadership(&self, reason: LeadershipLoss) {
        warn!(reason = %reason, "gateway leadership ended");
    }
}

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},ibconnect=debug,sqlx=warn", config.level))
    });

    // `tracing_appender::rolling::daily` panics if it cannot create the
    // initial log file, so writability is checked first.
    let file_layer = config.dir.as_deref().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir, e
            );
            return None;
        }

        let test_path = std::path::Path::new(log_dir).join(".ibconnect_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(log_dir, "ibconnect.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Flushes on drop; the node runs until exit
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let (json_layer, text_layer) = if config.json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, config.dir.as_deref()) {
        eprintln!("Logging to: {}/ibconnect.log", dir);
    }
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
