//! Alert sweeper.
//!
//! Connects to `PostgreSQL`, runs the periodic overdue/condition sweep, and
//! optionally follows the live alert feed to log high-priority alerts as they
//! appear. Stops on Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use toolcrib::alerts::{AlertGenerator, AlertPolicy};
use toolcrib::channel::PgAlertChannel;
use toolcrib::feed::AlertFeed;
use toolcrib::persistence::postgres::{self, PgStore};
use toolcrib::sweep::Sweeper;
use toolcrib::{Alert, Config};
use toolcrib_core::environment::SystemClock;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting toolcrib sweeper");

    if config.metrics.enabled {
        toolcrib::metrics::install_exporter(&config.metrics)
            .context("installing metrics exporter")?;
    }

    let pool = postgres::connect(&config.postgres)
        .await
        .context("connecting to PostgreSQL")?;
    if config.postgres.run_migrations {
        postgres::migrate(&pool).await.context("running migrations")?;
        info!("Migrations applied");
    }

    let store = Arc::new(PgStore::new(pool.clone()));
    let clock = Arc::new(SystemClock);
    let generator = AlertGenerator::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        AlertPolicy {
            high_priority_after_days: config.sweep.high_priority_after_days,
        },
    );
    let sweeper = Sweeper::new(store.clone(), generator, clock, &config.sweep);

    let feed = config.feed.enabled.then(|| {
        AlertFeed::connect(
            store.clone(),
            Arc::new(PgAlertChannel::new(pool.clone())),
            &config.feed,
        )
    });
    let notifier = feed
        .as_ref()
        .map(|feed| tokio::spawn(log_notifications(feed.notifications())));

    let (stop, stopped) = watch::channel(false);
    let sweep = tokio::spawn(async move { sweeper.run(stopped).await });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutdown requested");

    let _ = stop.send(true);
    if let Err(err) = sweep.await {
        warn!(error = %err, "Sweep task ended abnormally");
    }
    if let Some(feed) = feed {
        if let Err(err) = feed.shutdown(SHUTDOWN_TIMEOUT).await {
            warn!(error = %err, "Alert feed did not stop cleanly");
        }
    }
    if let Some(notifier) = notifier {
        notifier.abort();
    }
    pool.close().await;

    info!("Sweeper stopped");
    Ok(())
}

async fn log_notifications(mut notifications: broadcast::Receiver<Alert>) {
    loop {
        match notifications.recv().await {
            Ok(alert) => warn!(
                alert_id = %alert.id,
                tool_id = %alert.tool_id,
                reason = %alert.reason,
                "High-priority alert"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed high-priority notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
