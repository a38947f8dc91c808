//! Worker reading messages from the configured queue, splitting the
//! Crypt4GH header from the remainder of each uploaded file. The header
//! is stored in the database and the remainder is archived to the vault.
//!
//! It is possible to start several workers; each process holds its own
//! broker connection, channel pair, and database pool.

use lega_amqp::{Broker, BrokerSettings};
use lega_conf::Settings;
use lega_core::AppContext;
use lega_db::Db;
use lega_ingest::{Dispatcher, IngestWorker, Routing};
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(code) => code,
        Err(error) => {
            error!(
                alert = true,
                error_message = %error,
                "The worker could not start",
            );

            ExitCode::FAILURE
        }
    }
}

/// Wires the collaborators together and runs the consume loop until
/// shutdown or a fatal failure.
async fn run() -> Result<ExitCode, Box<dyn Error>> {
    // Startup: configuration is fatal when broken
    let settings = Settings::load()?;
    let routing = Routing::from_settings(&settings)?;
    let inbox_template = settings.get("inbox", "location")?;

    // Hand the OS shutdown signals over to the application context
    AppContext::auto_terminate().await;

    // Collaborators
    let vault = lega_vault::from_settings(&settings)?;
    let db = Db::connect(&settings).await?;
    let broker_settings = BrokerSettings::from_settings(&settings, "broker")?;
    let broker = Arc::new(Broker::new(broker_settings));

    let worker = IngestWorker::new(db.clone(), vault, Arc::clone(&broker), inbox_template);
    let dispatcher = Dispatcher::new(Arc::clone(&broker), routing);

    info!(
        queue = dispatcher.routing().queue.as_str(),
        broker = broker.identifier(),
        db = db.identifier(),
        "Starting the ingestion worker",
    );

    // The consume loop; in-flight work completes before this returns
    let queue = dispatcher.routing().queue.clone();
    let outcome = broker
        .consume(&queue, |delivery| {
            dispatcher.handle(delivery, |content, correlation_id| {
                worker.process(content, correlation_id)
            })
        })
        .await;

    // Teardown on every exit path
    broker.close().await;
    db.close().await;

    match outcome {
        Ok(()) => {
            info!("Worker stopped");

            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            error!(
                alert = true,
                ?error,
                error_message = %error,
                "Unhandled failure in the consume loop",
            );

            Ok(ExitCode::from(2))
        }
    }
}

/// Installs the log subscriber. The filter directive comes from
/// `LEGA_LOG` (or `RUST_LOG`), defaulting to `info`.
fn init_tracing() {
    let directive = std::env::var("LEGA_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_target(true)
        .init();
}
