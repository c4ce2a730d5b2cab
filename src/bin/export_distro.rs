//! export-distro: export distribution service
//!
//! Subscribes to device events on the message bus and delivers them to
//! every registered destination.
//!
//! ## Architecture
//! ```text
//! [Event Bus] -> [Dispatcher] -> [Worker r1] -> filter -> format -> ... -> [Sink]
//!                     ^      \-> [Worker r2] -> ...
//!                     |
//!      [POST /api/v1/notify/registrations]
//! ```
//!
//! ## Configuration
//! - EXPORT_CONFIG: Path to a YAML configuration file
//! - EXPORT__<SECTION>__<KEY>: Override any configuration value
//! - EXPORT_LOG: Tracing filter (default "info")

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use export_distro::bus::TcpSubscriber;
use export_distro::clients::CoreDataClient;
use export_distro::config::{Config, LogFormat};
use export_distro::dispatch::{DispatchError, Dispatcher, FatalError};
use export_distro::notify;
use export_distro::repository::{
    HttpRegistrationRepository, InMemoryRegistrations, RegistrationRepository,
};
use export_distro::sender::DestinationSenders;
use export_distro::utils::bootstrap::init_tracing;
use export_distro::worker::WorkerContext;

/// Inbound event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 1;
/// Change notification channel capacity.
const NOTIFY_CHANNEL_CAPACITY: usize = 2;

/// Ctrl-C, routed through the fatal channel for an orderly shutdown.
#[derive(Debug, thiserror::Error)]
#[error("interrupted")]
struct Interrupted;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    init_tracing(config.logging.format == LogFormat::Json);

    let repository: Arc<dyn RegistrationRepository> = match &config.registrations.url {
        Some(url) => {
            info!(url = %url, "Reading registrations from registration service");
            Arc::new(HttpRegistrationRepository::new(
                url.clone(),
                config.registrations.timeout(),
            )?)
        }
        None => {
            let seeded = config.registrations.load_file()?;
            info!(count = seeded.len(), "Using configured registrations");
            Arc::new(InMemoryRegistrations::with_registrations(seeded))
        }
    };

    let mut ctx = WorkerContext::new(
        config.keys.decrypter()?,
        Arc::new(DestinationSenders::new(config.sender.clone())),
    )
    .with_event_buffer(config.worker.event_buffer);
    if config.core_data.mark_pushed {
        ctx = ctx.with_pusher(Arc::new(CoreDataClient::new(
            config.core_data.url.clone(),
            config.core_data.timeout(),
        )?));
    }

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
    let (fatal_tx, fatal_rx) = mpsc::channel::<FatalError>(1);

    tokio::spawn(TcpSubscriber::new(&config.bus).run(events_tx));

    let listener_fatal = fatal_tx.clone();
    let host = config.service.host.clone();
    let port = config.service.port;
    tokio::spawn(async move {
        let reason: FatalError = match notify::serve(&host, port, notify_tx).await {
            Ok(()) => "notification listener stopped".into(),
            Err(e) => e,
        };
        let _ = listener_fatal.send(reason).await;
    });

    tokio::spawn(async move {
        let reason: FatalError = match tokio::signal::ctrl_c().await {
            Ok(()) => Box::new(Interrupted),
            Err(e) => Box::new(e),
        };
        let _ = fatal_tx.send(reason).await;
    });

    let dispatcher = Dispatcher::new(repository, ctx, config.registrations.retry_interval());
    match dispatcher.run(events_rx, notify_rx, fatal_rx).await {
        Ok(()) => info!("Export distribution stopped"),
        Err(DispatchError::Fatal(reason)) if reason.is::<Interrupted>() => {
            info!("Export distribution stopped on interrupt")
        }
        Err(e) => {
            error!(error = %e, "Export distribution stopped");
            return Err(e.into());
        }
    }
    Ok(())
}
