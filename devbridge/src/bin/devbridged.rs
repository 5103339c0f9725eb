//! devbridged: hosts the device bridge and speaks its protocol as
//! newline-delimited JSON on stdin and stdout.
//!
//! Each stdin line is posted on the message channel; every response seen on
//! the channel is written to stdout as one line. Logs go to journald or
//! stderr.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use devbridge::enumerate::SystemEnumerator;
use devbridge::stdio;
use devbridge::tracing::{self, prelude::*};
use devbridge::{Config, ConnectionManager, DriverRegistry, MessageChannel, StatusEvent};

async fn log_status(events: impl futures::Stream<Item = StatusEvent>, running: CancellationToken) {
    tokio::pin!(events);
    loop {
        let event = tokio::select! {
            _ = running.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else { break };
        match &event.error_message {
            Some(message) => warn!(
                device = %event.device_id,
                status = %event.status,
                error = %message,
                "Device status"
            ),
            None => info!(device = %event.device_id, status = %event.status, "Device status"),
        }
    }
}

/// Grace period for blocking tasks at exit. The stdin reader cannot be
/// cancelled and would otherwise hold the runtime open.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stderr();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run());
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    let registry = Arc::new(DriverRegistry::with_default_drivers(&config));
    let enumerator = Arc::new(SystemEnumerator::new(&config));
    let manager = Arc::new(
        ConnectionManager::new(registry, enumerator).with_io_timeout(config.io.timeout()),
    );
    let channel = MessageChannel::new(config.channel.name.clone());

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(log_status(manager.status_events(), running.clone()));
    tracker.close();
    info!(
        channel = %channel.name(),
        drivers = ?manager.registry().drivers(),
        "Started."
    );

    let shutdown = CancellationToken::new();
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => debug!("SIGINT received"),
            _ = sigterm.recv() => debug!("SIGTERM received"),
        }
        on_signal.cancel();
    });

    stdio::serve(
        manager,
        channel,
        config.serial.default_baud_rate,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown,
    )
    .await;

    trace!("Shutting down.");
    running.cancel();
    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
