//! floorsync-monitor: run a simulated line feed, or watch one through an
//! optimistic store.
//!
//! ```text
//! floorsync-monitor serve [bind_addr]
//! floorsync-monitor watch [server_url]
//! floorsync-monitor set <server_url> <entity> <field> <value>
//! ```
//!
//! Verbosity follows `RUST_LOG` (e.g. `RUST_LOG=info`).

mod sim;

use std::time::Duration;

use floorsync_link::{
    spawn_expiry_sweep, ClientConfig, ConnectionState, LinkClient, LinkEvent, PushServer,
    ServerConfig,
};
use floorsync_store::{Fields, MutationStatus, StoreConfig, StoreEvent, StoreHandle, ViewBatch};
use log::{info, warn};
use serde_json::Value;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const USAGE: &str = "usage: floorsync-monitor serve [bind_addr] | watch [server_url] \
                     | set <server_url> <entity> <field> <value>";

/// How often `watch` checks the connection on its own.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("serve") => serve(args.get(1).cloned()).await,
        Some("watch") => watch(args.get(1).cloned()).await,
        Some("set") if args.len() == 5 => set(&args[1], &args[2], &args[3], &args[4]).await,
        _ => {
            eprintln!("{USAGE}");
            Err("invalid arguments".into())
        }
    }
}

async fn serve(bind_addr: Option<String>) -> Result<(), BoxError> {
    let mut config = ServerConfig::default().with_read_only(sim::READ_ONLY_FIELDS);
    if let Some(addr) = bind_addr {
        config.bind_addr = addr;
    }
    let server = PushServer::new(config);
    let feed = tokio::spawn(sim::run(server.clone(), Duration::from_millis(200)));

    tokio::select! {
        result = server.run() => {
            feed.abort();
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            feed.abort();
            Ok(())
        }
    }
}

fn log_batch(batch: &ViewBatch) {
    for view in batch.updated.iter() {
        if view.has_pending_changes {
            info!(
                "{} {} {} (pending: {})",
                view.entity_id,
                view.server_version,
                Value::Object(view.data.clone()),
                view.pending_field_set.join(", ")
            );
        } else {
            let data = Value::Object(view.data.clone());
            info!("{} {} {data}", view.entity_id, view.server_version);
        }
    }
    for entity_id in batch.removed.iter() {
        info!("{entity_id} removed");
    }
}

async fn watch(server_url: Option<String>) -> Result<(), BoxError> {
    let config = server_url.map(ClientConfig::new).unwrap_or_default();
    let store = StoreHandle::new(StoreConfig::default());
    let mut sub = store.subscribe();
    let sweep = spawn_expiry_sweep(store.clone(), config.sweep_interval);

    let mut client = LinkClient::new(store.clone(), config);
    let mut events = client.take_event_rx().ok_or("event receiver already taken")?;
    connect_with_retry(&mut client).await;
    // Lifecycle events can be dropped when the channel is full, so the
    // connection state is polled too.
    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);

    loop {
        tokio::select! {
            event = sub.recv() => match event {
                Some(StoreEvent::ViewsChanged(batch)) => log_batch(&batch),
                Some(StoreEvent::MutationFailed(failure)) => warn!("{failure}"),
                None => break,
            },
            event = events.recv() => match event {
                Some(LinkEvent::Disconnected) => {
                    warn!("Lost connection, reconnecting");
                    connect_with_retry(&mut client).await;
                }
                Some(other) => log::debug!("Link event: {other:?}"),
                None => break,
            },
            _ = health.tick() => {
                if reconnect_if_down(&mut client).await {
                    warn!("Connection was down, reconnected");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    sweep.abort();
    let stats = store.stats();
    info!(
        "Applied {} updates, dropped {} stale and {} malformed",
        stats.updates_applied, stats.stale_updates_dropped, stats.malformed_dropped
    );
    Ok(())
}

/// Reconnect when the client reports itself disconnected. Returns whether a
/// reconnect happened.
async fn reconnect_if_down(client: &mut LinkClient) -> bool {
    if client.connection_state().await != ConnectionState::Disconnected {
        return false;
    }
    connect_with_retry(client).await;
    true
}

async fn connect_with_retry(client: &mut LinkClient) {
    let mut delay = Duration::from_millis(250);
    while client.connect().await.is_err() {
        warn!("Connect to {} failed, retrying in {delay:?}", client.config().server_url);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(5));
    }
}

/// Submit one edit and report how it resolved.
async fn set(server_url: &str, entity_id: &str, field: &str, raw: &str) -> Result<(), BoxError> {
    // Bare words are sent as strings.
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    let mut patch = Fields::new();
    patch.insert(field.to_string(), value);

    let store = StoreHandle::new(StoreConfig::default());
    let sweep = spawn_expiry_sweep(store.clone(), Duration::from_millis(100));
    let mut client = LinkClient::new(store.clone(), ClientConfig::new(server_url));
    let mut events = client.take_event_rx().ok_or("event receiver already taken")?;
    client.connect().await?;

    while let Some(event) = events.recv().await {
        if matches!(event, LinkEvent::SnapshotApplied { .. }) {
            break;
        }
    }

    let mut sub = store.subscribe();
    let tx_id = client.submit(entity_id, patch).await?;
    info!("Submitted {tx_id}");

    let outcome = loop {
        match store.mutation_status(tx_id) {
            Some(MutationStatus::Pending) | None => {}
            Some(status) => break status,
        }
        match sub.recv().await {
            Some(StoreEvent::MutationFailed(failure)) if failure.tx_id == tx_id => {
                warn!("{failure}")
            }
            Some(_) => {}
            None => return Err("store subscription closed".into()),
        }
    };
    sweep.abort();

    info!("{tx_id} {outcome:?}");
    if let Some(view) = store.view(entity_id) {
        info!("{} {} {}", view.entity_id, view.server_version, Value::Object(view.data));
    }
    Ok(())
}
