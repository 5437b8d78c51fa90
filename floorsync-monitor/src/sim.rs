//! Simulated production-line telemetry for `serve`.

use floorsync_link::PushServer;
use floorsync_store::Fields;
use serde_json::json;
use std::time::Duration;

pub const LINES: [&str; 4] = ["line-1", "line-2", "line-3", "press-1"];

/// Fields the simulated plant owns; clients may not write them.
pub const READ_ONLY_FIELDS: [&str; 3] = ["serial", "temp", "throughput"];

fn initial_state(index: usize) -> Fields {
    let mut fields = Fields::new();
    fields.insert("serial".into(), json!(format!("FS-{:04}", 1000 + index)));
    fields.insert("mode".into(), json!("auto"));
    fields.insert("speed".into(), json!(10 + index as u64 * 2));
    fields.insert("temp".into(), json!(38.0));
    fields.insert("throughput".into(), json!(0));
    fields
}

/// Sensor readings for one tick. Deterministic so runs are reproducible.
fn reading(index: usize, tick: u64) -> Fields {
    let phase = (tick + index as u64 * 7) % 20;
    let mut fields = Fields::new();
    fields.insert("temp".into(), json!(38.0 + phase as f64 * 0.25));
    fields.insert("throughput".into(), json!(tick * (3 + index as u64)));
    fields
}

/// Seed every line, then publish readings every `period` until the task is
/// dropped.
pub async fn run(server: PushServer, period: Duration) {
    for (i, line) in LINES.iter().enumerate() {
        if let Err(e) = server.publish(line, initial_state(i)).await {
            log::error!("Seeding {line} failed: {e}");
        }
    }
    log::info!("Seeded {} entities", LINES.len());

    let mut ticker = tokio::time::interval(period);
    let mut tick = 0u64;
    loop {
        ticker.tick().await;
        tick += 1;
        // One line per tick keeps the feed interleaved.
        let index = (tick as usize) % LINES.len();
        if let Err(e) = server.publish(LINES[index], reading(index, tick)).await {
            log::error!("Publishing {} failed: {e}", LINES[index]);
        }
        if tick % 50 == 0 {
            let stats = server.stats().await;
            log::info!(
                "{} clients, {} pushes, {} accepted / {} rejected mutations",
                stats.active_connections,
                stats.pushes_published,
                stats.mutations_accepted,
                stats.mutations_rejected
            );
        }
    }
}
