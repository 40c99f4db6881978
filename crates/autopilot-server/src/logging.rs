use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use autopilot_core::types::PipelineEvent;
use tokio::sync::broadcast;

pub(crate) const LOG_RING_CAPACITY: usize = 500;

pub(crate) type LogRing = Arc<Mutex<VecDeque<String>>>;

/// Mirrors tracing events as JSON lines into a bounded ring and a broadcast
/// channel feeding `GET /api/logs`.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: LogRing,
}

/// Append one line to the ring and fan it out to live subscribers.
pub(crate) fn publish(tx: &broadcast::Sender<String>, ring: &LogRing, line: String) {
    let _ = tx.send(line.clone());
    let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
    ring.push_back(line);
    while ring.len() > LOG_RING_CAPACITY {
        ring.pop_front();
    }
}

struct MessageVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.into());
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let mut rendered = format!("{value:?}");
        // Debug on &str adds quotes
        if rendered.len() >= 2 && rendered.starts_with('"') && rendered.ends_with('"') {
            rendered = rendered[1..rendered.len() - 1].to_string();
        }
        if field.name() == "message" {
            *self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), rendered.into());
        }
    }
}

fn category(target: &str) -> &'static str {
    if target.contains("pipeline") || target.ends_with("::ci") || target.contains("poller") {
        "pipeline"
    } else if target.contains("agent") {
        "agent"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        let mut fields = serde_json::Map::new();
        event.record(&mut MessageVisitor {
            message: &mut message,
            fields: &mut fields,
        });

        let json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "message": message,
            "category": category(event.metadata().target()),
            "fields": fields,
        })
        .to_string();

        publish(&self.tx, &self.ring, json);
    }
}

/// Relay pipeline events into the log stream until every sender is gone.
pub(crate) async fn forward_pipeline_events(
    mut rx: broadcast::Receiver<PipelineEvent>,
    tx: broadcast::Sender<String>,
    ring: LogRing,
) {
    loop {
        match rx.recv().await {
            Ok(evt) => {
                let data = serde_json::json!({
                    "ts": chrono::Utc::now().timestamp(),
                    "level": "info",
                    "category": "pipeline",
                    "type": evt.kind(),
                    "run_id": evt.run_id(),
                    "message": evt.message(),
                })
                .to_string();
                publish(&tx, &ring, data);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}
