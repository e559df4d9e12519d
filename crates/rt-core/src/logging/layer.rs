//! Tracing layer that writes one JSON object per event.
//!
//! Output goes to stderr so stdout stays reserved for command payloads.

use std::io::{self, Write};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::events::Level;

/// Correlation fields lifted from enclosing spans.
#[derive(Debug, Clone, Default)]
struct SpanContext {
    run_id: Option<String>,
    operation: Option<String>,
    stage: Option<String>,
}

const PROMOTED: [&str; 3] = ["run_id", "operation", "stage"];

#[derive(Default)]
struct JsonFieldVisitor {
    fields: Map<String, Value>,
    message: Option<String>,
}

impl JsonFieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for JsonFieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, Value::String(format!("{:?}", value)));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }
}

#[derive(Default)]
struct SpanContextVisitor {
    context: SpanContext,
}

impl SpanContextVisitor {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "run_id" => self.context.run_id = Some(value),
            "operation" => self.context.operation = Some(value),
            "stage" => self.context.stage = Some(value),
            _ => {}
        }
    }
}

impl Visit for SpanContextVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set(field.name(), format!("{:?}", value));
    }
}

/// JSONL tracing layer.
pub struct JsonlLayer<W = io::Stderr> {
    writer: Mutex<W>,
}

impl JsonlLayer<io::Stderr> {
    pub fn stderr() -> Self {
        JsonlLayer {
            writer: Mutex::new(io::stderr()),
        }
    }
}

impl<W: Write> JsonlLayer<W> {
    pub fn new(writer: W) -> Self {
        JsonlLayer {
            writer: Mutex::new(writer),
        }
    }
}

impl<S, W> Layer<S> for JsonlLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Write + 'static,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = SpanContextVisitor::default();
        attrs.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.context);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = JsonFieldVisitor::default();
        event.record(&mut visitor);

        // Event fields win over span fields; innermost span wins over outer.
        let mut span_ctx = SpanContext::default();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(inner) = span.extensions().get::<SpanContext>() {
                    if span_ctx.run_id.is_none() {
                        span_ctx.run_id.clone_from(&inner.run_id);
                    }
                    if span_ctx.operation.is_none() {
                        span_ctx.operation.clone_from(&inner.operation);
                    }
                    if span_ctx.stage.is_none() {
                        span_ctx.stage.clone_from(&inner.stage);
                    }
                }
            }
        }

        let level: Level = (*event.metadata().level()).into();
        let mut obj = Map::new();
        obj.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
        obj.insert("level".into(), serde_json::json!(level));
        obj.insert(
            "event".into(),
            Value::String(event.metadata().target().to_string()),
        );

        let span_values = [span_ctx.run_id, span_ctx.operation, span_ctx.stage];
        for (key, from_span) in PROMOTED.iter().zip(span_values) {
            let value = visitor
                .fields
                .remove(*key)
                .or_else(|| from_span.map(Value::String));
            if let Some(v) = value {
                obj.insert(key.to_string(), v);
            }
        }
        if let Some(msg) = visitor.message {
            obj.insert("message".into(), Value::String(msg));
        }
        if !visitor.fields.is_empty() {
            obj.insert("fields".into(), Value::Object(visitor.fields));
        }

        let line = serde_json::to_string(&Value::Object(obj)).unwrap_or_default();
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    struct BufWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for BufWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<Value> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let layer = JsonlLayer::new(BufWriter(buffer.clone()));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);
        let output = buffer.lock().unwrap();
        String::from_utf8_lossy(&output)
            .lines()
            .map(|l| serde_json::from_str(l).expect("valid json line"))
            .collect()
    }

    #[test]
    fn test_event_fields_are_written() {
        let lines = capture(|| {
            tracing::info!(target: "gate.blocked", count = 2, destructive = true, message = "blocked");
        });
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line["level"], "info");
        assert_eq!(line["event"], "gate.blocked");
        assert_eq!(line["message"], "blocked");
        assert_eq!(line["fields"]["count"], 2);
        assert_eq!(line["fields"]["destructive"], true);
        assert!(line["ts"].is_string());
    }

    #[test]
    fn test_span_context_is_inherited() {
        let lines = capture(|| {
            let span = tracing::info_span!("run", run_id = "rt-1", operation = "lock");
            let _enter = span.enter();
            tracing::warn!(target: "probe.started", stage = "probe", message = "probing");
        });
        let line = &lines[0];
        assert_eq!(line["run_id"], "rt-1");
        assert_eq!(line["operation"], "lock");
        assert_eq!(line["stage"], "probe");
        assert_eq!(line["level"], "warn");
        assert!(line.get("fields").is_none());
    }

    #[test]
    fn test_event_run_id_overrides_span() {
        let lines = capture(|| {
            let span = tracing::info_span!("run", run_id = "outer");
            let _enter = span.enter();
            tracing::error!(target: "internal_error", run_id = "inner", message = "boom");
        });
        assert_eq!(lines[0]["run_id"], "inner");
        assert_eq!(lines[0]["level"], "error");
    }
}
