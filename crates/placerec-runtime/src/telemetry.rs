//! Tracing pipeline initialisation for placerec.
//!
//! Call [`init_tracing`] once at process startup. Every detector cycle runs
//! inside a `cycle` span carrying `cycle`, `signature`, `loop_closure` and
//! `reactivated`, so console lines and exported spans can be tied back to
//! the snapshot that produced them.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). When set, cycle spans are exported over OTLP/HTTP. |
//! | `RUST_LOG` | Log filter; falls back to the `default_level` argument. |
//! | `PLACEREC_LOG_FORMAT=json` | Emit newline-delimited JSON logs with the current cycle span. |
//!
//! # Exit level
//!
//! With an exit level the subscriber also carries an [`ExitTrigger`]: the
//! first event at or above that level trips it, and the run controller
//! stops after the current cycle.
//!
//! ```rust,no_run
//! use tracing::Level;
//!
//! // Hold the guard for the entire lifetime of the process.
//! let telemetry = placerec_runtime::telemetry::init_tracing("placerec", "info", Some(Level::ERROR));
//! if let Some(reason) = telemetry.exit_trigger().and_then(|t| t.tripped()) {
//!     eprintln!("aborting: {reason}");
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Initialise the global `tracing` subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset. With `exit_level`, the
/// filter is widened so that events at that level always reach the
/// [`ExitTrigger`].
///
/// The returned [`TelemetryGuard`] **must** be held for the lifetime of the
/// process; dropping it flushes pending spans.
pub fn init_tracing(
    service_name: &str,
    default_level: &str,
    exit_level: Option<Level>,
) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let env_filter = widen_for_exit(env_filter, exit_level);
    let use_json = std::env::var("PLACEREC_LOG_FORMAT").as_deref() == Ok("json");

    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("placerec")));
    let exit = exit_level.map(ExitTrigger::new);

    let (json_layer, compact_layer) = if use_json {
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false);
        (Some(json), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().compact()))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(exit.clone())
        .with(otel_layer)
        .with(json_layer)
        .with(compact_layer)
        .init();

    TelemetryGuard { provider, exit }
}

/// Raise the filter's ceiling to `exit_level` when it is more verbose than
/// anything the filter lets through.
fn widen_for_exit(filter: EnvFilter, exit_level: Option<Level>) -> EnvFilter {
    let Some(level) = exit_level else {
        return filter;
    };
    let wanted = LevelFilter::from_level(level);
    match filter.max_level_hint() {
        Some(hint) if hint < wanted => filter.add_directive(wanted.into()),
        _ => filter,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exit trigger
// ─────────────────────────────────────────────────────────────────────────────

/// Trips on the first event at or above its level and keeps that event's
/// rendering.
#[derive(Debug, Clone)]
pub struct ExitTrigger {
    level: Level,
    first: Arc<Mutex<Option<String>>>,
}

impl ExitTrigger {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            first: Arc::new(Mutex::new(None)),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// The first event that reached the exit level, if any.
    pub fn tripped(&self) -> Option<String> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<S: Subscriber> Layer<S> for ExitTrigger {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // `Level` orders ERROR lowest: "at or above" means `<=`.
        if *meta.level() > self.level {
            return;
        }
        let mut slot = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            let mut message = MessageText::default();
            event.record(&mut message);
            *slot = Some(format!("{} {}: {}", meta.level(), meta.target(), message.0));
        }
    }
}

#[derive(Default)]
struct MessageText(String);

impl Visit for MessageText {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        } else {
            if !self.0.is_empty() {
                self.0.push(' ');
            }
            self.0.push_str(&format!("{}={value:?}", field.name()));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII guard
// ─────────────────────────────────────────────────────────────────────────────

/// Shuts down the OTel [`SdkTracerProvider`] on drop and hands out the
/// [`ExitTrigger`], if one was requested.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
    exit: Option<ExitTrigger>,
}

impl TelemetryGuard {
    pub fn exit_trigger(&self) -> Option<ExitTrigger> {
        self.exit.clone()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[placerec] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Build an [`SdkTracerProvider`] when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// `None` when the variable is absent or the exporter fails to build; the
/// failure goes to stderr because no subscriber exists yet.
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[placerec] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // Cycles run on one thread with no async runtime for a batch
            // exporter.
            .with_simple_exporter(exporter)
            .build(),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::Registry;

    // ── exit trigger ─────────────────────────────────────────────────────────

    #[test]
    fn warn_trigger_trips_on_the_first_warning() {
        let trigger = ExitTrigger::new(Level::WARN);
        let subscriber = Registry::default().with(trigger.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(cycle = 1, "cycle complete");
            assert!(trigger.tripped().is_none());
            tracing::warn!(cycle = 2, "cycle over budget");
            tracing::error!("memory integrity violated");
        });
        let reason = trigger.tripped().expect("tripped");
        assert!(reason.starts_with("WARN"), "{reason}");
        assert!(reason.contains("cycle over budget"), "{reason}");
        assert!(reason.contains("cycle=2"), "{reason}");
    }

    #[test]
    fn error_trigger_ignores_warnings() {
        let trigger = ExitTrigger::new(Level::ERROR);
        let subscriber = Registry::default().with(trigger.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("store save failed");
        });
        assert!(trigger.tripped().is_none());
        assert_eq!(trigger.level(), Level::ERROR);
    }

    // ── filter ───────────────────────────────────────────────────────────────

    #[test]
    fn quiet_filter_is_widened_to_the_exit_level() {
        let widened = widen_for_exit(EnvFilter::new("error"), Some(Level::WARN));
        assert_eq!(widened.max_level_hint(), Some(LevelFilter::WARN));

        let kept = widen_for_exit(EnvFilter::new("debug"), Some(Level::WARN));
        assert_eq!(kept.max_level_hint(), Some(LevelFilter::DEBUG));

        let untouched = widen_for_exit(EnvFilter::new("error"), None);
        assert_eq!(untouched.max_level_hint(), Some(LevelFilter::ERROR));
    }

    // ── exporter ─────────────────────────────────────────────────────────────

    #[test]
    fn no_endpoint_means_no_exporter() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(build_provider("placerec-test").is_none());
    }

    #[test]
    fn guard_without_provider_drops_quietly() {
        let guard = TelemetryGuard {
            provider: None,
            exit: Some(ExitTrigger::new(Level::WARN)),
        };
        assert!(guard.exit_trigger().is_some());
        drop(guard);
    }
}
