//! The injected observability contract and the framework log bridge.
//!
//! Every component in this crate reports through one [`Observability`] value:
//! a leveled log function, a metric-timer factory and a correlation-context
//! constructor, all supplied by the integrating application. The contract is
//! constructed once at process start and threaded through every constructor;
//! nothing in the crate holds global mutable state.
//!
//! Logs emitted by the underlying `kube` machinery travel through `tracing`;
//! [`Observability::install_bridge`] routes them into the same log function,
//! tagged so they can be told apart from the library's own emissions.

use std::{
    sync::Arc,
    time::Instant,
};

use tracing::{field::Visit, Event, Metadata, Subscriber};
use tracing_subscriber::{
    layer::{Context as LayerContext, Layer, SubscriberExt},
    registry::LookupSpan,
};

/// Log levels understood by the contract.
///
/// Level filtering is the log function's responsibility; the library emits at
/// all levels unconditionally. `Info` carries one-line operation summaries,
/// `Trace` carries full resource payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Failures worth operator attention
    Error,
    /// Operation summaries
    Info,
    /// Internal progress detail
    Debug,
    /// Full payload detail
    Trace,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Error => "error",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// A cheap-clone correlation context.
///
/// Deriving a child context copies the accumulated attribute pairs; the
/// parent is never mutated. The correlation-context constructor supplied in
/// [`ObservabilityConfig`] typically appends a request or reconcile id here.
#[derive(Clone, Debug, Default)]
pub struct ObsContext {
    attrs: Arc<Vec<(String, String)>>,
}

impl ObsContext {
    /// An empty root context.
    pub fn root() -> Self {
        Self::default()
    }

    /// Derive a child context carrying one additional attribute pair.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut attrs = self.attrs.as_ref().clone();
        attrs.push((key.into(), value.into()));
        Self { attrs: Arc::new(attrs) }
    }

    /// The accumulated attribute pairs, oldest first.
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }
}

/// The leveled log function.
pub type LogFn = Arc<dyn Fn(&ObsContext, Level, &str, &[(&str, String)]) + Send + Sync>;

/// Stops the timer started by a [`MetricTimerFn`], recording the elapsed time
/// with the final label pairs.
pub type StopTimerFn = Box<dyn FnOnce(&[(&str, String)]) + Send>;

/// The metric-timer factory; the returned closure records on invocation.
pub type MetricTimerFn = Arc<dyn Fn(&ObsContext, &str) -> StopTimerFn + Send + Sync>;

/// The correlation-context constructor.
pub type CorrelateFn = Arc<dyn Fn(&ObsContext) -> ObsContext + Send + Sync>;

/// Configuration for the observability contract.
///
/// All four fields are mandatory; [`Observability::new`] panics if any is
/// unset. This mirrors the rest of the crate's treatment of integration
/// mistakes as fatal rather than recoverable.
#[derive(Clone, Default)]
pub struct ObservabilityConfig {
    /// The process-lifetime context that background work logs against
    pub background: Option<ObsContext>,
    /// The leveled log function
    pub log: Option<LogFn>,
    /// The metric-timer factory
    pub metric_timer: Option<MetricTimerFn>,
    /// The correlation-context constructor
    pub correlate: Option<CorrelateFn>,
}

impl ObservabilityConfig {
    /// A ready-made contract that renders through the `tracing` macros.
    ///
    /// Suitable for examples and tests. Do not combine with
    /// [`Observability::install_bridge`] expecting these lines back out of
    /// the bridge; the bridge ignores the crate's own targets to avoid
    /// feeding itself.
    pub fn tracing_default() -> Self {
        let log: LogFn = Arc::new(|ctx, level, msg, attrs| {
            let mut line = String::from(msg);
            for (k, v) in ctx.attrs().iter() {
                line.push_str(&format!(" {k}={v}"));
            }
            for (k, v) in attrs {
                line.push_str(&format!(" {k}={v}"));
            }
            match level {
                Level::Error => tracing::error!("{line}"),
                Level::Info => tracing::info!("{line}"),
                Level::Debug => tracing::debug!("{line}"),
                Level::Trace => tracing::trace!("{line}"),
            }
        });
        let metric_timer: MetricTimerFn = Arc::new(|_ctx, name| {
            let name = name.to_string();
            let started = Instant::now();
            Box::new(move |labels| {
                let elapsed = started.elapsed();
                tracing::debug!(metric = %name, ?elapsed, ?labels, "timer recorded");
            })
        });
        let correlate: CorrelateFn = Arc::new(|ctx| {
            let id = format!("{:016x}", rand_correlation_id());
            ctx.with("correlation_id", id)
        });
        Self {
            background: Some(ObsContext::root()),
            log: Some(log),
            metric_timer: Some(metric_timer),
            correlate: Some(correlate),
        }
    }
}

// Cheap non-cryptographic id; collisions only degrade log grouping.
fn rand_correlation_id() -> u64 {
    use std::hash::{BuildHasher, Hasher};
    let mut h = std::collections::hash_map::RandomState::new().build_hasher();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    h.write_u128(now.as_nanos());
    h.write_u32(std::process::id());
    h.finish()
}

/// The assembled observability contract.
///
/// Constructed once and passed by reference to every component; reads are
/// lock-free and the value is never mutated after construction.
#[derive(Clone)]
pub struct Observability {
    background: ObsContext,
    log: LogFn,
    metric_timer: MetricTimerFn,
    correlate: CorrelateFn,
}

impl Observability {
    /// Assemble the contract from its configuration.
    ///
    /// The supplied log function is wrapped so every call carries a fixed
    /// `("lib", "opkit")` attribute pair.
    ///
    /// # Panics
    ///
    /// Panics if any of the four configuration fields is unset. A missing
    /// field is a wiring error in the integrating application, not an
    /// environmental failure.
    pub fn new(cfg: ObservabilityConfig) -> Self {
        let background = cfg
            .background
            .expect("observability config requires a background context");
        let log = cfg.log.expect("observability config requires a log function");
        let metric_timer = cfg
            .metric_timer
            .expect("observability config requires a metric-timer factory");
        let correlate = cfg
            .correlate
            .expect("observability config requires a correlation-context constructor");

        let tagged: LogFn = Arc::new(move |ctx, level, msg, attrs| {
            let mut all: Vec<(&str, String)> = attrs.to_vec();
            all.push(("lib", "opkit".to_string()));
            (log)(ctx, level, msg, &all);
        });

        Self {
            background,
            log: tagged,
            metric_timer,
            correlate,
        }
    }

    /// The process-lifetime background context.
    pub fn background(&self) -> &ObsContext {
        &self.background
    }

    /// Derive a fresh correlation context from `ctx`.
    pub fn correlate(&self, ctx: &ObsContext) -> ObsContext {
        (self.correlate)(ctx)
    }

    pub(crate) fn log(&self, ctx: &ObsContext, level: Level, msg: &str, attrs: &[(&str, String)]) {
        (self.log)(ctx, level, msg, attrs);
    }

    pub(crate) fn timer(&self, ctx: &ObsContext, name: &str) -> StopTimerFn {
        (self.metric_timer)(ctx, name)
    }

    /// Route the framework's `tracing` output through this contract.
    ///
    /// Installs a global subscriber whose only layer is the bridge; events
    /// emitted by `kube` and its dependencies arrive at the contract's log
    /// function tagged with a fixed `("dep", "kube")` pair. If a global
    /// subscriber is already installed the call is a no-op, so applications
    /// that run their own `tracing` pipeline keep it.
    pub fn install_bridge(&self) {
        let subscriber = tracing_subscriber::registry().with(LogBridge { obs: self.clone() });
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    /// The bridge layer on its own, for composing into an existing
    /// `tracing-subscriber` stack.
    pub fn bridge_layer(&self) -> LogBridge {
        LogBridge { obs: self.clone() }
    }
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observability").finish_non_exhaustive()
    }
}

/// Span attributes accumulated by the bridge, copied on derive.
struct SpanAttrs(Vec<(String, String)>);

/// A `tracing-subscriber` layer forwarding framework events into the
/// observability contract.
///
/// The layer accepts every event (`enabled` is unconditionally true; level
/// filtering belongs to the log function), accumulates span fields
/// copy-on-derive, and appends an `error` attribute to error-level events
/// that do not already carry one.
pub struct LogBridge {
    obs: Observability,
}

impl<S> Layer<S> for LogBridge
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn enabled(&self, _metadata: &Metadata<'_>, _ctx: LayerContext<'_, S>) -> bool {
        true
    }

    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: LayerContext<'_, S>,
    ) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanAttrs(visitor.pairs));
        }
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        ctx: LayerContext<'_, S>,
    ) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            if let Some(existing) = extensions.get_mut::<SpanAttrs>() {
                existing.0.extend(visitor.pairs);
            } else {
                extensions.insert(SpanAttrs(visitor.pairs));
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: LayerContext<'_, S>) {
        // The library's own lines already went through the contract directly.
        if event.metadata().target().starts_with("opkit") {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut attrs: Vec<(String, String)> = Vec::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(stored) = span.extensions().get::<SpanAttrs>() {
                    attrs.extend(stored.0.iter().cloned());
                }
            }
        }
        attrs.extend(visitor.pairs);
        attrs.push(("target".to_string(), event.metadata().target().to_string()));

        let level = match *event.metadata().level() {
            tracing::Level::ERROR => Level::Error,
            tracing::Level::WARN | tracing::Level::INFO => Level::Info,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::TRACE => Level::Trace,
        };

        let msg = visitor
            .message
            .unwrap_or_else(|| event.metadata().name().to_string());

        if level == Level::Error && !attrs.iter().any(|(k, _)| k == "error") {
            attrs.push(("error".to_string(), msg.clone()));
        }

        let mut borrowed: Vec<(&str, String)> =
            attrs.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        borrowed.push(("dep", "kube".to_string()));
        self.obs.log(&self.obs.background, level, &msg, &borrowed);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    pairs: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.pairs.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.pairs.push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

#[cfg(test)]
pub(crate) fn test_observability() -> Observability {
    Observability::new(ObservabilityConfig {
        background: Some(ObsContext::root()),
        log: Some(Arc::new(|_, _, _, _| {})),
        metric_timer: Some(Arc::new(|_, _| Box::new(|_| {}))),
        correlate: Some(Arc::new(|ctx| ctx.with("correlation_id", "test"))),
    })
}
