//! 链路追踪上下文
//!
//! 每个逻辑操作对应一个`tracing` span，经`tracing-opentelemetry`桥接为OpenTelemetry span，
//! 因此嵌套关系随`.instrument()`跨越`.await`保持，日志行带有`trace_id`字段。
//! 跨进程边界时用W3C `traceparent`/`tracestate`/`baggage`载体续接。

use opentelemetry::baggage::BaggageExt;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use tracing::field::Empty;
use tracing::{Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// HTTP响应中携带trace id的头
pub const TRACE_ID_HEADER: &str = "x-trace-id";

pub struct TraceContext;

impl TraceContext {
    /// W3C trace-context与baggage组合传播器
    pub fn propagator() -> TextMapCompositePropagator {
        TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ])
    }

    /// 在当前span下开启子span
    pub fn span(operation: &str, attributes: &[(&str, String)]) -> Span {
        let span = tracing::info_span!(
            target: "bulwark",
            "operation",
            otel.name = %operation,
            trace_id = Empty,
            otel.status_code = Empty,
            otel.status_message = Empty,
        );
        Self::decorate(&span, attributes);
        span
    }

    /// 以载体中的远端上下文为父span开启新span；载体为空时成为新的根span
    pub fn continue_from(
        carrier: &HashMap<String, String>,
        operation: &str,
        attributes: &[(&str, String)],
    ) -> Span {
        let span = tracing::info_span!(
            target: "bulwark",
            parent: None,
            "operation",
            otel.name = %operation,
            trace_id = Empty,
            otel.status_code = Empty,
            otel.status_message = Empty,
        );
        if !carrier.is_empty() {
            span.set_parent(Self::extract(carrier));
        }
        Self::decorate(&span, attributes);
        span
    }

    /// 在当前span下开启携带baggage的子span，baggage随后代span和注入的载体传播
    pub fn span_with_baggage(
        operation: &str,
        baggage: Vec<(String, String)>,
        attributes: &[(&str, String)],
    ) -> Span {
        let parent = Span::current().context().with_baggage(
            baggage
                .into_iter()
                .map(|(key, value)| KeyValue::new(key, value)),
        );
        let span = tracing::info_span!(
            target: "bulwark",
            "operation",
            otel.name = %operation,
            trace_id = Empty,
            otel.status_code = Empty,
            otel.status_message = Empty,
        );
        span.set_parent(parent);
        Self::decorate(&span, attributes);
        span
    }

    fn decorate(span: &Span, attributes: &[(&str, String)]) {
        for (key, value) in attributes {
            span.set_attribute(key.to_string(), value.clone());
        }
        if let Some(trace_id) = Self::trace_id_of(span) {
            span.record("trace_id", trace_id.as_str());
        }
    }

    pub fn trace_id_of(span: &Span) -> Option<String> {
        Self::trace_id_in(&span.context())
    }

    pub fn current_trace_id() -> Option<String> {
        Self::trace_id_of(&Span::current())
    }

    fn trace_id_in(cx: &Context) -> Option<String> {
        let span_context = cx.span().span_context().clone();
        span_context
            .is_valid()
            .then(|| format!("{:032x}", span_context.trace_id()))
    }

    pub fn baggage_item(key: &str) -> Option<String> {
        Span::current()
            .context()
            .baggage()
            .get(key)
            .map(|value| value.to_string())
    }

    /// 将当前span的上下文写入载体
    pub fn inject(carrier: &mut HashMap<String, String>) {
        Self::inject_from(&Span::current(), carrier);
    }

    pub fn inject_from(span: &Span, carrier: &mut HashMap<String, String>) {
        let cx = span.context();
        Self::propagator().inject_context(&cx, carrier);
    }

    pub fn extract(carrier: &HashMap<String, String>) -> Context {
        Self::propagator().extract(carrier)
    }

    pub fn record_error(span: &Span, error: &dyn Display) {
        let message = error.to_string();
        span.record("otel.status_code", "ERROR");
        span.record("otel.status_message", message.as_str());
        span.in_scope(|| tracing::warn!(error = %message, "操作失败"));
    }

    /// 在新span内执行异步操作，失败时记录错误状态
    pub async fn in_span<F, T, E>(operation: &str, attributes: &[(&str, String)], fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let span = Self::span(operation, attributes);
        let result = fut.instrument(span.clone()).await;
        match &result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(e) => Self::record_error(&span, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::layer::SubscriberExt;

    fn with_tracing<R>(f: impl FnOnce() -> R) -> R {
        let provider = SdkTracerProvider::builder().build();
        let tracer = provider.tracer("trace-context-test");
        let subscriber =
            tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(tracer));
        tracing::subscriber::with_default(subscriber, f)
    }

    #[test]
    fn test_span_has_trace_id() {
        with_tracing(|| {
            let span = TraceContext::span("rate_limit.check", &[("config", "api".to_string())]);
            let trace_id = TraceContext::trace_id_of(&span).unwrap();
            assert_eq!(trace_id.len(), 32);
            assert_ne!(trace_id, "0".repeat(32));
        });
    }

    #[test]
    fn test_child_span_shares_trace_id() {
        with_tracing(|| {
            let parent = TraceContext::span("gateway.request", &[]);
            let parent_id = TraceContext::trace_id_of(&parent);
            let child_id = parent.in_scope(|| {
                let child = TraceContext::span("circuit_breaker.call", &[]);
                TraceContext::trace_id_of(&child)
            });
            assert!(parent_id.is_some());
            assert_eq!(parent_id, child_id);
        });
    }

    #[test]
    fn test_inject_extract_round_trip_continues_trace() {
        with_tracing(|| {
            let producer = TraceContext::span("task.enqueue", &[]);
            let mut carrier = HashMap::new();
            TraceContext::inject_from(&producer, &mut carrier);
            assert!(carrier.contains_key("traceparent"));

            let consumer = TraceContext::continue_from(&carrier, "task.process", &[]);
            assert_eq!(
                TraceContext::trace_id_of(&producer),
                TraceContext::trace_id_of(&consumer)
            );
        });
    }

    #[test]
    fn test_continue_from_empty_carrier_starts_new_trace() {
        with_tracing(|| {
            let outer = TraceContext::span("outer", &[]);
            let fresh = outer.in_scope(|| TraceContext::continue_from(&HashMap::new(), "task.process", &[]));
            assert!(TraceContext::trace_id_of(&fresh).is_some());
            assert_ne!(
                TraceContext::trace_id_of(&outer),
                TraceContext::trace_id_of(&fresh)
            );
        });
    }

    #[test]
    fn test_baggage_propagates_to_carrier() {
        with_tracing(|| {
            let span = TraceContext::span_with_baggage(
                "gateway.request",
                vec![("tenant".to_string(), "acme".to_string())],
                &[],
            );
            span.in_scope(|| {
                assert_eq!(TraceContext::baggage_item("tenant"), Some("acme".to_string()));
                let mut carrier = HashMap::new();
                TraceContext::inject(&mut carrier);
                assert!(carrier.get("baggage").unwrap().contains("tenant=acme"));
            });
        });
    }

    #[test]
    fn test_no_subscriber_means_no_trace_id() {
        let span = TraceContext::span("orphan", &[]);
        assert_eq!(TraceContext::trace_id_of(&span), None);
    }
}
