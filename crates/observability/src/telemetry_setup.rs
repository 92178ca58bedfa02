use anyhow::{Context as _, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use bulwark_config::{LogFormat, ObservabilityConfig};

use crate::trace_context::TraceContext;

/// 追踪提供者的持有者，进程退出前调用`shutdown`以刷新未导出的span
pub struct TelemetryGuard {
    provider: SdkTracerProvider,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let Err(e) = self.provider.shutdown() {
            warn!(error = %e, "OpenTelemetry tracer provider shutdown failed");
        }
    }
}

fn build_tracer_provider(config: &ObservabilityConfig) -> Result<SdkTracerProvider> {
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();
    let builder = SdkTracerProvider::builder().with_resource(resource);

    let provider = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint.clone())
                .build()
                .context("Failed to create OTLP span exporter")?;
            builder.with_batch_exporter(exporter).build()
        }
        None => builder.build(),
    };
    Ok(provider)
}

/// 安装日志、追踪与传播器
///
/// fmt层使用`RUST_LOG`或配置中的级别过滤；OpenTelemetry层固定为INFO，
/// 因此即使日志级别调高，span仍能获得trace id。
pub fn init_observability(config: &ObservabilityConfig) -> Result<TelemetryGuard> {
    let provider = build_tracer_provider(config)?;
    let tracer = provider.tracer("bulwark");
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContext::propagator());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .boxed(),
    };

    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_filter(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!(
        logging.format = ?config.log_format,
        logging.level = %config.log_level,
        otlp.endpoint = config.otlp_endpoint.as_deref().unwrap_or("disabled"),
        service = %config.service_name,
        "Observability initialized"
    );

    Ok(TelemetryGuard { provider })
}

pub fn shutdown_observability(guard: TelemetryGuard) {
    guard.shutdown();
    info!("OpenTelemetry observability shutdown completed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_provider_without_endpoint() {
        let config = ObservabilityConfig::default();
        let provider = build_tracer_provider(&config).unwrap();
        assert!(provider.shutdown().is_ok());
    }
}
