//! OTLP export of agent spans to Langfuse.
//!
//! [`LangfuseConfig`] is always available; the exporter itself
//! ([`LangfuseTracer`]) needs the `langfuse` feature. Spans are batched, so
//! call [`LangfuseTracer::flush`] (or `shutdown`) before the process exits.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::TelemetryError;

const DEFAULT_SERVICE_NAME: &str = "agent-kit";
const DEFAULT_SERVICE_VERSION: &str = "1.0.0";
const DEFAULT_TRACES_PATH: &str = "/api/public/otel/v1/traces";

#[derive(Debug, Clone, Default)]
pub struct LangfuseConfig {
    pub secret_key: String,
    pub public_key: String,
    /// Langfuse base URL, e.g. `https://cloud.langfuse.com`.
    pub host: String,
    /// Path of the OTLP traces endpoint below `host`.
    pub url_path: Option<String>,
    pub environment: String,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
}

impl LangfuseConfig {
    pub fn new(
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            secret_key: secret_key.into(),
            host: host.into(),
            ..Self::default()
        }
    }

    /// Reads `LANGFUSE_PUBLIC_KEY`, `LANGFUSE_SECRET_KEY`, `LANGFUSE_HOST`
    /// and the optional `LANGFUSE_ENVIRONMENT`.
    pub fn from_env() -> Result<Self, TelemetryError> {
        let read = |key: &str| {
            std::env::var(key).map_err(|_| TelemetryError::Config(format!("{key} is not set")))
        };

        let mut config = Self::new(
            read("LANGFUSE_PUBLIC_KEY")?,
            read("LANGFUSE_SECRET_KEY")?,
            read("LANGFUSE_HOST")?,
        );
        config.environment = std::env::var("LANGFUSE_ENVIRONMENT").unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.secret_key.is_empty() || self.public_key.is_empty() || self.host.is_empty() {
            return Err(TelemetryError::Config(
                "secret key, public key and host are required when tracing is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn service_name(&self) -> &str {
        self.service_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_SERVICE_NAME)
    }

    pub fn service_version(&self) -> &str {
        self.service_version
            .as_deref()
            .filter(|version| !version.is_empty())
            .unwrap_or(DEFAULT_SERVICE_VERSION)
    }

    /// Full OTLP/HTTP traces URL.
    pub fn traces_endpoint(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };

        let path = self
            .url_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .unwrap_or(DEFAULT_TRACES_PATH);
        if path.starts_with('/') {
            format!("{host}{path}")
        } else {
            format!("{host}/{path}")
        }
    }

    /// `Authorization` header value: basic auth with `public:secret`.
    pub fn authorization_header(&self) -> String {
        let credentials = format!("{}:{}", self.public_key, self.secret_key);
        format!("Basic {}", STANDARD.encode(credentials))
    }
}

#[cfg(feature = "langfuse")]
pub use exporter::LangfuseTracer;

#[cfg(feature = "langfuse")]
mod exporter {
    use std::collections::HashMap;

    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::{Tracer, TracerProvider};

    use super::LangfuseConfig;
    use crate::error::TelemetryError;

    /// OTLP/HTTP batch exporter registered as the global tracer provider.
    pub struct LangfuseTracer {
        tracer: Tracer,
        provider: TracerProvider,
        config: LangfuseConfig,
    }

    impl LangfuseTracer {
        /// Must be called from within a Tokio runtime.
        pub fn new(config: LangfuseConfig) -> Result<Self, TelemetryError> {
            config.validate()?;

            let resource = Resource::new(vec![
                KeyValue::new("service.name", config.service_name().to_string()),
                KeyValue::new("service.version", config.service_version().to_string()),
                KeyValue::new("deployment.environment", config.environment.clone()),
            ]);

            let headers = HashMap::from([(
                "Authorization".to_string(),
                config.authorization_header(),
            )]);

            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(config.traces_endpoint())
                .with_headers(headers);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource))
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .map_err(|err| TelemetryError::Exporter(err.to_string()))?;

            let provider = tracer.provider().ok_or_else(|| {
                TelemetryError::Exporter("tracer provider dropped during setup".to_string())
            })?;

            tracing::info!(
                endpoint = %config.traces_endpoint(),
                service = config.service_name(),
                "langfuse exporter installed"
            );

            Ok(Self {
                tracer,
                provider,
                config,
            })
        }

        /// Tracer to hand to [`LangfuseCallback`](crate::callback::LangfuseCallback).
        pub fn tracer(&self) -> Tracer {
            self.tracer.clone()
        }

        pub fn provider(&self) -> &TracerProvider {
            &self.provider
        }

        pub fn config(&self) -> &LangfuseConfig {
            &self.config
        }

        /// Exports every finished span now.
        pub fn flush(&self) -> Result<(), TelemetryError> {
            let failures = self
                .provider
                .force_flush()
                .into_iter()
                .filter_map(Result::err)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();

            if failures.is_empty() {
                Ok(())
            } else {
                tracing::error!(errors = ?failures, "failed to flush tracer");
                Err(TelemetryError::Exporter(failures.join("; ")))
            }
        }

        /// Flushes and shuts down the global tracer provider.
        pub fn shutdown(self) -> Result<(), TelemetryError> {
            let flushed = self.flush();
            opentelemetry::global::shutdown_tracer_provider();
            flushed
        }
    }
}
