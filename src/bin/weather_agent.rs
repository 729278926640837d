use std::env;
use std::error::Error;

use agent_kit::tools::{Tool, ToolContext, ToolInfo, ToolOutput, ToolRegistry};
use agent_kit::{Agent, InvokeConfig, LoggingCallback, McpServer, OpenAiModel, ToolError};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Deserialize, JsonSchema)]
struct GetWeather {
    /// City name, e.g. "Berlin".
    city: String,
}

#[async_trait]
impl Tool for GetWeather {
    fn info() -> ToolInfo {
        ToolInfo::new("get_weather", "Returns the current weather for a city")
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let unit = ctx
            .named_value::<String>("unit")
            .map(|unit| unit.as_str().to_string())
            .unwrap_or_else(|| "celsius".to_string());

        tracing::info!(city = %self.city, run_id = ctx.run_id(), "looking up weather");
        ToolOutput::json(&serde_json::json!({
            "city": self.city,
            "temperature": 21,
            "unit": unit,
            "conditions": "sunny",
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_kit=info,weather_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();

    if args.first().map(String::as_str) == Some("mcp") {
        let mut registry = ToolRegistry::new();
        registry.register_tool::<GetWeather>()?;
        McpServer::new("weather", env!("CARGO_PKG_VERSION"), registry)
            .run_stdio()
            .await?;
        return Ok(());
    }

    let prompt = args.join(" ");
    let prompt = if prompt.trim().is_empty() {
        "What's the weather like in Berlin right now?".to_string()
    } else {
        prompt
    };

    let agent: Agent = Agent::builder()
        .client(OpenAiModel::from_env()?)
        .tool::<GetWeather>()
        .callback(LoggingCallback::new())
        .named_value("unit", "celsius".to_string())
        .build()?;

    #[cfg_attr(not(feature = "langfuse"), allow(unused_mut))]
    let mut config = InvokeConfig::prompt(prompt)
        .with_system_prompt("You are a concise weather assistant. Use the tools you have.");

    #[cfg(feature = "langfuse")]
    let tracer = match agent_kit::telemetry::LangfuseConfig::from_env() {
        Ok(langfuse) => {
            let tracer = agent_kit::telemetry::LangfuseTracer::new(langfuse)?;
            let callback = agent_kit::callback::LangfuseCallback::new(
                tracer.tracer(),
                agent_kit::callback::LangfuseCallbackConfig {
                    service_name: Some("weather_agent".to_string()),
                    ..Default::default()
                },
            );
            println!("trace: {}", callback.trace_url(env::var("LANGFUSE_HOST").ok().as_deref()));
            config = config.with_callback(callback);
            Some(tracer)
        }
        Err(err) => {
            tracing::warn!(error = %err, "langfuse disabled");
            None
        }
    };

    let answer = agent.invoke(config).await;

    #[cfg(feature = "langfuse")]
    if let Some(tracer) = tracer {
        tracer.shutdown()?;
    }

    println!("{}", answer?);
    Ok(())
}
