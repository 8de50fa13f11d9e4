mod alert;
mod cli;
mod config;
mod error;
mod frame;
mod guard;
mod refresh;
mod store;

#[cfg(test)]
mod testing;

use crate::alert::{Alerter, WebhookAlerter};
use crate::cli::Args;
use crate::config::Config;
use crate::error::RefreshError;
use crate::frame::KeyColumns;
use crate::refresh::{Pipeline, PipelineSettings};
use crate::store::{PgDirectory, PgStore};
use anyhow::Result;
use clap::Parser;
use std::future::Future;
use tracing::Instrument;
use uuid::Uuid;

const JOB_NAME: &str = "locf-refresh";

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,locf_refresh=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", JOB_NAME),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn run(args: &Args, config: &Config, alerter: &WebhookAlerter) -> Result<()> {
    let settings = PipelineSettings::from_config(config);
    let connected = async {
        let store =
            PgStore::connect(&config.database_url, &config.schema, KeyColumns::default()).await?;
        let directory = PgDirectory::connect(&config.metadata_database_url).await?;
        Ok::<_, RefreshError>((store, directory))
    };
    let (mut store, mut directory) = match connected.await {
        Ok(connections) => connections,
        Err(err) => {
            alerter.notify(&err, "database connection", true, true).await;
            return Err(anyhow::Error::new(err).context("failed to connect to the databases"));
        }
    };

    let result = {
        let mut pipeline = Pipeline::new(&mut store, &mut directory, alerter, &settings);
        if args.full_history {
            pipeline.full_history().await;
            Ok(())
        } else {
            pipeline.run(args.by_device).await.map(|_| ())
        }
    };

    if let Err(err) = store.close().await {
        tracing::warn!(error = %err, "failed to close time-series connection");
    }
    if let Err(err) = directory.close().await {
        tracing::warn!(error = %err, "failed to close metadata connection");
    }
    result
}

/// Races the run against a shutdown signal. An interrupted run is alerted
/// and reported as a failure so the scheduler sees it.
async fn run_until_shutdown<A: Alerter>(
    run: impl Future<Output = Result<()>>,
    shutdown: impl Future<Output = std::io::Result<()>>,
    alerter: &A,
) -> Result<()> {
    tokio::select! {
        res = run => {
            if let Err(err) = &res {
                tracing::error!(error = %format!("{err:#}"), "locf refresh failed");
            }
            res
        }
        _ = shutdown => {
            tracing::warn!("shutdown signal received; abandoning run");
            alerter.notify(&"interrupted by signal", "locf refresh", true, false).await;
            anyhow::bail!("locf refresh interrupted by signal")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    if !args.skip_lock && guard::already_running(JOB_NAME) {
        return Ok(());
    }

    let run_id = Uuid::new_v4();
    let alerter = WebhookAlerter::new(
        config.alert_webhook_url.clone(),
        config.alert_token.clone(),
        JOB_NAME,
        run_id,
    );
    let span = tracing::info_span!("locf_refresh", %run_id, by_device = args.by_device);

    run_until_shutdown(
        run(&args, &config, &alerter).instrument(span),
        tokio::signal::ctrl_c(),
        &alerter,
    )
    .await
}
