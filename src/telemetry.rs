use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over `level` when set. JSON output carries the current
/// span and the span list so every line can be tied to a workflow instance.
pub fn init_telemetry(json: bool, level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .with(filter)
        .try_init()?;

    tracing::info!(json, level, "Workflow telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking the log lines of one workflow instance
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering the lifetime of one controller.
///
/// `subject` is left empty for the controller to record (an order or item id).
pub fn create_workflow_span(workflow: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "workflow",
        workflow = workflow,
        correlation.id = correlation_id,
        subject = tracing::field::Empty,
        otel.kind = "internal"
    )
}

pub fn shutdown_telemetry() {
    tracing::info!("Workflow telemetry shutdown complete");
}
