//! The model-event bus and the token-usage forwarder.
//!
//! The language-model client is an external collaborator; the engine sees it
//! only as a single-publisher, multi-subscriber event source. The scheduler
//! subscribes for the duration of one task run and forwards every completed
//! request's token tuple into the per-task `tokenUsage` list through the
//! serialized status-write queue, so arrival order survives interleaved
//! status mutations.

use conveyor_core::status::TokenUsage;
use conveyor_state::StatusWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

/// Metric payload of a completed model request.
#[derive(Debug, Clone, Default)]
pub struct ModelMetric {
    pub provider: Option<String>,
    pub model: Option<String>,
    /// `metadata.alias`, preferred over `<provider>:<model>` when present.
    pub alias: Option<String>,
    pub input_tokens: f64,
    pub output_tokens: f64,
}

impl ModelMetric {
    /// The model key: the alias, or `<provider>:<model>` with each missing
    /// component replaced by the literal `undefined`.
    pub fn model_key(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => format!(
                "{}:{}",
                self.provider.as_deref().unwrap_or("undefined"),
                self.model.as_deref().unwrap_or("undefined"),
            ),
        }
    }

    /// The `[modelKey, inputTokens, outputTokens]` triple, with non-finite
    /// numerics coerced to zero.
    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage(
            self.model_key(),
            coerce_tokens(self.input_tokens),
            coerce_tokens(self.output_tokens),
        )
    }
}

fn coerce_tokens(value: f64) -> u64 {
    if value.is_finite() { value as u64 } else { 0 }
}

/// One event on the model bus.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    RequestComplete(ModelMetric),
    RequestError { message: String },
}

/// Single-publisher, multi-subscriber model-event bus.
#[derive(Clone)]
pub struct ModelBus {
    tx: broadcast::Sender<ModelEvent>,
}

impl Default for ModelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event. Events published while nobody subscribes are
    /// dropped.
    pub fn publish(&self, event: ModelEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.tx.subscribe()
    }
}

/// Handle over a running usage forwarder.
pub(crate) struct UsageForwarder {
    shutdown: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<Vec<String>>,
}

impl UsageForwarder {
    /// Spawn a forwarder that appends one token tuple per
    /// `RequestComplete` event to `tasks[task].tokenUsage`, in arrival
    /// order. `RequestError` messages are collected for observability only.
    pub(crate) fn spawn(
        writer: Arc<StatusWriter>,
        job_dir: PathBuf,
        task: String,
        mut rx: broadcast::Receiver<ModelEvent>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut request_errors = Vec::new();
            loop {
                tokio::select! {
                    // Events already published win over shutdown, so nothing
                    // in the channel is dropped on the way out.
                    biased;
                    received = rx.recv() => match received {
                        Ok(event) => {
                            forward_event(&writer, &job_dir, &task, event, &mut request_errors)
                                .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(task = %task, skipped, "Model-event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut shutdown_rx => {
                        while let Ok(event) = rx.try_recv() {
                            forward_event(&writer, &job_dir, &task, event, &mut request_errors)
                                .await;
                        }
                        break;
                    }
                }
            }
            request_errors
        });
        Self {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Flush queued events and stop. Errors are absorbed so they cannot mask
    /// the pipeline outcome; returns the collected `RequestError` messages.
    pub(crate) async fn flush(self) -> Vec<String> {
        let _ = self.shutdown.send(());
        match self.handle.await {
            Ok(errors) => errors,
            Err(join_error) => {
                warn!(error = %join_error, "Usage forwarder did not shut down cleanly");
                Vec::new()
            }
        }
    }
}

async fn forward_event(
    writer: &StatusWriter,
    job_dir: &std::path::Path,
    task: &str,
    event: ModelEvent,
    request_errors: &mut Vec<String>,
) {
    match event {
        ModelEvent::RequestComplete(metric) => {
            let usage = metric.token_usage();
            let task_name = task.to_string();
            if let Err(error) = writer
                .update(job_dir, move |doc| {
                    doc.task_mut(&task_name).token_usage.push(usage);
                })
                .await
            {
                warn!(task = %task, error = %error, "Token usage append failed");
            }
        }
        ModelEvent::RequestError { message } => request_errors.push(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_state::{STATUS_FILE, read_status};

    #[test]
    fn model_key_prefers_alias() {
        let metric = ModelMetric {
            provider: Some("openai".into()),
            model: Some("gpt-4".into()),
            alias: Some("fast".into()),
            ..ModelMetric::default()
        };
        assert_eq!(metric.model_key(), "fast");
    }

    #[test]
    fn model_key_falls_back_to_undefined() {
        let metric = ModelMetric::default();
        assert_eq!(metric.model_key(), "undefined:undefined");

        let metric = ModelMetric {
            provider: Some("anthropic".into()),
            ..ModelMetric::default()
        };
        assert_eq!(metric.model_key(), "anthropic:undefined");
    }

    #[test]
    fn non_finite_tokens_coerce_to_zero() {
        let metric = ModelMetric {
            input_tokens: f64::NAN,
            output_tokens: f64::INFINITY,
            ..ModelMetric::default()
        };
        let usage = metric.token_usage();
        assert_eq!(usage.input_tokens(), 0);
        assert_eq!(usage.output_tokens(), 0);
    }

    /// Token tuples survive interleaved status mutations, in emission order.
    #[tokio::test]
    async fn usage_appends_survive_interleaved_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(StatusWriter::new());
        let bus = ModelBus::new();
        let forwarder = UsageForwarder::spawn(
            writer.clone(),
            dir.path().to_path_buf(),
            "infer".to_string(),
            bus.subscribe(),
        );

        for i in 0..3u32 {
            bus.publish(ModelEvent::RequestComplete(ModelMetric {
                alias: Some(format!("model-{i}")),
                input_tokens: (i * 10) as f64,
                output_tokens: (i * 20) as f64,
                ..ModelMetric::default()
            }));
            let stage = format!("inference-step-{i}");
            let progress = 25 * (i as u8 + 1);
            writer
                .update(dir.path(), move |doc| {
                    doc.current_stage = Some(stage);
                    doc.progress = Some(progress);
                })
                .await
                .unwrap();
        }

        let errors = forwarder.flush().await;
        assert!(errors.is_empty());

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        let usage = &doc.tasks["infer"].token_usage;
        assert_eq!(usage.len(), 3);
        let keys: Vec<_> = usage.iter().map(|u| u.model_key().to_string()).collect();
        assert_eq!(keys, vec!["model-0", "model-1", "model-2"]);
        assert_eq!(doc.current_stage.as_deref(), Some("inference-step-2"));
        assert_eq!(doc.progress, Some(75));
    }

    #[tokio::test]
    async fn request_errors_are_collected_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(StatusWriter::new());
        let bus = ModelBus::new();
        let forwarder = UsageForwarder::spawn(
            writer.clone(),
            dir.path().to_path_buf(),
            "infer".to_string(),
            bus.subscribe(),
        );

        bus.publish(ModelEvent::RequestError {
            message: "rate limited".to_string(),
        });
        let errors = forwarder.flush().await;
        assert_eq!(errors, vec!["rate limited"]);

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert!(doc.tasks.is_empty());
    }
}
