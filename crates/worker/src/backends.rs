//! Production backends: SQS intake, ComfyUI over HTTP, S3 artifact
//! storage and SQS completion events.

use std::sync::Arc;

use async_trait::async_trait;

use imagex_cloud::notify::SqsCompletionPublisher;
use imagex_cloud::sqs::SqsJobQueue;
use imagex_cloud::storage::S3ArtifactStore;
use imagex_comfyui::api::ComfyUIApi;
use imagex_comfyui::engine::{ComfyUiEngine, GenerationEngine};

use crate::completion::{ArtifactPublisher, CompletionSink};
use crate::config::WorkerSettings;
use crate::error::WorkerError;
use crate::supervisor::{BackendFactory, Backends};

#[derive(Debug, Clone, Copy, Default)]
pub struct AwsComfyBackends;

#[async_trait]
impl BackendFactory for AwsComfyBackends {
    async fn build(&self, settings: &WorkerSettings) -> Result<Backends, WorkerError> {
        let sdk_config = imagex_cloud::load_sdk_config(&settings.region).await;

        let api = ComfyUIApi::new(settings.comfyui_url.as_str())
            .map_err(|e| WorkerError::Backend(format!("ComfyUI client: {e}")))?;
        let engine: Arc<dyn GenerationEngine> = Arc::new(ComfyUiEngine::new(api));

        let queue = Arc::new(SqsJobQueue::from_config(&sdk_config, settings.queue_url.as_str()));

        let completion = settings.output.as_ref().map(|output| {
            let store = Arc::new(S3ArtifactStore::from_config(&sdk_config, output.bucket.as_str()));
            let mut sink = ArtifactPublisher::new(Arc::clone(&engine), store, output.prefix.as_str());
            if let Some(queue_url) = &output.completion_queue_url {
                sink = sink.with_publisher(Arc::new(SqsCompletionPublisher::from_config(
                    &sdk_config,
                    queue_url.as_str(),
                    settings.region.as_str(),
                )));
            }
            tracing::info!(
                bucket = %output.bucket,
                prefix = %output.prefix,
                publish = output.completion_queue_url.is_some(),
                "Artifact delivery enabled",
            );
            Arc::new(sink) as Arc<dyn CompletionSink>
        });

        Ok(Backends {
            queue,
            engine,
            completion,
        })
    }
}
