//! Post-generation delivery of artifacts.
//!
//! Runs after the engine reports success and before the job message is
//! acknowledged, so a failed upload or publish leaves the job on the
//! queue for another attempt.

use std::sync::Arc;

use async_trait::async_trait;

use imagex_cloud::notify::{CompletionPublisher, PublishError};
use imagex_cloud::storage::{content_type_for, ArtifactStore, StorageError};
use imagex_comfyui::engine::{EngineError, GenerationEngine, GenerationResult};

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Failed to download artifact {filename}: {source}")]
    Fetch {
        filename: String,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Upload(#[from] StorageError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Hands a finished job's output to downstream systems.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn complete(&self, job_id: &str, result: &GenerationResult)
        -> Result<(), CompletionError>;
}

/// Downloads every artifact from the engine, stores it under
/// `{prefix}/{job_id}/{filename}` and announces the first stored object.
pub struct ArtifactPublisher {
    engine: Arc<dyn GenerationEngine>,
    store: Arc<dyn ArtifactStore>,
    publisher: Option<Arc<dyn CompletionPublisher>>,
    prefix: String,
}

impl ArtifactPublisher {
    pub fn new(
        engine: Arc<dyn GenerationEngine>,
        store: Arc<dyn ArtifactStore>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            publisher: None,
            prefix: prefix.into(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn CompletionPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn key_for(&self, job_id: &str, filename: &str) -> String {
        if self.prefix.is_empty() {
            format!("{job_id}/{filename}")
        } else {
            format!("{}/{job_id}/{filename}", self.prefix)
        }
    }
}

#[async_trait]
impl CompletionSink for ArtifactPublisher {
    async fn complete(
        &self,
        job_id: &str,
        result: &GenerationResult,
    ) -> Result<(), CompletionError> {
        if result.artifacts.is_empty() {
            tracing::debug!(job_id, prompt_id = %result.prompt_id, "No artifacts to deliver");
            return Ok(());
        }

        let mut locators = Vec::with_capacity(result.artifacts.len());
        for artifact in &result.artifacts {
            let bytes = self
                .engine
                .fetch_artifact(artifact)
                .await
                .map_err(|source| CompletionError::Fetch {
                    filename: artifact.filename.clone(),
                    source,
                })?;

            let key = self.key_for(job_id, &artifact.filename);
            let locator = self
                .store
                .upload(&key, bytes, content_type_for(&artifact.filename))
                .await?;
            locators.push(locator);
        }

        if let (Some(publisher), Some(primary)) = (&self.publisher, locators.first()) {
            publisher.publish(job_id, primary).await?;
        }

        tracing::info!(job_id, artifacts = locators.len(), "Artifacts delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use imagex_cloud::storage::s3_url;
    use imagex_comfyui::history::ArtifactRef;

    use super::*;

    struct FakeEngine;

    #[async_trait]
    impl GenerationEngine for FakeEngine {
        async fn submit(
            &self,
            _job_id: &str,
            _workflow: &serde_json::Value,
        ) -> Result<GenerationResult, EngineError> {
            unreachable!("completion never submits")
        }

        async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, EngineError> {
            if artifact.filename == "gone.png" {
                return Err(EngineError::Terminal("404".into()));
            }
            Ok(artifact.filename.as_bytes().to_vec())
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        uploads: Mutex<Vec<(String, Vec<u8>, String)>>,
    }

    #[async_trait]
    impl ArtifactStore for RecordingStore {
        async fn upload(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<String, StorageError> {
            self.uploads
                .lock()
                .unwrap()
                .push((key.to_string(), bytes, content_type.to_string()));
            Ok(s3_url("renders", key))
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CompletionPublisher for RecordingPublisher {
        async fn publish(&self, job_id: &str, locator: &str) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Send {
                    job_id: job_id.to_string(),
                    message: "throttled".into(),
                });
            }
            self.events
                .lock()
                .unwrap()
                .push((job_id.to_string(), locator.to_string()));
            Ok(())
        }
    }

    fn artifact(filename: &str) -> ArtifactRef {
        ArtifactRef {
            filename: filename.into(),
            subfolder: String::new(),
            kind: "output".into(),
        }
    }

    fn result(files: &[&str]) -> GenerationResult {
        GenerationResult {
            prompt_id: "p-1".into(),
            artifacts: files.iter().map(|f| artifact(f)).collect(),
        }
    }

    #[tokio::test]
    async fn uploads_every_artifact_and_publishes_the_first() {
        let store = Arc::new(RecordingStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = ArtifactPublisher::new(Arc::new(FakeEngine), store.clone(), "outputs")
            .with_publisher(publisher.clone());

        sink.complete("job-1", &result(&["a.png", "b.webp"]))
            .await
            .unwrap();

        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].0, "outputs/job-1/a.png");
        assert_eq!(uploads[0].1, b"a.png".to_vec());
        assert_eq!(uploads[0].2, "image/png");
        assert_eq!(uploads[1].2, "image/webp");

        let events = publisher.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![("job-1".to_string(), "s3://renders/outputs/job-1/a.png".to_string())]
        );
    }

    #[tokio::test]
    async fn empty_prefix_keys_by_job_only() {
        let store = Arc::new(RecordingStore::default());
        let sink = ArtifactPublisher::new(Arc::new(FakeEngine), store.clone(), "");
        sink.complete("job-2", &result(&["x.png"])).await.unwrap();
        assert_eq!(store.uploads.lock().unwrap()[0].0, "job-2/x.png");
    }

    #[tokio::test]
    async fn nothing_is_published_without_artifacts() {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = ArtifactPublisher::new(
            Arc::new(FakeEngine),
            Arc::new(RecordingStore::default()),
            "outputs",
        )
        .with_publisher(publisher.clone());

        sink.complete("job-3", &result(&[])).await.unwrap();
        assert!(publisher.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_and_publish_failures_surface() {
        let sink = ArtifactPublisher::new(
            Arc::new(FakeEngine),
            Arc::new(RecordingStore::default()),
            "outputs",
        );
        let err = sink.complete("job-4", &result(&["gone.png"])).await.unwrap_err();
        assert_matches!(err, CompletionError::Fetch { filename, .. } if filename == "gone.png");

        let sink = ArtifactPublisher::new(
            Arc::new(FakeEngine),
            Arc::new(RecordingStore::default()),
            "outputs",
        )
        .with_publisher(Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        }));
        let err = sink.complete("job-5", &result(&["a.png"])).await.unwrap_err();
        assert_matches!(err, CompletionError::Publish(_));
    }
}
