//! Single-file avatar upload with an optimistic local preview.
//!
//! `Idle -> Uploading -> {Succeeded, Failed}`. The local preview is published
//! before the uploader is awaited, swapped for the durable URL on success and
//! cleared on failure. Only one upload runs per pipeline; a call made while
//! one is in flight is ignored.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::{errors::extract_message, models::SelectedFile, preview::PreviewRegistry};

pub trait AvatarUploader: Send + Sync {
    fn upload<'a>(
        &'a self,
        file: &'a SelectedFile,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Idle,
    Uploading,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub status: UploadStatus,
    pub avatar_preview: Option<String>,
    pub is_uploading: bool,
    pub upload_success: bool,
    pub upload_error: Option<String>,
}

impl UploadState {
    fn idle(avatar_preview: Option<String>) -> Self {
        Self {
            status: UploadStatus::Idle,
            avatar_preview,
            is_uploading: false,
            upload_success: false,
            upload_error: None,
        }
    }
}

pub type UploadListener = Arc<dyn Fn(&UploadState) + Send + Sync>;

struct Inner {
    state: UploadState,
    generation: u64,
    local_preview: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct UploadTicket {
    generation: u64,
}

pub struct UploadPipeline {
    uploader: Arc<dyn AvatarUploader>,
    previews: Arc<dyn PreviewRegistry>,
    initial_avatar: Option<String>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<UploadState>,
    listener: Option<UploadListener>,
}

impl UploadPipeline {
    pub fn new(
        uploader: Arc<dyn AvatarUploader>,
        previews: Arc<dyn PreviewRegistry>,
        initial_avatar: Option<String>,
    ) -> Self {
        let state = UploadState::idle(initial_avatar.clone());
        let (state_tx, _) = watch::channel(state.clone());
        Self {
            uploader,
            previews,
            initial_avatar,
            inner: Mutex::new(Inner {
                state,
                generation: 0,
                local_preview: None,
            }),
            state_tx,
            listener: None,
        }
    }

    /// Registers a callback invoked synchronously on every transition.
    pub fn with_listener(mut self, listener: UploadListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn state(&self) -> UploadState {
        self.lock().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state_tx.subscribe()
    }

    pub async fn upload_image(&self, file: SelectedFile) -> Option<String> {
        let ticket = self.begin(&file)?;
        let result = self.uploader.upload(&file).await;
        self.finish(ticket, result)
    }

    /// Publishes the local preview on the calling thread, then runs the
    /// remote half of the upload on `handle`.
    pub fn spawn_upload(
        self: &Arc<Self>,
        handle: &Handle,
        file: SelectedFile,
    ) -> Option<JoinHandle<Option<String>>> {
        let ticket = self.begin(&file)?;
        let pipeline = Arc::clone(self);
        Some(handle.spawn(async move {
            let result = pipeline.uploader.upload(&file).await;
            pipeline.finish(ticket, result)
        }))
    }

    pub fn reset_upload(&self) {
        let state = {
            let mut inner = self.lock();
            inner.generation += 1;
            if let Some(local) = inner.local_preview.take() {
                self.previews.revoke(&local);
            }
            inner.state = UploadState::idle(self.initial_avatar.clone());
            inner.state.clone()
        };
        self.publish(state);
    }

    fn begin(&self, file: &SelectedFile) -> Option<UploadTicket> {
        let (ticket, state) = {
            let mut inner = self.lock();
            if inner.state.status == UploadStatus::Uploading {
                warn!(file = %file.name, "avatar upload already in flight, ignoring new selection");
                return None;
            }

            inner.generation += 1;
            let local = self.previews.create(file);
            if let Some(previous) = inner.local_preview.replace(local.clone()) {
                self.previews.revoke(&previous);
            }

            inner.state = UploadState {
                status: UploadStatus::Uploading,
                avatar_preview: Some(local),
                is_uploading: true,
                upload_success: false,
                upload_error: None,
            };
            let ticket = UploadTicket {
                generation: inner.generation,
            };
            (ticket, inner.state.clone())
        };

        debug!(file = %file.name, bytes = file.len(), "avatar upload started");
        self.publish(state);
        Some(ticket)
    }

    fn finish(&self, ticket: UploadTicket, result: Result<String>) -> Option<String> {
        let (outcome, state) = {
            let mut inner = self.lock();
            if inner.generation != ticket.generation {
                debug!("discarding avatar upload result after reset");
                return None;
            }

            if let Some(local) = inner.local_preview.take() {
                self.previews.revoke(&local);
            }

            let outcome = match result {
                Ok(url) => {
                    debug!(%url, "avatar upload succeeded");
                    inner.state = UploadState {
                        status: UploadStatus::Succeeded,
                        avatar_preview: Some(url.clone()),
                        is_uploading: false,
                        upload_success: true,
                        upload_error: None,
                    };
                    Some(url)
                }
                Err(error) => {
                    let message = extract_message(&error);
                    warn!(error = %message, "avatar upload failed");
                    inner.state = UploadState {
                        status: UploadStatus::Failed,
                        avatar_preview: None,
                        is_uploading: false,
                        upload_success: false,
                        upload_error: Some(message),
                    };
                    None
                }
            };
            (outcome, inner.state.clone())
        };

        self.publish(state);
        outcome
    }

    /// Runs outside the state lock so listeners may read the pipeline back.
    fn publish(&self, state: UploadState) {
        if let Some(listener) = &self.listener {
            listener(&state);
        }
        self.state_tx.send_replace(state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("upload state mutex poisoned")
    }
}

impl Drop for UploadPipeline {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            if let Some(local) = inner.local_preview.take() {
                self.previews.revoke(&local);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use tokio::sync::Notify;

    use super::*;
    use crate::preview::{is_local_preview, ObjectUrlRegistry};

    struct ScriptedUploader {
        gate: Option<Arc<Notify>>,
        outcome: std::result::Result<String, String>,
        calls: AtomicUsize,
    }

    impl ScriptedUploader {
        fn resolving(url: &str) -> Self {
            Self {
                gate: None,
                outcome: Ok(url.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn rejecting(message: &str) -> Self {
            Self {
                gate: None,
                outcome: Err(message.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    impl AvatarUploader for ScriptedUploader {
        fn upload<'a>(
            &'a self,
            _file: &'a SelectedFile,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                self.outcome.clone().map_err(|message| anyhow!(message))
            })
        }
    }

    fn avatar() -> SelectedFile {
        SelectedFile::new("avatar.png", "image/png", vec![0x89, 0x50, 0x4e, 0x47])
    }

    fn build_pipeline(
        uploader: ScriptedUploader,
        initial: Option<&str>,
    ) -> (Arc<UploadPipeline>, Arc<ObjectUrlRegistry>) {
        let registry = Arc::new(ObjectUrlRegistry::new());
        let pipeline = UploadPipeline::new(
            Arc::new(uploader),
            registry.clone(),
            initial.map(str::to_string),
        );
        (Arc::new(pipeline), registry)
    }

    #[tokio::test]
    async fn success_shows_local_preview_then_remote_url() {
        let gate = Arc::new(Notify::new());
        let (pipeline, registry) = build_pipeline(
            ScriptedUploader::resolving("https://cdn/x.png").gated(gate.clone()),
            None,
        );
        let mut updates = pipeline.subscribe();

        let task = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.upload_image(avatar()).await }
        });

        updates.wait_for(|state| state.is_uploading).await.unwrap();
        let in_flight = pipeline.state();
        assert_eq!(in_flight.status, UploadStatus::Uploading);
        let local = in_flight.avatar_preview.clone().unwrap();
        assert!(is_local_preview(&local));
        assert_eq!(registry.live_count(), 1);

        gate.notify_one();
        let result = task.await.unwrap();

        assert_eq!(result.as_deref(), Some("https://cdn/x.png"));
        let state = pipeline.state();
        assert_eq!(state.avatar_preview.as_deref(), Some("https://cdn/x.png"));
        assert!(state.upload_success);
        assert_eq!(state.upload_error, None);
        assert_eq!(state.status, UploadStatus::Succeeded);
        assert!(registry.resolve(&local).is_none());
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn failure_rolls_back_preview() {
        let (pipeline, registry) = build_pipeline(
            ScriptedUploader::rejecting("network down"),
            Some("https://cdn/old.png"),
        );

        let result = pipeline.upload_image(avatar()).await;

        assert_eq!(result, None);
        let state = pipeline.state();
        assert_eq!(state.avatar_preview, None);
        assert_eq!(state.upload_error.as_deref(), Some("network down"));
        assert!(!state.upload_success);
        assert!(!state.is_uploading);
        assert_eq!(state.status, UploadStatus::Failed);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn reset_restores_initial_avatar_after_either_outcome() {
        let (pipeline, _registry) = build_pipeline(
            ScriptedUploader::resolving("https://cdn/new.png"),
            Some("https://cdn/old.png"),
        );
        pipeline.upload_image(avatar()).await;
        pipeline.reset_upload();
        assert_eq!(
            pipeline.state(),
            UploadState::idle(Some("https://cdn/old.png".to_string()))
        );

        let (pipeline, _registry) = pipeline_without_initial_failing();
        pipeline.upload_image(avatar()).await;
        pipeline.reset_upload();
        let state = pipeline.state();
        assert_eq!(state.avatar_preview, None);
        assert_eq!(state.upload_error, None);
        assert!(!state.upload_success);
        assert_eq!(state.status, UploadStatus::Idle);
    }

    fn pipeline_without_initial_failing() -> (Arc<UploadPipeline>, Arc<ObjectUrlRegistry>) {
        build_pipeline(ScriptedUploader::rejecting("boom"), None)
    }

    #[tokio::test]
    async fn second_selection_while_uploading_is_ignored() {
        let gate = Arc::new(Notify::new());
        let uploader = Arc::new(
            ScriptedUploader::resolving("https://cdn/first.png").gated(gate.clone()),
        );
        let registry = Arc::new(ObjectUrlRegistry::new());
        let pipeline = Arc::new(UploadPipeline::new(
            uploader.clone(),
            registry.clone(),
            None,
        ));

        let first = pipeline
            .spawn_upload(&Handle::current(), avatar())
            .expect("first upload starts");
        let preview = pipeline.state().avatar_preview;

        assert!(pipeline.spawn_upload(&Handle::current(), avatar()).is_none());
        assert_eq!(pipeline.upload_image(avatar()).await, None);
        assert_eq!(pipeline.state().avatar_preview, preview);
        assert_eq!(registry.live_count(), 1);

        gate.notify_one();
        assert_eq!(
            first.await.unwrap().as_deref(),
            Some("https://cdn/first.png")
        );
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_during_upload_discards_late_result() {
        let gate = Arc::new(Notify::new());
        let (pipeline, registry) = build_pipeline(
            ScriptedUploader::resolving("https://cdn/late.png").gated(gate.clone()),
            Some("https://cdn/old.png"),
        );

        let task = pipeline
            .spawn_upload(&Handle::current(), avatar())
            .expect("upload starts");
        pipeline.reset_upload();
        assert_eq!(registry.live_count(), 0);

        gate.notify_one();
        assert_eq!(task.await.unwrap(), None);
        assert_eq!(
            pipeline.state().avatar_preview.as_deref(),
            Some("https://cdn/old.png")
        );
    }

    #[tokio::test]
    async fn listener_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ObjectUrlRegistry::new());
        let pipeline = UploadPipeline::new(
            Arc::new(ScriptedUploader::resolving("https://cdn/x.png")),
            registry,
            None,
        )
        .with_listener({
            let seen = seen.clone();
            Arc::new(move |state: &UploadState| seen.lock().unwrap().push(state.status))
        });

        pipeline.upload_image(avatar()).await;
        pipeline.reset_upload();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                UploadStatus::Uploading,
                UploadStatus::Succeeded,
                UploadStatus::Idle
            ]
        );
    }

    #[tokio::test]
    async fn dropping_pipeline_releases_local_preview() {
        let gate = Arc::new(Notify::new());
        let registry = Arc::new(ObjectUrlRegistry::new());
        let pipeline = Arc::new(UploadPipeline::new(
            Arc::new(ScriptedUploader::resolving("https://cdn/x.png").gated(gate)),
            registry.clone(),
            None,
        ));

        let task = pipeline
            .spawn_upload(&Handle::current(), avatar())
            .expect("upload starts");
        assert_eq!(registry.live_count(), 1);

        task.abort();
        let _ = task.await;
        drop(pipeline);
        assert_eq!(registry.live_count(), 0);
    }
}
