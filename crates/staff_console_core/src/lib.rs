use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub mod client;
pub mod clock;
pub mod doctor_form;
pub mod errors;
pub mod form_persist;
pub mod models;
pub mod preview;
pub mod professional_info;
pub mod storage;
pub mod upload;
pub mod visibility;

use client::HttpDoctorClient;
use clock::{Clock, SystemClock};
use errors::{invalid_payload, InvokeError};
use form_persist::{
    FormPersist, MountLatch, PersistOptions, DEFAULT_EXPIRY_MINUTES, MAX_EXPIRY_MINUTES,
};
use models::SelectedFile;
use preview::{ObjectUrlRegistry, PreviewRegistry};
use storage::{FileSessionStorage, MemoryStorage, SessionStorage};
use upload::{AvatarUploader, UploadPipeline, UploadState};
use visibility::{FormVisibility, ModalState};

pub const EVENT_UPLOAD_STATE: &str = "upload://state";
pub const EVENT_SESSION_ENDED: &str = "session://ended";

type SharedCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type CallbackSlot = Arc<Mutex<Option<SharedCallback>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            api_base_url: None,
            api_token: None,
            expiry_minutes: default_expiry_minutes(),
        }
    }
}

fn default_expiry_minutes() -> i64 {
    DEFAULT_EXPIRY_MINUTES
}

impl RuntimeConfig {
    pub fn parse(config_json: &str) -> anyhow::Result<Self> {
        if config_json.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_json::from_str(config_json).context("invalid staff console config json")?;
        if config.expiry_minutes <= 0 {
            return Err(anyhow!("expiryMinutes must be positive"));
        }
        if config.expiry_minutes > MAX_EXPIRY_MINUTES {
            return Err(anyhow!(
                "expiryMinutes must not exceed {MAX_EXPIRY_MINUTES}"
            ));
        }
        Ok(config)
    }

    fn persist_options(&self) -> PersistOptions {
        PersistOptions {
            expiry_minutes: self.expiry_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<InvokeError>,
}

struct UnconfiguredUploader;

impl AvatarUploader for UnconfiguredUploader {
    fn upload<'a>(
        &'a self,
        _file: &'a SelectedFile,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<String>> + Send + 'a>>
    {
        Box::pin(async { Err(anyhow!("doctors API base url is not configured")) })
    }
}

#[derive(Default)]
struct RuntimeState {
    forms: HashMap<String, FormPersist>,
    visibilities: HashMap<String, FormVisibility>,
    modals: HashMap<String, ModalState<Value>>,
    uploads: HashMap<String, Arc<UploadPipeline>>,
}

/// Host-facing command bridge over the console's state containers.
///
/// Every container instance is addressed by its storage key; the host mounts
/// and releases them the way its views do.
pub struct Runtime {
    config: RuntimeConfig,
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    previews: Arc<dyn PreviewRegistry>,
    uploader: Arc<dyn AvatarUploader>,
    executor: tokio::runtime::Runtime,
    state: Mutex<RuntimeState>,
    callback: CallbackSlot,
}

impl Runtime {
    pub fn new(config_json: &str) -> anyhow::Result<Self> {
        let config = RuntimeConfig::parse(config_json)?;

        let storage: Arc<dyn SessionStorage> = match &config.data_dir {
            Some(dir) => {
                let file_storage = FileSessionStorage::new(PathBuf::from(dir));
                if let Err(error) = file_storage.migrate_if_needed() {
                    warn!(%error, "session storage migration failed");
                }
                Arc::new(file_storage)
            }
            None => Arc::new(MemoryStorage::new()),
        };

        let uploader: Arc<dyn AvatarUploader> = match &config.api_base_url {
            Some(base_url) => Arc::new(HttpDoctorClient::with_config(
                reqwest::Client::new(),
                base_url.clone(),
                config.api_token.clone(),
            )),
            None => Arc::new(UnconfiguredUploader),
        };

        Self::with_collaborators(config, storage, uploader, Arc::new(SystemClock))
    }

    pub fn with_collaborators(
        config: RuntimeConfig,
        storage: Arc<dyn SessionStorage>,
        uploader: Arc<dyn AvatarUploader>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let executor = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("staff-console-io")
            .enable_all()
            .build()
            .context("failed to start staff console executor")?;

        info!(
            file_backed = config.data_dir.is_some(),
            api_configured = config.api_base_url.is_some(),
            "staff console runtime initialised"
        );

        Ok(Self {
            config,
            storage,
            clock,
            previews: Arc::new(ObjectUrlRegistry::new()),
            uploader,
            executor,
            state: Mutex::new(RuntimeState::default()),
            callback: Arc::new(Mutex::new(None)),
        })
    }

    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let mut guard = self.callback.lock().expect("callback mutex poisoned");
        *guard = Some(Arc::new(callback));
    }

    pub fn clear_event_callback(&self) {
        let mut guard = self.callback.lock().expect("callback mutex poisoned");
        *guard = None;
    }

    pub fn invoke_json(&self, request_json: &str) -> String {
        let parsed = serde_json::from_str::<InvokeRequest>(request_json);
        let response = match parsed {
            Ok(request) => self.dispatch(request),
            Err(error) => Err(InvokeError::new(
                "invalid_request",
                format!("invalid request JSON: {error}"),
            )),
        };

        let payload = match response {
            Ok(data) => InvokeResponse {
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(error) => InvokeResponse {
                ok: false,
                data: None,
                error: Some(error),
            },
        };

        serde_json::to_string(&payload).unwrap_or_else(|_| {
            r#"{"ok":false,"error":{"code":"serialization_failure","message":"failed to serialize response"}}"#
                .to_string()
        })
    }

    fn dispatch(&self, request: InvokeRequest) -> Result<Value, InvokeError> {
        debug!(command = %request.command, "dispatching command");
        match request.command.as_str() {
            "get_bootstrap_state" => Ok(self.get_bootstrap_state()),
            "form.mount" => self.mount_form(request.payload),
            "form.change" => self.change_form(request.payload),
            "form.restore" => self.restore_form(request.payload),
            "form.clear" => self.clear_form(request.payload),
            "visibility.set" => self.set_form_visibility(request.payload),
            "visibility.restore" => self.restore_form_visibility(request.payload),
            "visibility.clear" => self.clear_form_visibility(request.payload),
            "modal.set" => self.set_modal(request.payload),
            "modal.restore" => self.restore_modal(request.payload),
            "modal.clear" => self.clear_modal(request.payload),
            "upload.start" => self.start_upload(request.payload),
            "upload.state" => self.upload_state(request.payload),
            "upload.reset" => self.reset_upload(request.payload),
            "upload.release" => self.release_upload(request.payload),
            "session.end" => self.end_session(),
            _ => Err(InvokeError::new(
                "unknown_command",
                format!("unsupported command: {}", request.command),
            )),
        }
    }

    fn get_bootstrap_state(&self) -> Value {
        let storage_backend = if self.config.data_dir.is_some() {
            "file"
        } else {
            "memory"
        };
        let state = self.lock_state();
        json!({
            "platform": std::env::consts::OS,
            "storageBackend": storage_backend,
            "apiConfigured": self.config.api_base_url.is_some(),
            "expiryMinutes": self.config.expiry_minutes,
            "mounted": {
                "forms": state.forms.len(),
                "visibilities": state.visibilities.len(),
                "modals": state.modals.len(),
                "uploads": state.uploads.len()
            }
        })
    }

    fn form_store(&self, key: &str) -> FormPersist {
        FormPersist::with_clock(
            Arc::clone(&self.storage),
            key,
            Arc::clone(&self.clock),
            self.config.persist_options(),
        )
    }

    fn mount_form(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let store = self.form_store(&input.key);
        let restored = store.restore::<Value>();
        self.lock_state().forms.insert(input.key, store);
        Ok(restored.unwrap_or(Value::Null))
    }

    fn change_form(&self, payload: Value) -> Result<Value, InvokeError> {
        #[derive(Deserialize)]
        struct Input {
            key: String,
            values: Value,
        }

        let input = serde_json::from_value::<Input>(payload).map_err(invalid_payload)?;
        let mut state = self.lock_state();
        let store = state
            .forms
            .get_mut(&input.key)
            .ok_or_else(|| not_mounted("form", &input.key))?;
        let armed = store.latch() == MountLatch::Active;
        store.on_values_changed(&input.values);
        Ok(json!({ "persisted": armed }))
    }

    fn restore_form(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        Ok(self
            .form_store(&input.key)
            .restore::<Value>()
            .unwrap_or(Value::Null))
    }

    fn clear_form(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        self.form_store(&input.key).clear();
        Ok(json!({ "cleared": true }))
    }

    fn set_form_visibility(&self, payload: Value) -> Result<Value, InvokeError> {
        #[derive(Deserialize)]
        struct Input {
            key: String,
            open: bool,
        }

        let input = serde_json::from_value::<Input>(payload).map_err(invalid_payload)?;
        let mut state = self.lock_state();
        let visibility = state
            .visibilities
            .entry(input.key.clone())
            .or_insert_with(|| FormVisibility::new(Arc::clone(&self.storage), input.key));
        visibility.set_visibility(input.open);
        Ok(json!({ "isOpen": visibility.is_open() }))
    }

    fn restore_form_visibility(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let mut visibility = FormVisibility::new(Arc::clone(&self.storage), input.key.clone());
        visibility.restore_state();
        let is_open = visibility.is_open();
        self.lock_state().visibilities.insert(input.key, visibility);
        Ok(json!({ "isOpen": is_open }))
    }

    fn clear_form_visibility(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let mut state = self.lock_state();
        match state.visibilities.get_mut(&input.key) {
            Some(visibility) => visibility.clear_state(),
            None => FormVisibility::new(Arc::clone(&self.storage), input.key).clear_state(),
        }
        Ok(json!({ "isOpen": false }))
    }

    fn set_modal(&self, payload: Value) -> Result<Value, InvokeError> {
        #[derive(Deserialize)]
        struct Input {
            key: String,
            open: bool,
            #[serde(default)]
            data: Option<Value>,
        }

        let input = serde_json::from_value::<Input>(payload).map_err(invalid_payload)?;
        let mut state = self.lock_state();
        let modal = state
            .modals
            .entry(input.key.clone())
            .or_insert_with(|| ModalState::new(Arc::clone(&self.storage), input.key));
        modal.set_visibility(input.open, input.data);
        Ok(modal_json(modal))
    }

    fn restore_modal(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let mut modal = ModalState::new(Arc::clone(&self.storage), input.key.clone());
        modal.restore_state();
        let response = modal_json(&modal);
        self.lock_state().modals.insert(input.key, modal);
        Ok(response)
    }

    fn clear_modal(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let mut state = self.lock_state();
        match state.modals.get_mut(&input.key) {
            Some(modal) => modal.clear_state(),
            None => ModalState::<Value>::new(Arc::clone(&self.storage), input.key).clear_state(),
        }
        Ok(json!({ "isOpen": false, "editData": null }))
    }

    fn start_upload(&self, payload: Value) -> Result<Value, InvokeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Input {
            key: String,
            file_name: String,
            mime_type: String,
            bytes_base64: String,
            #[serde(default)]
            initial_avatar: Option<String>,
        }

        let input = serde_json::from_value::<Input>(payload).map_err(invalid_payload)?;
        if !input.mime_type.starts_with("image/") {
            return Err(InvokeError::new(
                "invalid_payload",
                format!("avatar must be an image, got {}", input.mime_type),
            ));
        }
        let bytes = BASE64.decode(input.bytes_base64.as_bytes()).map_err(|error| {
            InvokeError::new("invalid_payload", format!("bytesBase64 is not valid base64: {error}"))
        })?;
        let file = SelectedFile::new(input.file_name, input.mime_type, bytes);
        if file.is_empty() {
            return Err(InvokeError::new("invalid_payload", "avatar file is empty"));
        }

        let pipeline = {
            let mut state = self.lock_state();
            let pipeline = state
                .uploads
                .entry(input.key.clone())
                .or_insert_with(|| self.new_pipeline(&input.key, input.initial_avatar));
            Arc::clone(pipeline)
        };

        let accepted = pipeline
            .spawn_upload(self.executor.handle(), file)
            .is_some();
        Ok(json!({ "accepted": accepted, "state": pipeline.state() }))
    }

    fn upload_state(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let pipeline = self.pipeline(&input.key)?;
        Ok(state_json(&pipeline.state()))
    }

    fn reset_upload(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let pipeline = self.pipeline(&input.key)?;
        pipeline.reset_upload();
        Ok(state_json(&pipeline.state()))
    }

    fn release_upload(&self, payload: Value) -> Result<Value, InvokeError> {
        let input = serde_json::from_value::<KeyInput>(payload).map_err(invalid_payload)?;
        let released = self.lock_state().uploads.remove(&input.key).is_some();
        Ok(json!({ "released": released }))
    }

    fn end_session(&self) -> Result<Value, InvokeError> {
        self.storage
            .clear()
            .map_err(|error| InvokeError::new("storage_failure", error.to_string()))?;
        let uploads = {
            let mut state = self.lock_state();
            let uploads = std::mem::take(&mut state.uploads);
            *state = RuntimeState::default();
            uploads
        };
        drop(uploads);
        emit_event(&self.callback, EVENT_SESSION_ENDED, &json!({}));
        Ok(json!({ "ended": true }))
    }

    fn new_pipeline(&self, key: &str, initial_avatar: Option<String>) -> Arc<UploadPipeline> {
        let callback = Arc::clone(&self.callback);
        let key = key.to_string();
        let pipeline = UploadPipeline::new(
            Arc::clone(&self.uploader),
            Arc::clone(&self.previews),
            initial_avatar,
        )
        .with_listener(Arc::new(move |state: &UploadState| {
            emit_event(
                &callback,
                EVENT_UPLOAD_STATE,
                &json!({ "key": key, "state": state }),
            );
        }));
        Arc::new(pipeline)
    }

    fn pipeline(&self, key: &str) -> Result<Arc<UploadPipeline>, InvokeError> {
        self.lock_state()
            .uploads
            .get(key)
            .cloned()
            .ok_or_else(|| not_mounted("upload", key))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().expect("runtime state mutex poisoned")
    }
}

#[derive(Deserialize)]
struct KeyInput {
    key: String,
}

fn modal_json(modal: &ModalState<Value>) -> Value {
    json!({ "isOpen": modal.is_open(), "editData": modal.edit_data() })
}

fn state_json(state: &UploadState) -> Value {
    serde_json::to_value(state).unwrap_or_else(|_| json!({}))
}

fn not_mounted(kind: &str, key: &str) -> InvokeError {
    InvokeError::new("not_mounted", format!("no {kind} mounted for key {key}"))
}

fn emit_event(slot: &Mutex<Option<SharedCallback>>, event: &str, payload: &Value) {
    let callback = {
        let guard = slot.lock().expect("callback mutex poisoned");
        guard.clone()
    };
    if let Some(callback) = callback {
        let event_payload = json!({
            "event": event,
            "payload": payload
        });
        callback(event, &event_payload);
    }
}
