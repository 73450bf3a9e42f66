//! C ABI over the staff console runtime.
//!
//! Every entry point answers with JSON and never unwinds into the host.
//! Events reach the host as `(event_name, payload_json, user_data)`, where
//! the name is one of `upload://state` or `session://ended`.

use std::{
    ffi::{c_char, c_void, CStr, CString},
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::{Arc, Once, PoisonError, RwLock},
};

use serde_json::{json, Value};
use staff_console_core::Runtime;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

pub type ScEventCallback = unsafe extern "C" fn(
    event_name: *const c_char,
    payload_json: *const c_char,
    user_data: *mut c_void,
);

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_env("STAFF_CONSOLE_LOG")
                    .unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .without_time()
            .try_init();
    });
}

#[derive(Clone, Copy)]
struct HostCallback {
    callback: ScEventCallback,
    user_data: usize,
}

/// Host callback slot shared with the runtime's executor threads.
///
/// Deliveries hold the read lock for the whole host call, so `detach`
/// returns only once no executor thread is still inside the host.
#[derive(Default)]
struct EventSink {
    host: RwLock<Option<HostCallback>>,
}

impl EventSink {
    fn attach(&self, host: Option<HostCallback>) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = host;
    }

    fn detach(&self) {
        self.attach(None);
    }

    fn deliver(&self, event: &str, envelope: &Value) {
        let guard = self.host.read().unwrap_or_else(PoisonError::into_inner);
        let Some(host) = *guard else {
            return;
        };

        let payload = envelope.get("payload").unwrap_or(envelope).to_string();
        let (Ok(c_event), Ok(c_payload)) = (CString::new(event), CString::new(payload)) else {
            error!(event, "dropping event containing an interior NUL");
            return;
        };
        unsafe {
            (host.callback)(
                c_event.as_ptr(),
                c_payload.as_ptr(),
                host.user_data as *mut c_void,
            )
        };
    }
}

pub struct ScRuntimeHandle {
    runtime: Runtime,
    events: Arc<EventSink>,
}

/// Creates a runtime from a JSON config (`dataDir`, `apiBaseUrl`, `apiToken`,
/// `expiryMinutes`). Returns null when the config is rejected.
///
/// # Safety
///
/// `config_json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sc_runtime_new(config_json: *const c_char) -> *mut ScRuntimeHandle {
    init_tracing();

    let config = if config_json.is_null() {
        ""
    } else {
        match CStr::from_ptr(config_json).to_str() {
            Ok(value) => value,
            Err(error) => {
                error!(%error, "runtime config is not UTF-8");
                return ptr::null_mut();
            }
        }
    };

    let built = panic::catch_unwind(|| Runtime::new(config));
    let runtime = match built {
        Ok(Ok(runtime)) => runtime,
        Ok(Err(error)) => {
            error!(error = %format!("{error:#}"), "failed to create staff console runtime");
            return ptr::null_mut();
        }
        Err(_) => {
            error!("staff console runtime panicked during start-up");
            return ptr::null_mut();
        }
    };

    let events = Arc::new(EventSink::default());
    let sink = Arc::clone(&events);
    runtime.set_event_callback(move |event, envelope| sink.deliver(event, envelope));

    Box::into_raw(Box::new(ScRuntimeHandle { runtime, events }))
}

/// Releases the runtime. Blocks until any event delivery already inside the
/// host callback has returned; no callback fires after this returns.
///
/// # Safety
///
/// `handle` must be null or a pointer returned by `sc_runtime_new` that has
/// not been freed. Must not be called from inside the event callback.
#[no_mangle]
pub unsafe extern "C" fn sc_runtime_free(handle: *mut ScRuntimeHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    handle.events.detach();
    handle.runtime.clear_event_callback();
    debug!("staff console runtime released");
}

/// Registers (or, with a null callback, removes) the host event callback.
///
/// # Safety
///
/// `handle` must be null or a live pointer from `sc_runtime_new`. The
/// callback may run on an executor thread and must not call back into
/// `sc_set_event_callback` or `sc_runtime_free`.
#[no_mangle]
pub unsafe extern "C" fn sc_set_event_callback(
    handle: *mut ScRuntimeHandle,
    callback: Option<ScEventCallback>,
    user_data: *mut c_void,
) {
    let Some(handle) = handle.as_ref() else {
        return;
    };
    handle.events.attach(callback.map(|callback| HostCallback {
        callback,
        user_data: user_data as usize,
    }));
}

/// Runs one `{command, payload}` request and returns the `{ok, data, error}`
/// response.
///
/// # Safety
///
/// `handle` must be null or a live pointer from `sc_runtime_new`;
/// `request_json` must be null or a valid NUL-terminated string. The returned
/// string must be released with `sc_free_c_string`.
#[no_mangle]
pub unsafe extern "C" fn sc_invoke_json(
    handle: *mut ScRuntimeHandle,
    request_json: *const c_char,
) -> *mut c_char {
    let Some(handle) = handle.as_ref() else {
        return error_response("invalid_handle", "runtime handle is null");
    };
    if request_json.is_null() {
        return error_response("invalid_request", "request_json is null");
    }
    let request = match CStr::from_ptr(request_json).to_str() {
        Ok(value) => value,
        Err(error) => {
            return error_response(
                "invalid_request",
                &format!("request_json must be UTF-8: {error}"),
            );
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handle.runtime.invoke_json(request))) {
        Ok(response) => into_c_string(response),
        Err(_) => {
            error!("command handler panicked");
            error_response("internal_error", "command handler panicked")
        }
    }
}

/// # Safety
///
/// `ptr` must be null or a string returned by `sc_invoke_json`.
#[no_mangle]
pub unsafe extern "C" fn sc_free_c_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

fn error_response(code: &str, message: &str) -> *mut c_char {
    into_c_string(json!({ "ok": false, "error": { "code": code, "message": message } }).to_string())
}

fn into_c_string(value: String) -> *mut c_char {
    // serde_json escapes control characters, so a NUL only appears via a bug.
    let value = if value.contains('\0') {
        value.replace('\0', "\\u0000")
    } else {
        value
    };
    CString::new(value).unwrap_or_default().into_raw()
}
