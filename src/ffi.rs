//! C ABI for the native app and its monitor extension.
//!
//! Each process opens its own core over the shared data directory. Values
//! cross the boundary as JSON strings; every returned string must be released
//! with `toiletime_string_free`.
//!
//! The host reports its own shield and monitor by registering callbacks
//! before `toiletime_core_open`. Without them the store-backed
//! implementations are used.

use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::{ScheduleError, UnlockRequestError};
use crate::logging;
use crate::models::{
    ActivityName, ApplicationToken, CategoryToken, DeviceActivitySchedule, MonitorEvent,
    RestrictionSet,
};
use crate::platform::{
    AuthorizationStatus, MonitorCenter, ShieldConfig, ShieldSettings, SharedMonitorCenter,
    SharedShield, StaticAuthorization,
};
use crate::AppState;

/// Receives the full shield configuration as JSON after every change.
pub type ShieldCallback = extern "C" fn(config_json: *const c_char);
/// Registers an interval; `0` is success, anything else a refusal.
pub type StartMonitoringCallback =
    extern "C" fn(activity: *const c_char, schedule_json: *const c_char) -> i32;
pub type StopMonitoringCallback = extern "C" fn(activities_json: *const c_char);

static SHIELD_CALLBACK: RwLock<Option<ShieldCallback>> = RwLock::new(None);
static MONITOR_CALLBACKS: RwLock<Option<(StartMonitoringCallback, StopMonitoringCallback)>> =
    RwLock::new(None);

/// Opaque handle owned by the host.
pub struct ToiletimeCore {
    runtime: Runtime,
    app: AppState,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum Reply<T> {
    Ok { value: T },
    Error { kind: &'static str, message: String },
}

fn error_kind(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<UnlockRequestError>() {
        Some(UnlockRequestError::AuthorizationDenied) => "authorizationDenied",
        Some(UnlockRequestError::NoSelection) => "noSelection",
        Some(UnlockRequestError::InvalidDuration) => "invalidDuration",
        Some(UnlockRequestError::NotAToilet) => "notAToilet",
        None => "failed",
    }
}

fn reply<T: Serialize>(result: Result<T>) -> *mut c_char {
    let reply = match result {
        Ok(value) => Reply::Ok { value },
        Err(err) => {
            log::warn!("FFI call failed: {err:#}");
            Reply::Error {
                kind: error_kind(&err),
                message: err.to_string(),
            }
        }
    };
    match serde_json::to_string(&reply) {
        Ok(json) => into_c_string(json),
        Err(_) => ptr::null_mut(),
    }
}

fn into_c_string(value: String) -> *mut c_char {
    match CString::new(value) {
        Ok(s) => s.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

unsafe fn c_str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(anyhow!("{name} is null"));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|err| anyhow!("{name} is not UTF-8: {err}"))
}

fn read_lock<T: Copy>(lock: &RwLock<Option<T>>) -> Option<T> {
    match lock.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<Option<T>>, value: Option<T>) {
    match lock.write() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

/// Store-backed shield that also pushes each new configuration to the host.
struct NativeShield {
    inner: SharedShield,
    callback: ShieldCallback,
}

impl NativeShield {
    fn publish(&self) -> Result<()> {
        let json = serde_json::to_string(&self.inner.current()?)?;
        let c_json = CString::new(json)?;
        (self.callback)(c_json.as_ptr());
        Ok(())
    }
}

impl ShieldSettings for NativeShield {
    fn set_applications(&self, applications: Option<BTreeSet<ApplicationToken>>) -> Result<()> {
        self.inner.set_applications(applications)?;
        self.publish()
    }

    fn set_categories(&self, categories: Option<BTreeSet<CategoryToken>>) -> Result<()> {
        self.inner.set_categories(categories)?;
        self.publish()
    }

    fn current(&self) -> Result<ShieldConfig> {
        self.inner.current()
    }
}

/// Forwards registrations to the host's interval monitor.
struct NativeMonitorCenter {
    start: StartMonitoringCallback,
    stop: StopMonitoringCallback,
    registered: Mutex<Vec<ActivityName>>,
}

impl NativeMonitorCenter {
    fn registered(&self) -> MutexGuard<'_, Vec<ActivityName>> {
        match self.registered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MonitorCenter for NativeMonitorCenter {
    fn start_monitoring(
        &self,
        activity: &ActivityName,
        schedule: &DeviceActivitySchedule,
    ) -> Result<(), ScheduleError> {
        let unavailable = |err: String| ScheduleError::Unavailable(err);
        let name = CString::new(activity.as_str()).map_err(|err| unavailable(err.to_string()))?;
        let schedule_json = serde_json::to_string(schedule)
            .ok()
            .and_then(|json| CString::new(json).ok())
            .ok_or_else(|| unavailable("schedule is not encodable".into()))?;

        let code = (self.start)(name.as_ptr(), schedule_json.as_ptr());
        if code != 0 {
            return Err(unavailable(format!("host refused registration (code {code})")));
        }

        self.registered().push(activity.clone());
        Ok(())
    }

    fn stop_monitoring(&self, activities: &[ActivityName]) {
        let names: Vec<&str> = activities.iter().map(ActivityName::as_str).collect();
        match serde_json::to_string(&names).map(CString::new) {
            Ok(Ok(json)) => (self.stop)(json.as_ptr()),
            _ => log::warn!("Could not encode activities {names:?} for the host"),
        }
        self.registered().retain(|name| !activities.contains(name));
    }

    fn activities(&self) -> Result<Vec<ActivityName>> {
        Ok(self.registered().clone())
    }
}

fn open_core(data_dir: Option<PathBuf>) -> Result<ToiletimeCore> {
    logging::init();
    let config = match data_dir {
        Some(dir) => AppConfig::load_from(&dir)?,
        None => AppConfig::load()?,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let db = Database::new(config.store_path())?;
    let shield: Arc<dyn ShieldSettings> = match read_lock(&SHIELD_CALLBACK) {
        Some(callback) => Arc::new(NativeShield {
            inner: SharedShield::new(db.clone()),
            callback,
        }),
        None => Arc::new(SharedShield::new(db.clone())),
    };
    let center: Arc<dyn MonitorCenter> = match read_lock(&MONITOR_CALLBACKS) {
        Some((start, stop)) => Arc::new(NativeMonitorCenter {
            start,
            stop,
            registered: Mutex::new(Vec::new()),
        }),
        None => Arc::new(SharedMonitorCenter::new(db.clone(), config.monitor_limits())),
    };
    let authorization = Arc::new(StaticAuthorization(AuthorizationStatus::Approved));

    let app = AppState::with_platform(config, db, shield, center, authorization);
    Ok(ToiletimeCore { runtime, app })
}

/// Register the host's shield. Affects cores opened afterwards.
#[no_mangle]
pub extern "C" fn toiletime_set_shield_callback(callback: Option<ShieldCallback>) {
    write_lock(&SHIELD_CALLBACK, callback);
}

/// Register the host's interval monitor. Affects cores opened afterwards.
#[no_mangle]
pub extern "C" fn toiletime_set_monitor_callbacks(
    start: Option<StartMonitoringCallback>,
    stop: Option<StopMonitoringCallback>,
) {
    write_lock(&MONITOR_CALLBACKS, start.zip(stop));
}

/// Open a core over `data_dir`, or the default data directory when null.
/// Returns null on failure.
///
/// # Safety
/// `data_dir` must be null or a valid UTF-8 C string.
#[no_mangle]
pub unsafe extern "C" fn toiletime_core_open(data_dir: *const c_char) -> *mut ToiletimeCore {
    let data_dir = if data_dir.is_null() {
        None
    } else {
        match c_str_arg(data_dir, "data_dir") {
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => return ptr::null_mut(),
        }
    };

    match open_core(data_dir) {
        Ok(core) => Box::into_raw(Box::new(core)),
        Err(err) => {
            log::error!("Failed to open core: {err:#}");
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `handle` must come from `toiletime_core_open` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn toiletime_core_free(handle: *mut ToiletimeCore) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Commit the picker selection, `{"apps": [...], "categories": [...]}`.
///
/// # Safety
/// `handle` must be valid and `selection_json` a valid UTF-8 C string.
#[no_mangle]
pub unsafe extern "C" fn toiletime_commit_selection(
    handle: *mut ToiletimeCore,
    selection_json: *const c_char,
) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let core = &*handle;
    let result = c_str_arg(selection_json, "selection_json").and_then(|json| {
        let set: RestrictionSet = serde_json::from_str(json)?;
        core.runtime.block_on(core.app.selection().commit(set))
    });
    reply(result)
}

/// Gate and start an unlock of `minutes`.
///
/// # Safety
/// `handle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn toiletime_request_unlock(
    handle: *mut ToiletimeCore,
    minutes: u32,
) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let core = &*handle;
    reply(core.runtime.block_on(core.app.request_unlock(minutes)))
}

/// End the current unlock now.
///
/// # Safety
/// `handle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn toiletime_cancel_unlock(handle: *mut ToiletimeCore) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let core = &*handle;
    reply(core.runtime.block_on(core.app.scheduler.cancel()))
}

/// Deliver an interval callback (`start`, `warning` or `end`) for `activity`.
/// This is the monitor extension's entry point.
///
/// # Safety
/// `handle` must be valid; `event` and `activity` valid UTF-8 C strings.
#[no_mangle]
pub unsafe extern "C" fn toiletime_monitor_event(
    handle: *mut ToiletimeCore,
    event: *const c_char,
    activity: *const c_char,
) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let core = &*handle;
    let result = c_str_arg(event, "event").and_then(|event| {
        let event: MonitorEvent = event.parse()?;
        let activity = ActivityName::new(c_str_arg(activity, "activity")?);
        core.runtime.block_on(core.app.monitor.handle(event, &activity))
    });
    reply(result)
}

/// # Safety
/// `handle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn toiletime_restore_on_launch(handle: *mut ToiletimeCore) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let core = &*handle;
    reply(core.runtime.block_on(core.app.restore_on_launch()))
}

/// # Safety
/// `handle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn toiletime_status(handle: *mut ToiletimeCore) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let core = &*handle;
    reply(core.runtime.block_on(core.app.status()))
}

/// # Safety
/// `value` must be null or a string returned by this library.
#[no_mangle]
pub unsafe extern "C" fn toiletime_string_free(value: *mut c_char) {
    if !value.is_null() {
        drop(CString::from_raw(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    fn take_json(ptr: *mut c_char) -> Value {
        assert!(!ptr.is_null());
        let json = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        unsafe { toiletime_string_free(ptr) };
        serde_json::from_str(&json).unwrap()
    }

    fn open(dir: &std::path::Path) -> *mut ToiletimeCore {
        fs_config(dir);
        let path = CString::new(dir.to_str().unwrap()).unwrap();
        let core = unsafe { toiletime_core_open(path.as_ptr()) };
        assert!(!core.is_null());
        core
    }

    fn fs_config(dir: &std::path::Path) {
        std::fs::write(dir.join("config.json"), r#"{"settle_delay_ms": 1}"#).unwrap();
    }

    #[test]
    fn selection_unlock_and_monitor_end_through_the_abi() {
        let dir = tempdir().unwrap();
        let core = open(dir.path());

        let selection = CString::new(r#"{"apps":["appsA"],"categories":["catsB"]}"#).unwrap();
        let committed = take_json(unsafe { toiletime_commit_selection(core, selection.as_ptr()) });
        assert_eq!(committed["status"], "ok");
        assert_eq!(committed["value"]["outcome"], "applied");

        let ticket = take_json(unsafe { toiletime_request_unlock(core, 5) });
        assert_eq!(ticket["status"], "ok");
        assert_eq!(ticket["value"]["path"]["path"], "monitored");

        let status = take_json(unsafe { toiletime_status(core) });
        assert_eq!(status["value"]["shield"]["applications"], Value::Null);

        let event = CString::new("end").unwrap();
        let activity = CString::new("unlock").unwrap();
        let ended = take_json(unsafe { toiletime_monitor_event(core, event.as_ptr(), activity.as_ptr()) });
        assert_eq!(ended["value"]["action"], "relocked");
        assert_eq!(ended["value"]["restrictions"]["apps"][0], "appsA");

        unsafe { toiletime_core_free(core) };
    }

    #[test]
    fn gate_refusals_carry_a_kind() {
        let dir = tempdir().unwrap();
        let core = open(dir.path());

        let refused = take_json(unsafe { toiletime_request_unlock(core, 5) });
        assert_eq!(refused["status"], "error");
        assert_eq!(refused["kind"], "noSelection");

        let refused = take_json(unsafe { toiletime_request_unlock(core, 0) });
        assert_eq!(refused["kind"], "invalidDuration");

        unsafe { toiletime_core_free(core) };
    }

    #[test]
    fn bad_arguments_are_errors_not_crashes() {
        let dir = tempdir().unwrap();
        let core = open(dir.path());

        let bogus = CString::new("sometime").unwrap();
        let activity = CString::new("unlock").unwrap();
        let reply = take_json(unsafe { toiletime_monitor_event(core, bogus.as_ptr(), activity.as_ptr()) });
        assert_eq!(reply["kind"], "failed");

        let reply = take_json(unsafe { toiletime_commit_selection(core, ptr::null()) });
        assert_eq!(reply["status"], "error");

        assert!(unsafe { toiletime_status(ptr::null_mut()) }.is_null());
        unsafe { toiletime_core_free(core) };
    }

    static PUBLISHED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    extern "C" fn record_shield(config_json: *const c_char) {
        let json = unsafe { CStr::from_ptr(config_json) }.to_str().unwrap().to_string();
        PUBLISHED.lock().unwrap().push(json);
    }

    #[test]
    fn native_shield_publishes_every_write() {
        let db = Database::in_memory().unwrap();
        let shield = NativeShield {
            inner: SharedShield::new(db),
            callback: record_shield,
        };

        shield
            .set_applications(Some([ApplicationToken::new("appsA")].into_iter().collect()))
            .unwrap();
        shield.set_categories(None).unwrap();

        let published = PUBLISHED.lock().unwrap().clone();
        assert_eq!(published.len(), 2);
        let last: ShieldConfig = serde_json::from_str(&published[1]).unwrap();
        assert_eq!(last.applications.map(|apps| apps.len()), Some(1));
        assert_eq!(last.categories, None);
    }

    extern "C" fn refuse_start(_activity: *const c_char, _schedule: *const c_char) -> i32 {
        7
    }

    extern "C" fn ignore_stop(_activities: *const c_char) {}

    #[test]
    fn host_refusal_is_a_schedule_error() {
        let center = NativeMonitorCenter {
            start: refuse_start,
            stop: ignore_stop,
            registered: Mutex::new(Vec::new()),
        };
        let window = crate::models::UnlockWindow::starting_at(
            ActivityName::unlock(),
            chrono::Utc::now(),
            std::time::Duration::from_secs(300),
            std::time::Duration::from_secs(30),
        )
        .unwrap();
        let err = center
            .start_monitoring(&ActivityName::unlock(), &DeviceActivitySchedule::for_window(&window))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Unavailable(message) if message.contains("code 7")));
        assert!(center.activities().unwrap().is_empty());
    }
}
