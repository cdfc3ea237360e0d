//! C-callable surface of the QDL engine, declared in `include/qdl-bridge.h`.
//!
//! Every entry point catches panics and reports them as `QDL_ERR_GENERIC`.
//! No tracing subscriber is installed here; that is the host's business.

use std::ffi::{CStr, CString, c_char, c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use qdl_core::{
    BroadcastObserver, Device, DeviceRegistry, Mode, ProgressEvent, Session, SessionConfig,
    Status, StorageType, set_progress_sink,
};
use tracing::{error, warn};

pub const QDL_OK: c_int = Status::Ok as c_int;
pub const QDL_ERR_GENERIC: c_int = Status::Generic as c_int;
pub const QDL_ERR_DEVICE_NOT_FOUND: c_int = Status::DeviceNotFound as c_int;
pub const QDL_ERR_FLASH_FAILED: c_int = Status::FlashFailed as c_int;
pub const QDL_ERR_PROVISION_FAILED: c_int = Status::ProvisionFailed as c_int;

const FIELD_LEN: usize = 64;

/// `qdl_device_info_t`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QdlDeviceInfo {
    pub serial: [c_char; FIELD_LEN],
    pub product: [c_char; FIELD_LEN],
}

impl Default for QdlDeviceInfo {
    fn default() -> Self {
        Self {
            serial: [0; FIELD_LEN],
            product: [0; FIELD_LEN],
        }
    }
}

impl QdlDeviceInfo {
    fn from_device(device: &Device) -> Self {
        let mut info = Self::default();
        copy_c_string(&mut info.serial, &device.serial);
        copy_c_string(&mut info.product, &device.product);
        info
    }
}

/// Copy `src` NUL-terminated into `dst`, cut at a char boundary to fit.
fn copy_c_string(dst: &mut [c_char; FIELD_LEN], src: &str) {
    let mut end = src.len().min(FIELD_LEN - 1);
    while !src.is_char_boundary(end) {
        end -= 1;
    }
    for (slot, byte) in dst.iter_mut().zip(&src.as_bytes()[..end]) {
        *slot = *byte as c_char;
    }
    dst[end] = 0;
}

/// `qdl_progress_cb_t`
pub type QdlProgressCb = Option<
    unsafe extern "C" fn(task: *const c_char, value: c_uint, total: c_uint, userdata: *mut c_void),
>;

/// Shift `value` and `total` right together until both fit 32 bits.
fn scale_to_u32(value: u64, total: u64) -> (u32, u32) {
    let max = value.max(total);
    if max <= u64::from(u32::MAX) {
        return (value as u32, total as u32);
    }
    let shift = 32 - max.leading_zeros();
    ((value >> shift) as u32, (total >> shift) as u32)
}

fn registry() -> &'static DeviceRegistry {
    static REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();
    REGISTRY.get_or_init(DeviceRegistry::usb)
}

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(_) => {
            error!("Panic caught at the C boundary");
            fallback
        }
    }
}

/// Borrow a C string. Null maps to `None`; invalid UTF-8 is an error.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn opt_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, String> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|e| format!("string argument is not UTF-8: {e}"))
}

fn list_into(registry: &DeviceRegistry, out: &mut [QdlDeviceInfo]) -> c_int {
    match registry.list_devices(out.len()) {
        Ok(found) => {
            for (slot, device) in out.iter_mut().zip(&found) {
                *slot = QdlDeviceInfo::from_device(device);
            }
            c_int::try_from(found.len()).unwrap_or(0)
        }
        Err(e) => {
            warn!(error = %e, "Device scan failed");
            0
        }
    }
}

fn run_with(registry: &DeviceRegistry, config: SessionConfig) -> c_int {
    let mut session = Session::with_observer(config, registry.clone(), Arc::new(BroadcastObserver));
    session.run_status().code()
}

/// Arguments of `qdl_run` after conversion.
struct RunArgs {
    mode: c_int,
    serial: *const c_char,
    storage_type: c_int,
    prog_mbn: *const c_char,
    xml_files: *const *const c_char,
    xml_file_count: c_int,
    allow_missing: bool,
    include_dir: *const c_char,
    out_chunk_size: c_uint,
}

impl RunArgs {
    /// # Safety
    /// Pointers must satisfy the contract documented on `qdl_run`.
    unsafe fn into_config(self) -> Result<SessionConfig, String> {
        let mode = Mode::from_raw(self.mode).ok_or_else(|| format!("invalid mode {}", self.mode))?;
        let storage = StorageType::from_raw(self.storage_type)
            .ok_or_else(|| format!("invalid storage type {}", self.storage_type))?;
        let programmer = unsafe { opt_str(self.prog_mbn) }?
            .filter(|s| !s.is_empty())
            .ok_or("programmer path is required")?;

        let count = usize::try_from(self.xml_file_count)
            .map_err(|_| format!("invalid script count {}", self.xml_file_count))?;
        let mut scripts = Vec::with_capacity(count);
        if count > 0 {
            if self.xml_files.is_null() {
                return Err("script array is null".into());
            }
            let ptrs = unsafe { std::slice::from_raw_parts(self.xml_files, count) };
            for &ptr in ptrs {
                let path = unsafe { opt_str(ptr) }?.ok_or("null script path")?;
                scripts.push(PathBuf::from(path));
            }
        }

        Ok(SessionConfig {
            mode,
            serial: unsafe { opt_str(self.serial) }?
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            storage,
            programmer: Some(PathBuf::from(programmer)),
            scripts,
            allow_missing: self.allow_missing,
            include_dir: unsafe { opt_str(self.include_dir) }?
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            out_chunk_size: usize::try_from(self.out_chunk_size).ok().filter(|&n| n > 0),
            ..Default::default()
        })
    }
}

/// Fill up to `max_devices` entries of `devices` and return how many were written.
///
/// # Safety
/// `devices` must be null or valid for `max_devices` writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qdl_list_devices(
    devices: *mut QdlDeviceInfo,
    max_devices: c_int,
) -> c_int {
    if devices.is_null() || max_devices <= 0 {
        return 0;
    }
    guarded(0, || {
        let out = unsafe { std::slice::from_raw_parts_mut(devices, max_devices as usize) };
        list_into(registry(), out)
    })
}

/// Run one flash or provision session and return a `qdl_error_t`.
///
/// # Safety
/// String arguments must be null or NUL-terminated. `xml_files` must be
/// null or point to `xml_file_count` such strings.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn qdl_run(
    mode: c_int,
    serial: *const c_char,
    storage_type: c_int,
    prog_mbn: *const c_char,
    xml_files: *const *const c_char,
    xml_file_count: c_int,
    allow_missing: bool,
    include_dir: *const c_char,
    out_chunk_size: c_uint,
) -> c_int {
    let args = RunArgs {
        mode,
        serial,
        storage_type,
        prog_mbn,
        xml_files,
        xml_file_count,
        allow_missing,
        include_dir,
        out_chunk_size,
    };
    guarded(QDL_ERR_GENERIC, || match unsafe { args.into_config() } {
        Ok(config) => run_with(registry(), config),
        Err(message) => {
            warn!(%message, "qdl_run rejected its arguments");
            QDL_ERR_GENERIC
        }
    })
}

/// Register the progress callback. Null clears it.
#[unsafe(no_mangle)]
pub extern "C" fn qdl_set_progress_callback(cb: QdlProgressCb, userdata: *mut c_void) {
    let Some(cb) = cb else {
        set_progress_sink(None);
        return;
    };
    // Raw pointers are not Send; the host owns what this points at.
    let userdata = userdata as usize;
    set_progress_sink(Some(Arc::new(move |event: &ProgressEvent| {
        let (value, total) = scale_to_u32(event.value, event.total);
        let task = CString::new(event.task.replace('\0', "")).unwrap_or_default();
        unsafe { cb(task.as_ptr(), value, total, userdata as *mut c_void) };
    })));
}

/// Static, NUL-terminated crate version.
#[unsafe(no_mangle)]
pub extern "C" fn qdl_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr().cast()
}
