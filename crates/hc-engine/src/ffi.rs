//! Native engine symbol table.
//!
//! This is the only module that handles raw pointers. Every buffer crossing
//! the boundary is copied into or out of an owned `Vec` before a function
//! here returns.
//!
//! Expected C ABI:
//!
//! ```c
//! int  initialize(const char* config_path);
//! int  update(double dt);
//! int  finalize(void);
//! void get_start_time(double* t);
//! void get_end_time(double* t);
//! void get_time_step(double* t);
//! void get_current_time(double* t);
//! int  get_var_type(const char* name, int* type_code);   // 0 = double, 1 = int
//! int  get_var_count(const char* name, int* count);
//! int  get_var(const char* name, void* dest, int count);
//! int  set_var(const char* name, int type_code, const void* src, int count);
//! void set_logger(void (*cb)(void* user_data, int level, const char* msg), void* user_data);
//! ```

use std::ffi::{CStr, CString, c_char, c_double, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use libloading::Library;
use tracing::debug;

use crate::api::{EngineApi, EngineOffsets};
use crate::error::{EngineError, EngineResult};
use crate::handle::ReturnCode;
use crate::relay::MessageRelay;
use crate::settings::LogLevel;
use crate::values::{MAX_VAR_LEN, VarType, VarValues};

type InitializeFn = unsafe extern "C" fn(config_path: *const c_char) -> c_int;
type UpdateFn = unsafe extern "C" fn(dt: c_double) -> c_int;
type FinalizeFn = unsafe extern "C" fn() -> c_int;
type TimeFn = unsafe extern "C" fn(value: *mut c_double);
type VarQueryFn = unsafe extern "C" fn(name: *const c_char, out: *mut c_int) -> c_int;
type GetVarFn =
    unsafe extern "C" fn(name: *const c_char, dest: *mut c_void, count: c_int) -> c_int;
type SetVarFn = unsafe extern "C" fn(
    name: *const c_char,
    type_code: c_int,
    src: *const c_void,
    count: c_int,
) -> c_int;
type LoggerFn =
    unsafe extern "C" fn(user_data: *mut c_void, level: c_int, message: *const c_char);
type SetLoggerFn = unsafe extern "C" fn(callback: Option<LoggerFn>, user_data: *mut c_void);

struct Symbols {
    initialize: InitializeFn,
    update: UpdateFn,
    finalize: FinalizeFn,
    get_start_time: TimeFn,
    get_end_time: TimeFn,
    get_time_step: TimeFn,
    get_current_time: TimeFn,
    get_var_type: VarQueryFn,
    get_var_count: VarQueryFn,
    get_var: GetVarFn,
    set_var: SetVarFn,
    set_logger: SetLoggerFn,
}

impl Symbols {
    fn resolve(library: &Library) -> EngineResult<Self> {
        Ok(Self {
            initialize: symbol(library, "initialize")?,
            update: symbol(library, "update")?,
            finalize: symbol(library, "finalize")?,
            get_start_time: symbol(library, "get_start_time")?,
            get_end_time: symbol(library, "get_end_time")?,
            get_time_step: symbol(library, "get_time_step")?,
            get_current_time: symbol(library, "get_current_time")?,
            get_var_type: symbol(library, "get_var_type")?,
            get_var_count: symbol(library, "get_var_count")?,
            get_var: symbol(library, "get_var")?,
            set_var: symbol(library, "set_var")?,
            set_logger: symbol(library, "set_logger")?,
        })
    }
}

fn symbol<T: Copy>(library: &Library, name: &'static str) -> EngineResult<T> {
    // SAFETY: each call site pairs `name` with the fn pointer type of the ABI above.
    let found = unsafe { library.get::<T>(name.as_bytes()) }.map_err(|e| {
        EngineError::MissingSymbol {
            symbol: name,
            message: e.to_string(),
        }
    })?;
    Ok(*found)
}

fn c_string(name: &str) -> EngineResult<CString> {
    CString::new(name).map_err(|_| EngineError::InvalidName {
        name: name.to_string(),
    })
}

fn read_time(getter: TimeFn) -> f64 {
    let mut value: c_double = 0.0;
    // SAFETY: the engine writes one double through a valid, aligned pointer.
    unsafe { getter(&mut value) };
    value
}

/// Callback handed to `set_logger`; `user_data` is the registered relay.
unsafe extern "C" fn relay_message(user_data: *mut c_void, level: c_int, message: *const c_char) {
    if user_data.is_null() || message.is_null() {
        return;
    }
    // Panics must not unwind into foreign frames.
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `user_data` is `Arc::as_ptr` of a relay kept alive by NativeEngine
        // until the callback is unregistered.
        let relay = unsafe { &*(user_data as *const MessageRelay) };
        // SAFETY: the engine passes a NUL-terminated string valid for this call.
        let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        relay.publish(LogLevel::from_code(level), &text);
    }));
}

/// A loaded engine library.
pub struct NativeEngine {
    symbols: Symbols,
    relay: Option<Arc<MessageRelay>>,
    path: PathBuf,
    // Declared last so it is dropped after the symbols that point into it.
    _library: Library,
}

impl NativeEngine {
    pub fn load(path: &Path) -> EngineResult<Self> {
        // SAFETY: loading runs the library's initializers; the library path is
        // trusted configuration.
        let library = unsafe { Library::new(path) }.map_err(|e| EngineError::LibraryLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let symbols = Symbols::resolve(&library)?;
        debug!(path = %path.display(), "loaded engine library");
        Ok(Self {
            symbols,
            relay: None,
            path: path.to_path_buf(),
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn var_type(&self, c_name: &CStr, name: &str) -> EngineResult<VarType> {
        let mut type_code: c_int = 0;
        // SAFETY: valid C string and out-pointer for the duration of the call.
        let code = unsafe { (self.symbols.get_var_type)(c_name.as_ptr(), &mut type_code) };
        if code != 0 {
            return Err(EngineError::UnknownVariable {
                name: name.to_string(),
                code,
            });
        }
        VarType::from_code(type_code).ok_or_else(|| EngineError::UnsupportedType {
            name: name.to_string(),
            code: type_code,
        })
    }

    fn var_count(&self, c_name: &CStr, name: &str) -> EngineResult<usize> {
        let mut count: c_int = 0;
        // SAFETY: valid C string and out-pointer for the duration of the call.
        let code = unsafe { (self.symbols.get_var_count)(c_name.as_ptr(), &mut count) };
        if code != 0 {
            return Err(EngineError::UnknownVariable {
                name: name.to_string(),
                code,
            });
        }
        match usize::try_from(count) {
            Ok(len) if len <= MAX_VAR_LEN => Ok(len),
            _ => Err(EngineError::InvalidLength {
                name: name.to_string(),
                len: i64::from(count),
            }),
        }
    }

    fn call_set_var(
        &mut self,
        c_name: &CStr,
        var_type: VarType,
        src: *const c_void,
        count: usize,
    ) -> c_int {
        // `count` was bounds-checked against MAX_VAR_LEN by the caller.
        let count = count as c_int;
        // SAFETY: `src` points at `count` initialized elements of `var_type`.
        unsafe { (self.symbols.set_var)(c_name.as_ptr(), var_type.code(), src, count) }
    }
}

impl EngineApi for NativeEngine {
    fn set_logger(&mut self, relay: Option<Arc<MessageRelay>>) {
        match relay {
            Some(relay) => {
                let user_data = Arc::as_ptr(&relay) as *mut c_void;
                // SAFETY: the relay outlives the registration because it is stored
                // in `self.relay` until set_logger(None) or drop.
                unsafe { (self.symbols.set_logger)(Some(relay_message), user_data) };
                self.relay = Some(relay);
            }
            None => {
                // SAFETY: unregistering takes no pointers.
                unsafe { (self.symbols.set_logger)(None, ptr::null_mut()) };
                self.relay = None;
            }
        }
    }

    fn set_level(&mut self, key: &str, level: LogLevel) -> i32 {
        let Ok(c_name) = c_string(key) else {
            return ReturnCode::BINDING_FAILURE.raw();
        };
        let value: c_int = level.code();
        self.call_set_var(&c_name, VarType::Int, (&value as *const c_int).cast(), 1)
    }

    fn initialize(&mut self, config_path: &Path) -> i32 {
        let Some(c_path) = config_path.to_str().and_then(|p| CString::new(p).ok()) else {
            return ReturnCode::BINDING_FAILURE.raw();
        };
        // SAFETY: valid C string for the duration of the call.
        unsafe { (self.symbols.initialize)(c_path.as_ptr()) }
    }

    fn update(&mut self, dt: f64) -> i32 {
        // SAFETY: plain value argument.
        unsafe { (self.symbols.update)(dt) }
    }

    fn finalize(&mut self) -> i32 {
        // SAFETY: no arguments.
        unsafe { (self.symbols.finalize)() }
    }

    fn offsets(&self) -> EngineOffsets {
        EngineOffsets {
            start: read_time(self.symbols.get_start_time),
            end: read_time(self.symbols.get_end_time),
            step: read_time(self.symbols.get_time_step),
            current: read_time(self.symbols.get_current_time),
        }
    }

    fn current_offset(&self) -> f64 {
        read_time(self.symbols.get_current_time)
    }

    fn get_values(&mut self, name: &str) -> EngineResult<VarValues> {
        let c_name = c_string(name)?;
        let var_type = self.var_type(&c_name, name)?;
        let count = self.var_count(&c_name, name)?;

        let (code, values) = match var_type {
            VarType::Double => {
                let mut buffer = vec![0.0f64; count];
                // SAFETY: `buffer` has room for exactly `count` doubles.
                let code = unsafe {
                    (self.symbols.get_var)(
                        c_name.as_ptr(),
                        buffer.as_mut_ptr().cast(),
                        count as c_int,
                    )
                };
                (code, VarValues::Double(buffer))
            }
            VarType::Int => {
                let mut buffer = vec![0i32; count];
                // SAFETY: `buffer` has room for exactly `count` ints.
                let code = unsafe {
                    (self.symbols.get_var)(
                        c_name.as_ptr(),
                        buffer.as_mut_ptr().cast(),
                        count as c_int,
                    )
                };
                (code, VarValues::Int(buffer))
            }
        };

        if code != 0 {
            return Err(EngineError::VariableCall {
                name: name.to_string(),
                code,
            });
        }
        Ok(values)
    }

    fn set_values(&mut self, name: &str, values: &VarValues) -> EngineResult<()> {
        let c_name = c_string(name)?;
        let var_type = self.var_type(&c_name, name)?;
        if var_type != values.var_type() {
            return Err(EngineError::TypeMismatch {
                name: name.to_string(),
                actual: var_type,
                given: values.var_type(),
            });
        }
        let count = self.var_count(&c_name, name)?;
        if count != values.len() {
            return Err(EngineError::LengthMismatch {
                name: name.to_string(),
                expected: count,
                given: values.len(),
            });
        }

        let code = match values {
            VarValues::Double(v) => self.call_set_var(&c_name, var_type, v.as_ptr().cast(), count),
            VarValues::Int(v) => self.call_set_var(&c_name, var_type, v.as_ptr().cast(), count),
        };
        if code != 0 {
            return Err(EngineError::VariableCall {
                name: name.to_string(),
                code,
            });
        }
        Ok(())
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        if self.relay.take().is_some() {
            // SAFETY: unregistering takes no pointers; the library is still loaded.
            unsafe { (self.symbols.set_logger)(None, ptr::null_mut()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_load_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("libmissing_engine.so");
        let err = NativeEngine::load(&path).err().unwrap();
        assert!(matches!(err, EngineError::LibraryLoad { .. }));
        assert!(err.to_string().contains("libmissing_engine"));
    }

    #[test]
    fn interior_nul_is_rejected() {
        let err = c_string("bad\0name").unwrap_err();
        assert!(matches!(err, EngineError::InvalidName { .. }));
    }

    #[test]
    fn callback_trampoline_feeds_relay() {
        let relay = Arc::new(MessageRelay::new());
        let message = CString::new("time step reduced").unwrap();
        let user_data = Arc::as_ptr(&relay) as *mut c_void;

        // SAFETY: pointers are valid for the duration of the call.
        unsafe { relay_message(user_data, LogLevel::Warning.code(), message.as_ptr()) };
        // SAFETY: null inputs are ignored.
        unsafe { relay_message(ptr::null_mut(), 0, message.as_ptr()) };

        assert_eq!(relay.buffer().take(), vec!["time step reduced".to_string()]);
    }
}
