//! Backend selection.
//!
//! The native engine is a 64-bit library. It can be loaded in-process only
//! from a 64-bit host; otherwise, on a 64-bit OS, it runs in a worker.

use tracing::{info, warn};

use crate::error::EngineResult;
use crate::handle::{BackendKind, EngineHandle};
use crate::local::LocalEngineBinding;
use crate::remote::RemoteEngineBinding;
use crate::settings::EngineSettings;

/// Word size of the OS and of this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Platform {
    pub os_is_64bit: bool,
    pub process_is_64bit: bool,
}

impl Platform {
    pub fn current() -> Self {
        let process_is_64bit = cfg!(target_pointer_width = "64");
        Self {
            os_is_64bit: process_is_64bit || wow64_host(),
            process_is_64bit,
        }
    }
}

/// A 32-bit process on 64-bit Windows sees the native architecture here.
#[cfg(windows)]
fn wow64_host() -> bool {
    std::env::var_os("PROCESSOR_ARCHITEW6432").is_some()
}

#[cfg(not(windows))]
fn wow64_host() -> bool {
    false
}

/// The backend decision table. `None` means no backend can run here.
pub fn select_backend(platform: Platform, prefer_remote: bool) -> Option<BackendKind> {
    match (platform.os_is_64bit, prefer_remote, platform.process_is_64bit) {
        (false, _, _) => None,
        (true, true, _) => Some(BackendKind::Remote),
        (true, false, true) => Some(BackendKind::Local),
        (true, false, false) => None,
    }
}

/// Creates a fresh engine handle for one run.
pub trait BackendProvider {
    fn create(&self, prefer_remote: bool) -> EngineResult<Option<Box<dyn EngineHandle>>>;
}

pub struct BackendFactory {
    settings: EngineSettings,
    platform: Platform,
}

impl BackendFactory {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_platform(settings, Platform::current())
    }

    pub fn with_platform(settings: EngineSettings, platform: Platform) -> Self {
        Self { settings, platform }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl BackendProvider for BackendFactory {
    fn create(&self, prefer_remote: bool) -> EngineResult<Option<Box<dyn EngineHandle>>> {
        match select_backend(self.platform, prefer_remote) {
            Some(BackendKind::Local) => {
                info!(library = %self.settings.library_path.display(), "using local engine binding");
                Ok(Some(Box::new(LocalEngineBinding::new(&self.settings))))
            }
            Some(BackendKind::Remote) => {
                info!(
                    worker = %self.settings.worker.program.display(),
                    "using remote engine binding"
                );
                Ok(Some(Box::new(RemoteEngineBinding::spawn(&self.settings)?)))
            }
            None => {
                warn!(
                    platform = ?self.platform,
                    prefer_remote,
                    "no engine backend available on this platform"
                );
                Ok(None)
            }
        }
    }
}
