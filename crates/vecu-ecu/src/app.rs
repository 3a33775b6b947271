//! Loadable application module.
//!
//! The cruise-control application is a shared library with a single
//! exported entry point. The module is opened fresh on every cycle and
//! the previous handle dropped first, so a file swapped on disk takes
//! effect on the next cycle without any notification channel.

use std::path::{Path, PathBuf};

use libloading::Library;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

/// Symbol the module must export.
const ENTRY_SYMBOL: &[u8] = b"run_acc_application\0";

type EntryFn = unsafe extern "C" fn();

#[derive(Debug, Error)]
pub enum AppModuleError {
    #[error("cannot load application module {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("application module {path} does not export run_acc_application: {source}")]
    MissingEntryPoint {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
}

/// Handle to the replaceable application artifact.
///
/// The mutex serializes cycle invocations against
/// [`unload`](AppModule::unload), so a hot-swap never yanks the library
/// out from under a running cycle.
pub struct AppModule {
    path: PathBuf,
    library: Mutex<Option<Library>>,
}

impl AppModule {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            library: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the module from disk and invoke its entry point once.
    pub fn run_cycle(&self) -> Result<(), AppModuleError> {
        let mut guard = self.library.lock();

        // Drop any previous handle before reopening; on platforms where
        // the loader caches by path this is what picks up a swapped file.
        *guard = None;

        let library = unsafe { Library::new(&self.path) }.map_err(|source| {
            AppModuleError::Load {
                path: self.path.clone(),
                source,
            }
        })?;

        let entry = unsafe { library.get::<EntryFn>(ENTRY_SYMBOL) }.map_err(|source| {
            AppModuleError::MissingEntryPoint {
                path: self.path.clone(),
                source,
            }
        })?;
        unsafe { entry() };

        *guard = Some(library);
        Ok(())
    }

    /// Drop the open handle, releasing the on-disk file for replacement.
    pub fn unload(&self) {
        if self.library.lock().take().is_some() {
            info!(path = %self.path.display(), "unloaded application module");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_module_is_a_load_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let module = AppModule::new(dir.path().join("libmissing.so"));
        assert!(matches!(
            module.run_cycle(),
            Err(AppModuleError::Load { .. })
        ));
    }

    #[test]
    fn unload_without_load_is_a_no_op() {
        let module = AppModule::new("./libacc_app.so");
        module.unload();
        module.unload();
    }
}
