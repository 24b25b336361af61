//! Kernel module management for the loopback driver
//!
//! The loopback sinks are backed by a kernel module whose device numbers are
//! chosen at load time. At startup any stale instance is removed and the
//! module is loaded again with one node per sink.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{AppError, Result};

/// Loads and unloads kernel modules
pub trait ModuleLoader {
    /// Load a module image with the given parameter string
    fn load(&self, image: &Path, params: &str) -> Result<()>;

    /// Unload a module by name
    fn unload(&self, name: &str) -> Result<()>;
}

/// [`ModuleLoader`] using the `finit_module` / `delete_module` syscalls
///
/// Needs `CAP_SYS_MODULE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelModuleLoader;

impl ModuleLoader for KernelModuleLoader {
    fn load(&self, image: &Path, params: &str) -> Result<()> {
        let file = File::open(image).map_err(|e| {
            AppError::Module(format!("cannot open {}: {}", image.display(), e))
        })?;
        let params_c = CString::new(params)
            .map_err(|_| AppError::Module("module parameters contain NUL".to_string()))?;

        // SAFETY: valid fd and NUL-terminated parameter string for the call's duration
        let ret = unsafe {
            libc::syscall(
                libc::SYS_finit_module,
                file.as_raw_fd(),
                params_c.as_ptr(),
                0,
            )
        };
        if ret != 0 {
            return Err(AppError::Module(format!(
                "finit_module({}) failed: {}",
                image.display(),
                std::io::Error::last_os_error()
            )));
        }
        info!("Loaded kernel module {} ({})", image.display(), params);
        Ok(())
    }

    fn unload(&self, name: &str) -> Result<()> {
        let name_c = CString::new(name)
            .map_err(|_| AppError::Module("module name contains NUL".to_string()))?;

        // SAFETY: NUL-terminated module name for the call's duration
        let ret = unsafe {
            libc::syscall(
                libc::SYS_delete_module,
                name_c.as_ptr(),
                libc::O_NONBLOCK,
            )
        };
        if ret != 0 {
            return Err(AppError::Module(format!(
                "delete_module({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        info!("Unloaded kernel module {}", name);
        Ok(())
    }
}

/// Replace any loaded instance of `name` with a fresh one from `image`
///
/// A failed unload is expected when the module is not loaded yet.
pub fn reload(loader: &dyn ModuleLoader, name: &str, image: &Path, params: &str) -> Result<()> {
    if let Err(e) = loader.unload(name) {
        debug!("Module {} not unloaded: {}", name, e);
    }
    loader.load(image, params)
}
