//! Kernel binary cache.
//!
//! Maps `(build directory, kernel name)` to a loaded module and its work-group launcher. On a
//! miss the kernel is either generated into a shared object by the external code generator or
//! taken from a precompiled binary, then loaded and its launcher symbol resolved. Entries are
//! never evicted; the module stays loaded for as long as any entry point cloned from it lives.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use cpudev_abi::{workgroup_symbol, WorkgroupContext, WorkgroupFn};
use libloading::Library;
use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::device::DeviceDescriptor;
use crate::error::{DriverError, DriverResult};
use crate::kernel::Kernel;

/// A loaded kernel module.
pub trait LoadedModule: Send + Sync {
    fn path(&self) -> &Path;

    /// Looks up an exported work-group launcher. The returned function is valid for as long as
    /// the module is.
    fn workgroup_fn(&self, symbol: &str) -> Result<WorkgroupFn, String>;
}

pub trait ModuleLoader: Send + Sync {
    /// Loads the module at `path`; the error string is the loader's diagnostic.
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, String>;
}

/// Turns a kernel of a program build into a loadable module.
pub trait CodeGenerator: Send + Sync {
    /// Produces the module for `kernel` and returns its path.
    fn generate(
        &self,
        build_dir: &Path,
        kernel: &Kernel,
        device: &DeviceDescriptor,
    ) -> DriverResult<PathBuf>;
}

/// A shared object opened with the platform dynamic loader.
pub struct DlModule {
    path: PathBuf,
    library: Library,
}

impl LoadedModule for DlModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn workgroup_fn(&self, symbol: &str) -> Result<WorkgroupFn, String> {
        // SAFETY: launchers exported by generated modules follow the `WorkgroupFn` ABI; the
        // copied function pointer is only used while `self` is kept alive by its entry point.
        unsafe {
            self.library
                .get::<WorkgroupFn>(symbol.as_bytes())
                .map(|sym| *sym)
                .map_err(|e| e.to_string())
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DlModuleLoader;

impl ModuleLoader for DlModuleLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, String> {
        // SAFETY: kernel modules have no load-time initialisers beyond what the code generator
        // emits for its own runtime.
        let library = unsafe { Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Arc::new(DlModule {
            path: path.to_path_buf(),
            library,
        }))
    }
}

/// Runs the configured code generator program as a child process.
///
/// Invocation: `<program> --build-dir <dir> --kernel <name> [--cpu <cpu>] --output <file>`,
/// where `<file>` is `<dir>/<name>.<dll extension>`.
#[derive(Debug, Clone)]
pub struct ExternalCodeGenerator {
    program: PathBuf,
}

impl ExternalCodeGenerator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.codegen_program.clone())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn output_path(build_dir: &Path, kernel_name: &str) -> PathBuf {
        build_dir.join(format!("{kernel_name}.{}", std::env::consts::DLL_EXTENSION))
    }
}

impl CodeGenerator for ExternalCodeGenerator {
    fn generate(
        &self,
        build_dir: &Path,
        kernel: &Kernel,
        device: &DeviceDescriptor,
    ) -> DriverResult<PathBuf> {
        let output = Self::output_path(build_dir, kernel.name());
        let codegen_err = |message: String| DriverError::CodeGen {
            build_dir: build_dir.to_path_buf(),
            kernel: kernel.name().to_string(),
            message,
        };

        let mut cmd = Command::new(&self.program);
        cmd.arg("--build-dir")
            .arg(build_dir)
            .arg("--kernel")
            .arg(kernel.name());
        if let Some(cpu) = &device.cpu {
            cmd.arg("--cpu").arg(cpu);
        }
        cmd.arg("--output").arg(&output);

        debug!(
            program = %self.program.display(),
            output = %output.display(),
            "running code generator"
        );
        let result = cmd
            .output()
            .map_err(|e| codegen_err(format!("failed to spawn {}: {e}", self.program.display())))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let stdout = String::from_utf8_lossy(&result.stdout);
            return Err(codegen_err(format!(
                "{} exited with {}\nstderr: {stderr}\nstdout: {stdout}",
                self.program.display(),
                result.status
            )));
        }
        if !output.exists() {
            return Err(codegen_err(format!(
                "{} succeeded but produced no module at {}",
                self.program.display(),
                output.display()
            )));
        }
        Ok(output)
    }
}

/// A resolved work-group launcher together with the module that exports it.
#[derive(Clone)]
pub struct EntryPoint {
    func: WorkgroupFn,
    symbol: Arc<str>,
    module: Arc<dyn LoadedModule>,
}

impl EntryPoint {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn module_path(&self) -> &Path {
        self.module.path()
    }

    /// Runs one work-group.
    ///
    /// # Safety
    /// `args` must hold one correctly marshaled slot per launcher argument, each valid for the
    /// duration of the call.
    pub unsafe fn call(&self, args: *mut *mut c_void, ctx: &mut WorkgroupContext) {
        (self.func)(args, ctx)
    }

    pub fn same_function(&self, other: &EntryPoint) -> bool {
        self.func as usize == other.func as usize
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("symbol", &self.symbol)
            .field("module", &self.module.path())
            .finish()
    }
}

struct CacheEntry {
    build_dir: PathBuf,
    kernel_name: String,
    entry: EntryPoint,
}

/// Process-wide map from `(build_dir, kernel_name)` to a loaded entry point.
pub struct KernelCache {
    entries: Mutex<Vec<CacheEntry>>,
    generator: Arc<dyn CodeGenerator>,
    loader: Arc<dyn ModuleLoader>,
}

impl KernelCache {
    pub fn new(generator: Arc<dyn CodeGenerator>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            generator,
            loader,
        }
    }

    /// External code generator plus the platform dynamic loader.
    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(
            Arc::new(ExternalCodeGenerator::from_config(config)),
            Arc::new(DlModuleLoader),
        )
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the entry point of `kernel` from `build_dir`, generating and loading it on the
    /// first request.
    ///
    /// With `binary` set, the module is loaded from that path and the generator is not invoked.
    /// The lookup and any insertion happen under a single lock, so concurrent first requests for
    /// the same key generate and load the module once.
    pub fn resolve(
        &self,
        build_dir: &Path,
        kernel: &Kernel,
        binary: Option<&Path>,
        device: &DeviceDescriptor,
    ) -> DriverResult<EntryPoint> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(hit) = entries
            .iter()
            .find(|e| e.build_dir == build_dir && e.kernel_name == kernel.name())
        {
            debug!(kernel = kernel.name(), build_dir = %build_dir.display(), "kernel cache hit");
            return Ok(hit.entry.clone());
        }
        debug!(kernel = kernel.name(), build_dir = %build_dir.display(), "kernel cache miss");

        let module_path = match binary {
            Some(path) => path.to_path_buf(),
            None => self.generator.generate(build_dir, kernel, device)?,
        };

        let module = self.loader.load(&module_path).map_err(|diagnostic| {
            warn!(path = %module_path.display(), %diagnostic, "kernel module failed to load");
            DriverError::ModuleLoad {
                path: module_path.clone(),
                diagnostic,
            }
        })?;

        let symbol = workgroup_symbol(kernel.name());
        let func = module.workgroup_fn(&symbol).map_err(|diagnostic| {
            warn!(path = %module_path.display(), %symbol, "kernel module lacks launcher");
            DriverError::MissingSymbol {
                path: module_path.clone(),
                symbol: symbol.clone(),
                diagnostic,
            }
        })?;
        debug!(path = %module_path.display(), %symbol, "loaded kernel module");

        let entry = EntryPoint {
            func,
            symbol: symbol.into(),
            module,
        };
        entries.push(CacheEntry {
            build_dir: build_dir.to_path_buf(),
            kernel_name: kernel.name().to_string(),
            entry: entry.clone(),
        });
        Ok(entry)
    }
}

impl std::fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
