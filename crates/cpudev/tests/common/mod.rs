#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpudev::abi::{workgroup_symbol, WorkgroupFn};
use cpudev::{
    BasicDevice, CodeGenerator, DeviceDescriptor, DriverConfig, DriverResult, GlobalMemoryDomain,
    Kernel, KernelCache, LoadedModule, ModuleLoader,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct InProcessModule {
    path: PathBuf,
    symbol: String,
    launcher: WorkgroupFn,
}

impl LoadedModule for InProcessModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn workgroup_fn(&self, symbol: &str) -> Result<WorkgroupFn, String> {
        if symbol == self.symbol {
            Ok(self.launcher)
        } else {
            Err(format!("{}: undefined symbol: {symbol}", self.path.display()))
        }
    }
}

/// Stands in for the code generator and the dynamic loader: "modules" are named after the
/// kernel they were generated for and export its launcher, backed by an in-process function.
pub struct FakeToolchain {
    launcher: WorkgroupFn,
    generate_delay: Duration,
    pub generated: AtomicUsize,
    pub loaded: AtomicUsize,
}

impl FakeToolchain {
    pub fn new(launcher: WorkgroupFn) -> Arc<Self> {
        Self::with_delay(launcher, Duration::ZERO)
    }

    pub fn with_delay(launcher: WorkgroupFn, generate_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            generate_delay,
            generated: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
        })
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn cache(self: &Arc<Self>) -> Arc<KernelCache> {
        Arc::new(KernelCache::new(self.clone(), self.clone()))
    }
}

impl CodeGenerator for FakeToolchain {
    fn generate(
        &self,
        build_dir: &Path,
        kernel: &Kernel,
        _device: &DeviceDescriptor,
    ) -> DriverResult<PathBuf> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        if !self.generate_delay.is_zero() {
            std::thread::sleep(self.generate_delay);
        }
        Ok(build_dir.join(format!("{}.so", kernel.name())))
    }
}

impl ModuleLoader for FakeToolchain {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, String> {
        self.loaded.fetch_add(1, Ordering::SeqCst);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| format!("{}: cannot open shared object file", path.display()))?;
        Ok(Arc::new(InProcessModule {
            path: path.to_path_buf(),
            symbol: workgroup_symbol(stem),
            launcher: self.launcher,
        }))
    }
}

pub fn basic_device(cache: Arc<KernelCache>) -> BasicDevice {
    BasicDevice::init(&GlobalMemoryDomain::new(), &DriverConfig::default(), cache, None)
}
