mod common;

use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::FakeToolchain;
use cpudev::abi::WorkgroupContext;
use cpudev::{
    DlModuleLoader, DriverConfig, DriverError, ExternalCodeGenerator, GlobalMemoryDomain, Kernel,
    KernelCache, ModuleLoader,
};

unsafe extern "C" fn noop(_args: *mut *mut c_void, _ctx: *mut WorkgroupContext) {}

#[test]
fn hundred_sequential_dispatch_preparations_generate_once() {
    let toolchain = FakeToolchain::new(noop);
    let cache = toolchain.cache();
    let dev = GlobalMemoryDomain::new().register(&DriverConfig::default(), None);
    let kernel = Kernel::new("matmul", Vec::new());

    for _ in 0..100 {
        cache
            .resolve(Path::new("/build/p1"), &kernel, None, &dev)
            .unwrap();
    }
    assert_eq!(toolchain.generated(), 1);
    assert_eq!(toolchain.loaded(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn concurrent_first_requests_generate_once() {
    let toolchain = FakeToolchain::with_delay(noop, Duration::from_millis(20));
    let cache = toolchain.cache();
    let domain = GlobalMemoryDomain::new();
    let config = DriverConfig::default();
    let devices: Vec<_> = (0..8).map(|_| domain.register(&config, None)).collect();
    let kernel = Kernel::new("reduce", Vec::new());

    let entries: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = devices
            .iter()
            .map(|dev| {
                let cache = &cache;
                let kernel = &kernel;
                s.spawn(move || cache.resolve(Path::new("/build/p2"), kernel, None, dev))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });

    assert_eq!(toolchain.generated(), 1);
    assert_eq!(toolchain.loaded(), 1);
    assert!(entries.windows(2).all(|w| w[0].same_function(&w[1])));
}

#[test]
fn distinct_kernels_of_one_build_get_distinct_entries() {
    let toolchain = FakeToolchain::new(noop);
    let cache = toolchain.cache();
    let dev = GlobalMemoryDomain::new().register(&DriverConfig::default(), None);

    let a = cache
        .resolve(Path::new("/b"), &Kernel::new("a", Vec::new()), None, &dev)
        .unwrap();
    let b = cache
        .resolve(Path::new("/b"), &Kernel::new("b", Vec::new()), None, &dev)
        .unwrap();
    assert_eq!(a.symbol(), "_cpudev_launcher_a_workgroup");
    assert_eq!(b.symbol(), "_cpudev_launcher_b_workgroup");
    assert_eq!(toolchain.generated(), 2);
}

#[test]
fn dynamic_loader_reports_missing_module() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.so");
    let err = DlModuleLoader.load(&missing).err().unwrap();
    assert!(!err.is_empty());

    let cache = KernelCache::new(
        Arc::new(ExternalCodeGenerator::new("/nonexistent/cpudev-codegen")),
        Arc::new(DlModuleLoader),
    );
    let dev = GlobalMemoryDomain::new().register(&DriverConfig::default(), None);
    let err = cache
        .resolve(dir.path(), &Kernel::new("k", Vec::new()), Some(&missing), &dev)
        .unwrap_err();
    match err {
        DriverError::ModuleLoad { path, .. } => assert_eq!(path, missing),
        other => panic!("unexpected error: {other}"),
    }
    assert!(cache.is_empty());
}

#[test]
fn unspawnable_code_generator_is_a_codegen_error() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KernelCache::new(
        Arc::new(ExternalCodeGenerator::new(dir.path().join("no-such-tool"))),
        Arc::new(DlModuleLoader),
    );
    let dev = GlobalMemoryDomain::new().register(&DriverConfig::default(), None);
    let err = cache
        .resolve(dir.path(), &Kernel::new("k", Vec::new()), None, &dev)
        .unwrap_err();
    assert!(matches!(err, DriverError::CodeGen { .. }), "{err}");
    assert!(err.is_fatal());
}

#[cfg(unix)]
#[test]
fn failing_code_generator_output_is_captured() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("codegen.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\necho \"generating $4\"\necho \"unsupported builtin\" >&2\nexit 3\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let cache = KernelCache::new(
        Arc::new(ExternalCodeGenerator::new(&script)),
        Arc::new(DlModuleLoader),
    );
    let dev = GlobalMemoryDomain::new().register(&DriverConfig::default(), None);
    let err = cache
        .resolve(dir.path(), &Kernel::new("blur", Vec::new()), None, &dev)
        .unwrap_err();

    let DriverError::CodeGen { kernel, message, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(kernel, "blur");
    assert!(message.contains("unsupported builtin"), "{message}");
    assert!(message.contains("generating blur"), "{message}");
}
