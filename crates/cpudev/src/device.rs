use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use tracing::debug;

use crate::config::DriverConfig;

/// Index of one driver instance; also the index of its slot in every memory object.
pub type DeviceId = usize;

/// Identity of an address space shared by one or more driver instances.
///
/// Numerically it is the [`DeviceId`] of the first instance registered in the space, so the
/// canonical slot of a memory object is simply `slots[global_mem_id]`.
pub type GlobalMemId = usize;

const VENDOR_MAGIC: [u8; 4] = *b"cpud";

/// Read-only capability record of one host-CPU device instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub dev_id: DeviceId,
    pub global_mem_id: GlobalMemId,
    pub name: String,
    /// Target CPU passed to the code generator; `None` lets it pick the host CPU.
    pub cpu: Option<String>,
    pub vendor_id: u32,
    /// Alignment in bytes of every allocation made on behalf of this device.
    pub mem_align: usize,
    pub max_work_item_dimensions: u32,
    pub max_work_group_size: usize,
    /// The basic device exploits a single hardware thread.
    pub max_compute_units: u32,
}

impl DeviceDescriptor {
    /// Whether this instance owns the canonical slot of its address space.
    pub fn is_canonical(&self) -> bool {
        self.dev_id == self.global_mem_id
    }
}

#[derive(Debug, Default)]
struct DomainState {
    canonical: Option<GlobalMemId>,
    next_dev_id: DeviceId,
}

/// Hands out device identities for driver instances that alias one host address space.
///
/// The first registered instance becomes the canonical owner of the space; all later instances
/// share its `global_mem_id` and therefore see the same resolved addresses.
#[derive(Debug, Default)]
pub struct GlobalMemoryDomain {
    state: Mutex<DomainState>,
}

impl GlobalMemoryDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: &DriverConfig, cpu: Option<&str>) -> DeviceDescriptor {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let dev_id = state.next_dev_id;
        state.next_dev_id += 1;
        let global_mem_id = *state.canonical.get_or_insert(dev_id);

        // "(unknown)" is what CPU probing reports when it cannot name the host.
        let cpu = cpu
            .filter(|c| !c.is_empty() && *c != "(unknown)")
            .map(str::to_owned);

        let descriptor = DeviceDescriptor {
            dev_id,
            global_mem_id,
            name: format!("basic-{dev_id}"),
            cpu,
            vendor_id: u32::from_le_bytes(VENDOR_MAGIC).wrapping_add(dev_id as u32),
            mem_align: config.mem_align,
            max_work_item_dimensions: 3,
            max_work_group_size: config.max_work_group_size,
            max_compute_units: 1,
        };
        debug!(dev_id, global_mem_id, "registered host-CPU device instance");
        descriptor
    }

    /// Number of instances registered so far, i.e. the slot count memory objects need.
    pub fn device_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_dev_id
    }
}

/// Monotonic timestamp in nanoseconds, used for command profiling.
pub fn timer_value_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_instance_owns_the_address_space() {
        let domain = GlobalMemoryDomain::new();
        let cfg = DriverConfig::default();
        let a = domain.register(&cfg, None);
        let b = domain.register(&cfg, Some("skylake"));

        assert_eq!(a.dev_id, 0);
        assert_eq!(b.dev_id, 1);
        assert_eq!(a.global_mem_id, 0);
        assert_eq!(b.global_mem_id, 0);
        assert!(a.is_canonical());
        assert!(!b.is_canonical());
        assert_eq!(b.cpu.as_deref(), Some("skylake"));
        assert_ne!(a.vendor_id, b.vendor_id);
        assert_eq!(domain.device_count(), 2);
    }

    #[test]
    fn unknown_cpu_is_dropped() {
        let domain = GlobalMemoryDomain::new();
        let dev = domain.register(&DriverConfig::default(), Some("(unknown)"));
        assert_eq!(dev.cpu, None);
    }

    #[test]
    fn timer_is_monotonic() {
        let a = timer_value_ns();
        let b = timer_value_ns();
        assert!(b >= a);
    }
}
