use std::path::PathBuf;

use crate::error::ConfigError;

/// Alignment of every backing-store and scratch allocation unless overridden.
///
/// Large enough for the widest vector type generated kernels may load with aligned moves.
pub const MAX_EXTENDED_ALIGNMENT: usize = 128;

pub const DEFAULT_CODEGEN_PROGRAM: &str = "cpudev-codegen";
pub const DEFAULT_MAX_WORK_GROUP_SIZE: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// Alignment in bytes for device allocations. Always a power of two.
    pub mem_align: usize,
    /// Program run by [`crate::ExternalCodeGenerator`] on a kernel cache miss.
    pub codegen_program: PathBuf,
    pub max_work_group_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mem_align: MAX_EXTENDED_ALIGNMENT,
            codegen_program: PathBuf::from(DEFAULT_CODEGEN_PROGRAM),
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
        }
    }
}

impl DriverConfig {
    /// Reads `CPUDEV_MEM_ALIGN`, `CPUDEV_CODEGEN` and `CPUDEV_MAX_WORK_GROUP`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(raw) = lookup("CPUDEV_MEM_ALIGN") {
            let align = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidEnv("CPUDEV_MEM_ALIGN"))?;
            if !align.is_power_of_two() {
                return Err(ConfigError::InvalidEnv("CPUDEV_MEM_ALIGN"));
            }
            cfg.mem_align = align;
        }

        if let Some(raw) = lookup("CPUDEV_CODEGEN") {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(ConfigError::InvalidEnv("CPUDEV_CODEGEN"));
            }
            cfg.codegen_program = PathBuf::from(raw);
        }

        if let Some(raw) = lookup("CPUDEV_MAX_WORK_GROUP") {
            cfg.max_work_group_size = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or(ConfigError::InvalidEnv("CPUDEV_MAX_WORK_GROUP"))?;
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = DriverConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, DriverConfig::default());
        assert_eq!(cfg.mem_align, 128);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = DriverConfig::from_lookup(lookup(&[
            ("CPUDEV_MEM_ALIGN", "64"),
            ("CPUDEV_CODEGEN", " /opt/cg/bin/kcc "),
            ("CPUDEV_MAX_WORK_GROUP", "1024"),
        ]))
        .unwrap();
        assert_eq!(cfg.mem_align, 64);
        assert_eq!(cfg.codegen_program, PathBuf::from("/opt/cg/bin/kcc"));
        assert_eq!(cfg.max_work_group_size, 1024);
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let err = DriverConfig::from_lookup(lookup(&[("CPUDEV_MEM_ALIGN", "48")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv("CPUDEV_MEM_ALIGN")));
    }

    #[test]
    fn rejects_zero_work_group_size() {
        let err =
            DriverConfig::from_lookup(lookup(&[("CPUDEV_MAX_WORK_GROUP", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv("CPUDEV_MAX_WORK_GROUP")));
    }
}
