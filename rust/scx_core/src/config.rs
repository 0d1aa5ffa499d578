//! Scheduler configuration, fixed at load time.
//!
//! The config is a flat set of options. It can be built in code or read
//! from a TOML file:
//!
//! ```toml
//! nr_cpu_ids = 8
//! online_cpus = "0-7"
//! default_slice_ns = 5000000
//! priority_tiebreak = "FifoOnEqual"
//!
//! [[dsq_preallocate_named]]
//! id = 1
//! order = "priority"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cpumask::Cpumask;
use crate::task::OpsState;
use crate::types::{DsqId, DsqOrder, PriorityTiebreak, TimeNs};

/// Default slice, matching `SCX_SLICE_DFL`.
pub const SLICE_DFL_NS: TimeNs = 20_000_000;

/// A Named DSQ to create at load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedDsq {
    pub id: u64,
    #[serde(default)]
    pub order: DsqOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Number of possible CPUs.
    pub nr_cpu_ids: u32,
    /// CPUs online at load, as a cpulist. `None` means all possible CPUs.
    pub online_cpus: Option<String>,
    /// Slice given to a task that becomes runnable without one.
    pub default_slice_ns: TimeNs,
    /// When false, `init_task` and `set_cpumask` reject affinity masks
    /// narrower than the online set.
    pub allow_per_cpu_pinning: bool,
    pub dsq_preallocate_named: Vec<NamedDsq>,
    pub priority_tiebreak: PriorityTiebreak,
    /// Capacity of the task table.
    pub max_tasks: usize,
    /// Capacity of the DSQ table, built-in DSQs included.
    pub max_dsqs: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            nr_cpu_ids: 4,
            online_cpus: None,
            default_slice_ns: SLICE_DFL_NS,
            allow_per_cpu_pinning: true,
            dsq_preallocate_named: Vec::new(),
            priority_tiebreak: PriorityTiebreak::FifoOnEqual,
            max_tasks: 65536,
            max_dsqs: 1024,
        }
    }
}

impl SchedConfig {
    /// Convenience constructor for `nr_cpus` CPUs, all online.
    pub fn with_cpus(nr_cpus: u32) -> Self {
        SchedConfig {
            nr_cpu_ids: nr_cpus,
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SchedConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        if content.trim().is_empty() {
            bail!("The config file {} is empty!", path.display());
        }
        Self::from_toml_str(&content)
    }

    /// The set of CPUs online at load.
    pub fn online_mask(&self) -> Result<Cpumask> {
        let nr = self.nr_cpu_ids as usize;
        match &self.online_cpus {
            Some(list) => Cpumask::from_cpulist(nr, list),
            None => Ok(Cpumask::full(nr)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_cpu_ids == 0 {
            bail!("nr_cpu_ids must be at least 1");
        }
        if self.nr_cpu_ids > OpsState::MAX_CPUS {
            bail!(
                "nr_cpu_ids {} exceeds the supported maximum of {}",
                self.nr_cpu_ids,
                OpsState::MAX_CPUS
            );
        }
        if self.online_mask()?.is_empty() {
            bail!("at least one CPU must be online");
        }
        if self.max_tasks == 0 {
            bail!("max_tasks must be at least 1");
        }
        let nr_builtin = self.nr_cpu_ids as usize + 1;
        if self.max_dsqs < nr_builtin + self.dsq_preallocate_named.len() {
            bail!(
                "max_dsqs {} cannot hold {} built-in and {} preallocated DSQs",
                self.max_dsqs,
                nr_builtin,
                self.dsq_preallocate_named.len()
            );
        }
        let mut seen = HashSet::new();
        for named in &self.dsq_preallocate_named {
            if DsqId::named(named.id).is_none() {
                bail!("preallocated DSQ id {:#x} uses the built-in flag", named.id);
            }
            if !seen.insert(named.id) {
                bail!("preallocated DSQ id {:#x} listed twice", named.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        SchedConfig::default().validate().unwrap();
        assert_eq!(SchedConfig::default().online_mask().unwrap().weight(), 4);
    }

    #[test]
    fn test_parse_toml() {
        let config = SchedConfig::from_toml_str(
            r#"
            nr_cpu_ids = 8
            online_cpus = "0-3"
            default_slice_ns = 5000000
            allow_per_cpu_pinning = false
            priority_tiebreak = "LifoOnEqual"

            [[dsq_preallocate_named]]
            id = 1
            order = "priority"

            [[dsq_preallocate_named]]
            id = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.nr_cpu_ids, 8);
        assert_eq!(config.online_mask().unwrap().to_string(), "0-3");
        assert_eq!(config.default_slice_ns, 5_000_000);
        assert!(!config.allow_per_cpu_pinning);
        assert_eq!(config.priority_tiebreak, PriorityTiebreak::LifoOnEqual);
        assert_eq!(
            config.dsq_preallocate_named,
            vec![
                NamedDsq {
                    id: 1,
                    order: DsqOrder::Priority
                },
                NamedDsq {
                    id: 2,
                    order: DsqOrder::Fifo
                },
            ]
        );
        // Unspecified fields keep their defaults.
        assert_eq!(config.max_tasks, 65536);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = |f: fn(&mut SchedConfig)| {
            let mut c = SchedConfig::default();
            f(&mut c);
            c.validate().is_err()
        };
        assert!(bad(|c| c.nr_cpu_ids = 0));
        assert!(bad(|c| c.nr_cpu_ids = 257));
        assert!(bad(|c| c.online_cpus = Some("none".into())));
        assert!(bad(|c| c.online_cpus = Some("0-9".into())));
        assert!(bad(|c| c.max_dsqs = 2));
        assert!(bad(|c| c.dsq_preallocate_named = vec![NamedDsq {
            id: DsqId::GLOBAL.0,
            order: DsqOrder::Fifo,
        }]));
        assert!(bad(|c| c.dsq_preallocate_named = vec![
            NamedDsq {
                id: 3,
                order: DsqOrder::Fifo,
            },
            NamedDsq {
                id: 3,
                order: DsqOrder::Priority,
            },
        ]));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nr_cpu_ids = 2\ndefault_slice_ns = 1000").unwrap();
        let config = SchedConfig::load(file.path()).unwrap();
        assert_eq!(config.nr_cpu_ids, 2);
        assert_eq!(config.default_slice_ns, 1000);
    }

    #[test]
    fn test_load_empty_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = SchedConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
