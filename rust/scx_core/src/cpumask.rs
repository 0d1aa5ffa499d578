//! # Cpumask
//!
//! A Cpumask is a `BitVec` of u64's sized to the number of possible CPUs,
//! along with helpers for building, querying and combining masks. Task
//! affinity (`allowed_cpus`) and the online set are both Cpumasks.
//!
//!```
//!     use scx_core::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     assert!(!mask.test_cpu(0));
//!     mask.set_cpu(0).unwrap();
//!     assert!(mask.test_cpu(0));
//!
//!     let list = Cpumask::from_cpulist(8, "0-2,6").unwrap();
//!     assert_eq!(list.weight(), 4);
//!     assert_eq!(list.to_string(), "0-2,6");
//!```

use std::fmt;

use anyhow::bail;
use anyhow::Context;
use bitvec::prelude::*;

use crate::error::{Result, ScxError};
use crate::types::CpuId;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            return Err(ScxError::bad_cpu(CpuId(cpu as u32), "beyond nr_cpu_ids"));
        }
        Ok(())
    }

    /// Build a new empty Cpumask covering `nr_cpu_ids` CPUs.
    pub fn new(nr_cpu_ids: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpu_ids],
        }
    }

    /// Build a Cpumask with every CPU set.
    pub fn full(nr_cpu_ids: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpu_ids],
        }
    }

    /// Build a Cpumask from a cpulist string such as `"0-3,6"`. The
    /// special values `"all"` and `"none"` are accepted as well.
    pub fn from_cpulist(nr_cpu_ids: usize, cpulist: &str) -> anyhow::Result<Cpumask> {
        match cpulist.trim() {
            "all" => return Ok(Cpumask::full(nr_cpu_ids)),
            "none" | "" => return Ok(Cpumask::new(nr_cpu_ids)),
            _ => {}
        }
        let mut mask = Cpumask::new(nr_cpu_ids);
        for cpu in read_cpulist(cpulist)? {
            if cpu >= nr_cpu_ids {
                bail!(
                    "Found cpu ({}) in cpulist ({}) beyond nr_cpu_ids ({})",
                    cpu,
                    cpulist,
                    nr_cpu_ids
                );
            }
            mask.mask.set(cpu, true);
        }
        Ok(mask)
    }

    /// Build a Cpumask from explicit CPU ids.
    pub fn from_cpus(nr_cpu_ids: usize, cpus: &[CpuId]) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpu_ids);
        for &cpu in cpus {
            mask.set_cpu(cpu.0 as usize)?;
        }
        Ok(mask)
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. CPUs beyond
    /// the size of the mask are never set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Iterate over the indices of the set bits.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

pub fn read_cpulist(cpulist: &str) -> anyhow::Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0');
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let group = group.trim();
        let (min, max) = match group.split_once('-') {
            Some((lo, hi)) => (
                lo.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {group}"))?,
                hi.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {group}"))?,
            ),
            None => {
                let cpu = group
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {group}"))?;
                (cpu, cpu)
            }
        };
        if min > max {
            bail!("Invalid cpu range {}", group);
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

/// Formats as a cpulist, collapsing runs (`0-3,6`).
impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cpulist() {
        let mask = Cpumask::from_cpulist(8, "0-2,5").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 5]);
        assert_eq!(mask.to_string(), "0-2,5");
        assert_eq!(Cpumask::from_cpulist(4, "all").unwrap().weight(), 4);
        assert!(Cpumask::from_cpulist(4, "none").unwrap().is_empty());
    }

    #[test]
    fn test_from_cpulist_rejects_out_of_range() {
        assert!(Cpumask::from_cpulist(4, "0-4").is_err());
        assert!(Cpumask::from_cpulist(4, "3-1").is_err());
        assert!(Cpumask::from_cpulist(4, "x").is_err());
    }

    #[test]
    fn test_set_and_test() {
        let mut mask = Cpumask::new(4);
        assert!(mask.is_empty());
        mask.set_cpu(3).unwrap();
        assert!(mask.test_cpu(3));
        assert!(!mask.test_cpu(7));
        assert!(matches!(mask.set_cpu(4), Err(ScxError::BadCpu { .. })));
        assert_eq!(mask.weight(), 1);
    }

    #[test]
    fn test_from_cpus() {
        let mask = Cpumask::from_cpus(4, &[CpuId(1), CpuId(2)]).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(mask, Cpumask::from_cpulist(4, "1-2").unwrap());
        assert!(Cpumask::from_cpus(4, &[CpuId(4)]).is_err());
    }
}
