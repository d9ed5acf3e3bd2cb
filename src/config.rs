use std::str::FromStr;

use crate::address::{align_up, page_size};
use crate::error::{HeapError, HeapResult};

/// How the heap's backing memory is split into belts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeltLayout {
    /// Two belts of equal size.
    SemiSpace,
    /// One belt per entry, each getting the given percentage of the heap size.
    Percentages(Vec<usize>),
}

impl BeltLayout {
    pub fn percentages(&self) -> Vec<usize> {
        match self {
            Self::SemiSpace => vec![50, 50],
            Self::Percentages(p) => p.clone(),
        }
    }
}

/// Collector algorithm selected at heap creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScavengeMode {
    Sequential,
    Parallel { workers: usize },
}

impl FromStr for ScavengeMode {
    type Err = HeapError;

    /// Accepts `sequential`, `parallel` (one worker per CPU) and `parallel:<n>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("sequential") {
            return Ok(Self::Sequential);
        }
        if s.eq_ignore_ascii_case("parallel") {
            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            return Ok(Self::Parallel { workers });
        }
        if let Some(n) = s.strip_prefix("parallel:") {
            let workers = n.parse::<usize>().map_err(|_| {
                HeapError::Configuration(format!("bad worker count in scavenge mode '{}'", s))
            })?;
            return Ok(Self::Parallel { workers });
        }
        Err(HeapError::Configuration(format!(
            "unknown scavenge mode '{}'",
            s
        )))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationPolicy {
    /// Report the violation and abort the process.
    Abort,
    /// Log the violation, count it in the statistics and carry on.
    Log,
}

/// What happens to a belt once every live object has been copied out of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WipePolicy {
    /// Overwrite with [`WIPE_PATTERN`](crate::belt::WIPE_PATTERN).
    Pattern,
    /// Return the pages to the OS; they read back as zero.
    Decommit,
    Skip,
}

/// Configuration for heap constructor. Read once, never re-read.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes shared by all belts.
    pub heap_size: usize,
    pub belt_layout: BeltLayout,
    /// Size of the immortal boot image region.
    pub boot_region_size: usize,
    /// Size of the immortal region holding code reference-literal tables.
    pub code_region_size: usize,
    pub scavenge_mode: ScavengeMode,
    /// Default size of a mutator thread-local allocation buffer.
    pub tlab_size: usize,
    /// Size of the buffers parallel workers copy into.
    pub gc_lab_size: usize,
    /// Objects at or above this size bypass TLABs.
    pub large_object_threshold: usize,
    pub verify_before_gc: bool,
    pub verify_after_gc: bool,
    pub verification_policy: VerificationPolicy,
    pub wipe_policy: WipePolicy,
    /// Collect before every allocation that reaches the belt slow path.
    pub gc_before_allocation: bool,
    /// Enables verbose logging
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024,
            belt_layout: BeltLayout::SemiSpace,
            boot_region_size: 1024 * 1024,
            code_region_size: 256 * 1024,
            scavenge_mode: ScavengeMode::Sequential,
            tlab_size: 32 * 1024,
            gc_lab_size: 16 * 1024,
            large_object_threshold: 8 * 1024,
            verify_before_gc: false,
            verify_after_gc: false,
            verification_policy: VerificationPolicy::Abort,
            wipe_policy: WipePolicy::Pattern,
            gc_before_allocation: false,
            verbose: false,
        }
    }
}

impl Config {
    /// Rejects configurations that cannot produce a working heap.
    pub fn validate(&self) -> HeapResult<()> {
        let percentages = self.belt_layout.percentages();
        if percentages.len() < 2 {
            return Err(HeapError::Configuration(format!(
                "a copying heap needs at least two belts, got {}",
                percentages.len()
            )));
        }
        if percentages.iter().sum::<usize>() != 100 {
            return Err(HeapError::Configuration(format!(
                "belt percentages {:?} do not sum to 100",
                percentages
            )));
        }
        if percentages.iter().any(|p| *p == 0) {
            return Err(HeapError::Configuration(format!(
                "belt percentages {:?} contain a zero-sized belt",
                percentages
            )));
        }
        if self.heap_size == 0 {
            return Err(HeapError::Configuration("heap size is zero".to_string()));
        }
        if let ScavengeMode::Parallel { workers: 0 } = self.scavenge_mode {
            return Err(HeapError::Configuration(
                "parallel scavenging needs at least one worker".to_string(),
            ));
        }
        if self.tlab_size == 0 || self.gc_lab_size == 0 {
            return Err(HeapError::Configuration(
                "allocation buffer sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn page_rounded(size: usize) -> usize {
        align_up(size, page_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scavenge_mode() {
        assert_eq!(
            "sequential".parse::<ScavengeMode>().unwrap(),
            ScavengeMode::Sequential
        );
        assert_eq!(
            "parallel:4".parse::<ScavengeMode>().unwrap(),
            ScavengeMode::Parallel { workers: 4 }
        );
        assert!("parallel:x".parse::<ScavengeMode>().is_err());
        assert!("generational".parse::<ScavengeMode>().is_err());
    }

    #[test]
    fn rejects_bad_layouts() {
        let mut config = Config::default();
        config.belt_layout = BeltLayout::Percentages(vec![60, 30]);
        assert!(config.validate().is_err());
        config.belt_layout = BeltLayout::Percentages(vec![100]);
        assert!(config.validate().is_err());
        config.belt_layout = BeltLayout::Percentages(vec![100, 0]);
        assert!(config.validate().is_err());
        config.belt_layout = BeltLayout::Percentages(vec![60, 40]);
        assert!(config.validate().is_ok());
        config.scavenge_mode = ScavengeMode::Parallel { workers: 0 };
        assert!(config.validate().is_err());
    }
}
