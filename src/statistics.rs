use std::time::Duration;

/// Time spent in each phase of a collection cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PhaseTimes {
    pub root_scan: Duration,
    /// Scan of the dirty cards of the immortal regions.
    pub card_scan: Duration,
    pub copy: Duration,
    pub wipe: Duration,
    pub verification: Duration,
    pub total: Duration,
}

impl PhaseTimes {
    pub fn accumulate(&mut self, other: &PhaseTimes) {
        self.root_scan += other.root_scan;
        self.card_scan += other.card_scan;
        self.copy += other.copy;
        self.wipe += other.wipe;
        self.verification += other.verification;
        self.total += other.total;
    }
}

#[derive(Clone, Debug, Default)]
pub struct HeapStatistics {
    pub heap_size: usize,
    pub number_of_belts: usize,
    pub from_space_name: &'static str,
    pub from_space_size: usize,
    pub from_space_used: usize,
    pub immortal_size: usize,
    pub immortal_used: usize,
    pub total_gc_cycles_count: usize,
    pub total_objects_copied: usize,
    pub total_bytes_copied: usize,
    pub last_objects_copied: usize,
    pub last_bytes_copied: usize,
    pub verification_failures: usize,
    pub last_cycle: PhaseTimes,
    pub accumulated: PhaseTimes,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Heap size: {} in {} belts",
            formatted_size(self.heap_size),
            self.number_of_belts
        )?;
        writeln!(
            f,
            "  Allocation belt {}: {} of {} used",
            self.from_space_name,
            formatted_size(self.from_space_used),
            formatted_size(self.from_space_size)
        )?;
        writeln!(
            f,
            "  Immortal memory: {} of {} used",
            formatted_size(self.immortal_used),
            formatted_size(self.immortal_size)
        )?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Total objects copied: {} ({})",
            self.total_objects_copied,
            formatted_size(self.total_bytes_copied)
        )?;
        writeln!(
            f,
            "  Last cycle copied: {} objects ({})",
            self.last_objects_copied,
            formatted_size(self.last_bytes_copied)
        )?;
        if self.verification_failures != 0 {
            writeln!(f, "  Verification failures: {}", self.verification_failures)?;
        }
        writeln!(
            f,
            "  Last cycle: {:.3}ms (roots {:.3}ms, cards {:.3}ms, copy {:.3}ms, wipe {:.3}ms, verify {:.3}ms)",
            ms(self.last_cycle.total),
            ms(self.last_cycle.root_scan),
            ms(self.last_cycle.card_scan),
            ms(self.last_cycle.copy),
            ms(self.last_cycle.wipe),
            ms(self.last_cycle.verification)
        )?;
        writeln!(f, "  Total GC time: {:.3}ms", ms(self.accumulated.total))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(1536).to_string(), "1.5K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
        assert_eq!(formatted_size(2 * 1024 * 1024 * 1024).to_string(), "2.0G");
    }

    #[test]
    fn phase_times_accumulate() {
        let mut total = PhaseTimes::default();
        let cycle = PhaseTimes {
            copy: Duration::from_millis(3),
            total: Duration::from_millis(5),
            ..PhaseTimes::default()
        };
        total.accumulate(&cycle);
        total.accumulate(&cycle);
        assert_eq!(total.copy, Duration::from_millis(6));
        assert_eq!(total.total, Duration::from_millis(10));
    }
}
