//! Capacity tracker — (current, maximum) per machine.
//!
//! `current` is always derived from the live container count by the
//! implementor; nothing here keeps a separate counter.

use serde::{Deserialize, Serialize};
use tracing::error;

/// Slot usage of one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRecord {
    pub current: u32,
    pub maximum: u32,
}

/// Anything with a bounded number of container slots.
pub trait Capacitated {
    /// Id used when reporting invariant violations.
    fn capacity_id(&self) -> &str;

    fn capacity(&self) -> CapacityRecord;

    fn has_spare_capacity(&self) -> bool {
        self.spare_capacity() > 0
    }

    fn spare_capacity(&self) -> u32 {
        spare_capacity(self.capacity_id(), self.capacity())
    }
}

/// `maximum - current`, never negative.
///
/// `current > maximum` breaks the capacity invariant; it is logged and
/// treated as zero spare.
pub fn spare_capacity(machine: &str, record: CapacityRecord) -> u32 {
    if record.current > record.maximum {
        error!(
            %machine,
            current = record.current,
            maximum = record.maximum,
            "capacity invariant violated: current exceeds maximum"
        );
        return 0;
    }
    record.maximum - record.current
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(CapacityRecord);

    impl Capacitated for Fixed {
        fn capacity_id(&self) -> &str {
            "m-test"
        }
        fn capacity(&self) -> CapacityRecord {
            self.0
        }
    }

    #[test]
    fn spare_is_maximum_minus_current() {
        let m = Fixed(CapacityRecord { current: 1, maximum: 4 });
        assert_eq!(m.spare_capacity(), 3);
        assert!(m.has_spare_capacity());
    }

    #[test]
    fn full_machine_has_no_spare() {
        let m = Fixed(CapacityRecord { current: 4, maximum: 4 });
        assert_eq!(m.spare_capacity(), 0);
        assert!(!m.has_spare_capacity());
    }

    #[test]
    fn overfull_machine_reports_zero_spare() {
        let m = Fixed(CapacityRecord { current: 6, maximum: 4 });
        assert_eq!(m.spare_capacity(), 0);
        assert!(!m.has_spare_capacity());
    }

    #[test]
    fn zero_maximum_never_has_spare() {
        assert_eq!(spare_capacity("m", CapacityRecord { current: 0, maximum: 0 }), 0);
    }
}
