use serde::{Deserialize, Serialize};

/// Scheduling weight of a task.
///
/// Higher weights receive proportionally more dispatch opportunities; the
/// set is fixed and ordered from [`Priority::Low`] to [`Priority::High`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    MediumLow,
    #[default]
    Medium,
    MediumHigh,
    High,
}

impl Priority {
    /// Every priority, lowest first.
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::MediumLow,
        Priority::Medium,
        Priority::MediumHigh,
        Priority::High,
    ];

    /// The numeric weight of this priority.
    pub fn value(self) -> u32 {
        match self {
            Priority::Low => 16,
            Priority::MediumLow => 64,
            Priority::Medium => 128,
            Priority::MediumHigh => 192,
            Priority::High => 256,
        }
    }

    /// The next higher priority, saturating at [`Priority::High`].
    pub fn higher(self) -> Priority {
        match self {
            Priority::Low => Priority::MediumLow,
            Priority::MediumLow => Priority::Medium,
            Priority::Medium => Priority::MediumHigh,
            Priority::MediumHigh | Priority::High => Priority::High,
        }
    }

    /// The next lower priority, saturating at [`Priority::Low`].
    pub fn lower(self) -> Priority {
        match self {
            Priority::Low | Priority::MediumLow => Priority::Low,
            Priority::Medium => Priority::MediumLow,
            Priority::MediumHigh => Priority::Medium,
            Priority::High => Priority::MediumHigh,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbors_saturate_at_the_ends() {
        assert_eq!(Priority::High.higher(), Priority::High);
        assert_eq!(Priority::Low.lower(), Priority::Low);
        assert_eq!(Priority::Medium.higher(), Priority::MediumHigh);
        assert_eq!(Priority::Medium.lower(), Priority::MediumLow);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn ordering_follows_weight() {
        for pair in Priority::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].value() < pair[1].value());
        }
        assert_eq!(Priority::Medium.value(), 128);
    }
}
