use serde::{Deserialize, Serialize};

/// Age assigned on the first divergent sample. The divergent sample itself
/// counts as one cycle and confirmation happens on the following one, so a
/// threshold of N spans N observation cycles from first divergence.
pub const INITIAL_PENDING_AGE: u32 = 2;

// Switch and fault lines settle over three 1 Hz polls, PIR modules hold their
// output high on their own and need no extra delay.
pub const DEFAULT_SWITCH_THRESHOLD: u32 = 3;
pub const DEFAULT_MOTION_THRESHOLD: u32 = 1;
pub const DEFAULT_FAULT_THRESHOLD: u32 = 3;

/// Result of a single [`DebounceFilter::update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceUpdate<T> {
    pub changed: bool,
    pub confirmed: T,
}

/// Confirmed-value tracker with a hysteresis delay measured in samples.
///
/// A sample that differs from the confirmed value opens a pending window.
/// Seeing the old confirmed value again inside the window retracts it;
/// otherwise the confirmed value is replaced by whatever sample is current
/// once the window has aged past the threshold.
///
/// While pending, only equality with the confirmed value cancels the window.
/// Intermediate samples that differ from both the confirmed value and from
/// each other keep aging it, so the committed value can differ from the
/// sample that opened the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceFilter<T> {
    confirmed: T,
    pending: bool,
    age: u32,
    threshold: u32,
}

impl<T: PartialEq + Clone> DebounceFilter<T> {
    pub fn new(initial: T, threshold: u32) -> Self {
        Self {
            confirmed: initial,
            pending: false,
            age: 0,
            threshold,
        }
    }

    /// Feed one raw sample. A non-zero `threshold_override` replaces the
    /// stored threshold from this call onward.
    pub fn update(&mut self, sample: T, threshold_override: u32) -> DebounceUpdate<T> {
        if threshold_override != 0 {
            self.threshold = threshold_override;
        }

        if self.pending {
            if sample == self.confirmed {
                // Retraction: back to the old value before the window closed
                self.pending = false;
                return self.unchanged();
            }

            if self.age >= self.threshold {
                self.confirmed = sample;
                self.pending = false;
                return DebounceUpdate {
                    changed: true,
                    confirmed: self.confirmed.clone(),
                };
            }

            self.age = self.age.saturating_add(1);
            return self.unchanged();
        }

        if sample != self.confirmed {
            self.age = INITIAL_PENDING_AGE;
            self.pending = true;
        }

        self.unchanged()
    }

    /// Shorthand for [`update`](Self::update) without a threshold override.
    pub fn sample(&mut self, sample: T) -> DebounceUpdate<T> {
        self.update(sample, 0)
    }

    fn unchanged(&self) -> DebounceUpdate<T> {
        DebounceUpdate {
            changed: false,
            confirmed: self.confirmed.clone(),
        }
    }

    pub fn confirmed(&self) -> &T {
        &self.confirmed
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_input_is_noop() {
        let mut filter = DebounceFilter::new(0u8, 3);
        for _ in 0..10 {
            let result = filter.sample(0);
            assert!(!result.changed);
            assert_eq!(result.confirmed, 0);
        }
        assert!(!filter.is_pending());
    }

    #[test]
    fn test_divergence_starts_at_age_two() {
        let mut filter = DebounceFilter::new(0u8, 3);
        let result = filter.sample(1);
        assert!(!result.changed);
        assert!(filter.is_pending());
        assert_eq!(filter.age(), INITIAL_PENDING_AGE);
    }

    #[test]
    fn test_threshold_override_is_sticky() {
        let mut filter = DebounceFilter::new(0u8, 3);
        filter.update(0, 5);
        assert_eq!(filter.threshold(), 5);
        filter.update(0, 0);
        assert_eq!(filter.threshold(), 5);
    }

    #[test]
    fn test_threshold_one_confirms_on_second_sample() {
        let mut filter = DebounceFilter::new(0u8, DEFAULT_MOTION_THRESHOLD);
        assert!(!filter.sample(1).changed);
        let result = filter.sample(1);
        assert!(result.changed);
        assert_eq!(result.confirmed, 1);
    }
}
