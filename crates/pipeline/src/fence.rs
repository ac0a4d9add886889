//! Host-side bookkeeping for the two cross-device fences.
//!
//! The relay uses one fence per direction:
//! - [`FenceRole::Render`] is signaled by the producer after a slot is
//!   written and awaited by the consumer before copying it.
//! - [`FenceRole::Present`] is signaled by the consumer after the copy and
//!   awaited by the producer before it overwrites the slot, and by the host
//!   for frame pacing.
//!
//! A [`FenceTimeline`] hands out strictly increasing values to signal and
//! tracks the highest value observed as completed.

use std::fmt;

use crate::error::{RelayError, RelayResult};

/// Which of the two shared fences a value belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceRole {
    /// Producer to consumer: the slot has been written.
    Render,
    /// Consumer to producer and host: the slot has been read.
    Present,
}

impl fmt::Display for FenceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FenceRole::Render => "render",
            FenceRole::Present => "present",
        })
    }
}

/// A value signaled on one of the shared fences.
///
/// Values of different fences are unrelated, so there is no total order;
/// use [`FenceValue::follows`] to compare two values of the same fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceValue {
    role: FenceRole,
    value: u64,
}

impl FenceValue {
    /// The fence this value is signaled on.
    #[inline]
    pub fn role(&self) -> FenceRole {
        self.role
    }

    /// The raw counter value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.value
    }

    /// Whether this value was signaled after `earlier` on the same fence.
    /// Values of the other fence never follow.
    #[inline]
    pub fn follows(&self, earlier: FenceValue) -> bool {
        self.role == earlier.role && self.value > earlier.value
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.value)
    }
}

/// Signal and completion tracking for one shared fence.
#[derive(Debug)]
pub struct FenceTimeline {
    role: FenceRole,
    last_signaled: u64,
    last_completed: u64,
}

impl FenceTimeline {
    /// Starts tracking a fence whose counter currently holds `initial`.
    pub fn new(role: FenceRole, initial: u64) -> Self {
        Self {
            role,
            last_signaled: initial,
            last_completed: initial,
        }
    }

    /// The fence being tracked.
    #[inline]
    pub fn role(&self) -> FenceRole {
        self.role
    }

    /// Reserves the next value to signal. Values are strictly increasing.
    pub fn advance(&mut self) -> RelayResult<FenceValue> {
        let value = self
            .last_signaled
            .checked_add(1)
            .ok_or(RelayError::FenceRegression {
                role: self.role,
                value: self.last_signaled,
                last: self.last_signaled,
            })?;
        self.last_signaled = value;
        Ok(FenceValue {
            role: self.role,
            value,
        })
    }

    /// Records a completed value reported by the device.
    ///
    /// Completed values never move backwards and never pass the last
    /// signaled value.
    pub fn observe(&mut self, completed: u64) -> RelayResult<()> {
        if completed > self.last_signaled {
            return Err(RelayError::FenceOverrun {
                role: self.role,
                completed,
                signaled: self.last_signaled,
            });
        }
        if completed < self.last_completed {
            return Err(RelayError::FenceRegression {
                role: self.role,
                value: completed,
                last: self.last_completed,
            });
        }
        self.last_completed = completed;
        Ok(())
    }

    /// Whether `value` is known to have completed.
    #[inline]
    pub fn is_retired(&self, value: FenceValue) -> bool {
        debug_assert_eq!(value.role, self.role);
        self.last_completed >= value.value
    }

    /// Most recently reserved value, if any was reserved.
    pub fn last_signaled(&self) -> Option<FenceValue> {
        (self.last_signaled > 0).then_some(FenceValue {
            role: self.role,
            value: self.last_signaled,
        })
    }

    /// Highest value observed as completed.
    #[inline]
    pub fn last_completed(&self) -> u64 {
        self.last_completed
    }

    /// Whether signaled work has not been observed complete yet.
    #[inline]
    pub fn has_outstanding(&self) -> bool {
        self.last_completed < self.last_signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_strictly_increase() {
        let mut timeline = FenceTimeline::new(FenceRole::Render, 0);
        let first = timeline.advance().unwrap();
        let second = timeline.advance().unwrap();
        assert_eq!(first.get(), 1);
        assert!(second.follows(first));
        assert!(!first.follows(second));
        assert!(!first.follows(first));
        assert_eq!(timeline.last_signaled(), Some(second));
    }

    #[test]
    fn test_values_of_other_fence_never_follow() {
        let mut render = FenceTimeline::new(FenceRole::Render, 0);
        let mut present = FenceTimeline::new(FenceRole::Present, 0);
        let render_value = render.advance().unwrap();
        render.advance().unwrap();
        let late_render = render.advance().unwrap();
        let present_value = present.advance().unwrap();

        assert_eq!(late_render.get(), 3);
        assert!(!late_render.follows(present_value));
        assert!(!present_value.follows(render_value));
    }

    #[test]
    fn test_observe_tracks_retirement() {
        let mut timeline = FenceTimeline::new(FenceRole::Present, 0);
        let first = timeline.advance().unwrap();
        let second = timeline.advance().unwrap();
        assert!(timeline.has_outstanding());

        timeline.observe(1).unwrap();
        assert!(timeline.is_retired(first));
        assert!(!timeline.is_retired(second));

        timeline.observe(2).unwrap();
        assert!(timeline.is_retired(second));
        assert!(!timeline.has_outstanding());
    }

    #[test]
    fn test_observe_rejects_regression() {
        let mut timeline = FenceTimeline::new(FenceRole::Present, 0);
        timeline.advance().unwrap();
        timeline.advance().unwrap();
        timeline.observe(2).unwrap();
        assert!(matches!(
            timeline.observe(1),
            Err(RelayError::FenceRegression { .. })
        ));
    }

    #[test]
    fn test_observe_rejects_overrun() {
        let mut timeline = FenceTimeline::new(FenceRole::Render, 0);
        timeline.advance().unwrap();
        assert!(matches!(
            timeline.observe(5),
            Err(RelayError::FenceOverrun { .. })
        ));
    }

    #[test]
    fn test_nothing_signaled_yet() {
        let timeline = FenceTimeline::new(FenceRole::Render, 0);
        assert_eq!(timeline.last_signaled(), None);
        assert!(!timeline.has_outstanding());
    }

    #[test]
    fn test_display() {
        let mut timeline = FenceTimeline::new(FenceRole::Present, 41);
        assert_eq!(timeline.advance().unwrap().to_string(), "present#42");
    }
}
