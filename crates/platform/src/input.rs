//! Keyboard handling for the relay window. Only the stop key matters.

use std::collections::HashSet;

pub use winit::keyboard::KeyCode;

/// Key that ends the relay loop.
pub const STOP_KEY: KeyCode = KeyCode::Escape;

/// Latches a fresh press of [`STOP_KEY`].
///
/// Held keys are tracked so that OS auto-repeat of a held stop key is not
/// mistaken for a second press after the latch has been taken.
#[derive(Debug, Default)]
pub struct StopKeyWatch {
    held: HashSet<KeyCode>,
    stop_latched: bool,
}

impl StopKeyWatch {
    pub fn pressed(&mut self, key: KeyCode) {
        let fresh = self.held.insert(key);
        if fresh && key == STOP_KEY {
            self.stop_latched = true;
        }
    }

    pub fn released(&mut self, key: KeyCode) {
        self.held.remove(&key);
    }

    /// Returns whether a stop press arrived since the last call, clearing it.
    pub fn take_stop(&mut self) -> bool {
        std::mem::take(&mut self.stop_latched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_stop_key_latches() {
        let mut keys = StopKeyWatch::default();
        keys.pressed(KeyCode::Space);
        assert!(!keys.take_stop());

        keys.pressed(STOP_KEY);
        assert!(keys.take_stop());
        assert!(!keys.take_stop());
    }

    #[test]
    fn test_repeat_of_held_key_is_ignored() {
        let mut keys = StopKeyWatch::default();
        keys.pressed(STOP_KEY);
        assert!(keys.take_stop());

        keys.pressed(STOP_KEY);
        assert!(!keys.take_stop());

        keys.released(STOP_KEY);
        keys.pressed(STOP_KEY);
        assert!(keys.take_stop());
    }
}
