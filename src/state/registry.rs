//! Registry references and collector control

use tracing::debug;

use super::State;

/// Reference returned for a nil value
pub const REFNIL: i32 = -1;

/// A reference that refers to nothing
pub const NOREF: i32 = -2;

/// Slot of the free-list head in a reference table
const FREELIST: i64 = 0;

/// Collector requests for [`State::gc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCommand {
    /// Disable automatic collection
    Stop,
    /// Enable automatic collection
    Restart,
    /// Run a full cycle
    Collect,
    /// Memory in use, in kilobytes
    Count,
    /// Remainder of the memory in use modulo 1024
    CountBytes,
    /// Run a step; reports 1 when a cycle finished
    Step(i32),
    /// Set the pause percentage; reports the previous one
    SetPause(i32),
}

impl State {
    /// Pop the top value and store it in table `t` under a fresh integer key
    ///
    /// Returns the key, or [`REFNIL`] for nil (which is not stored). Keys
    /// released with [`State::unreference`] are reused.
    pub fn reference(&mut self, t: i32) -> i32 {
        let t = self.abs_index(t);
        if self.is_nil(-1) {
            self.pop(1);
            return REFNIL;
        }
        self.raw_geti(t, FREELIST);
        let free = self.to_integer(-1);
        self.pop(1);
        let r = if free != 0 {
            self.raw_geti(t, free);
            self.raw_seti(t, FREELIST);
            free
        } else {
            self.obj_len(t) as i64 + 1
        };
        self.raw_seti(t, r);
        r as i32
    }

    /// Release reference `r` of table `t`
    pub fn unreference(&mut self, t: i32, r: i32) {
        if r < 0 {
            return;
        }
        let t = self.abs_index(t);
        self.raw_geti(t, FREELIST);
        self.raw_seti(t, r as i64);
        self.push_integer(r as i64);
        self.raw_seti(t, FREELIST);
    }

    /// Control the collector
    pub fn gc(&mut self, cmd: GcCommand) -> i32 {
        let result = match cmd {
            GcCommand::Stop => {
                self.heap_mut().gc.enabled = false;
                0
            }
            GcCommand::Restart => {
                self.heap_mut().gc.enabled = true;
                0
            }
            GcCommand::Collect => {
                self.collect_garbage();
                0
            }
            GcCommand::Count => (self.heap().gc.allocated >> 10) as i32,
            GcCommand::CountBytes => (self.heap().gc.allocated & 0x3ff) as i32,
            GcCommand::Step(_) => {
                self.collect_garbage();
                1
            }
            GcCommand::SetPause(pause) => {
                let mut heap = self.heap_mut();
                let old = heap.gc.pause;
                heap.gc.pause = pause.max(100) as usize;
                old as i32
            }
        };
        debug!(env = %self.env.id, command = ?cmd, result, "gc request");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::REGISTRY_INDEX;
    use super::*;

    #[test]
    fn test_references_are_reused() {
        let mut state = State::new();
        state.push_string("first");
        let a = state.reference(REGISTRY_INDEX);
        state.push_string("second");
        let b = state.reference(REGISTRY_INDEX);
        assert!(a > 0 && b > 0 && a != b);
        assert_eq!(state.get_top(), 0);

        state.raw_geti(REGISTRY_INDEX, a as i64);
        assert_eq!(state.to_string(-1).as_deref(), Some("first"));
        state.pop(1);

        state.unreference(REGISTRY_INDEX, a);
        state.push_string("third");
        assert_eq!(state.reference(REGISTRY_INDEX), a);
        state.raw_geti(REGISTRY_INDEX, b as i64);
        assert_eq!(state.to_string(-1).as_deref(), Some("second"));
    }

    #[test]
    fn test_nil_reference() {
        let mut state = State::new();
        state.push_nil();
        assert_eq!(state.reference(REGISTRY_INDEX), REFNIL);
        assert_eq!(state.get_top(), 0);
        state.unreference(REGISTRY_INDEX, REFNIL);
        state.unreference(REGISTRY_INDEX, NOREF);
    }

    #[test]
    fn test_referenced_table_survives_collection() {
        let mut state = State::new();
        state.new_table();
        state.push_integer(5);
        state.set_field(-2, "five").unwrap();
        let r = state.reference(REGISTRY_INDEX);
        state.gc(GcCommand::Collect);
        state.raw_geti(REGISTRY_INDEX, r as i64);
        state.get_field(-1, "five").unwrap();
        assert_eq!(state.to_integer(-1), 5);
    }

    #[test]
    fn test_gc_commands() {
        let mut state = State::new();
        assert_eq!(state.gc(GcCommand::SetPause(150)), 200);
        assert_eq!(state.gc(GcCommand::SetPause(300)), 150);
        assert_eq!(state.gc(GcCommand::Stop), 0);
        assert!(!state.heap().gc.enabled);
        state.gc(GcCommand::Restart);
        assert!(state.heap().gc.enabled);

        for i in 0..100 {
            state.push_string(&format!("garbage {}", i));
        }
        state.pop(100);
        let before = state.gc(GcCommand::Count) * 1024 + state.gc(GcCommand::CountBytes);
        assert_eq!(state.gc(GcCommand::Step(0)), 1);
        let after = state.gc(GcCommand::Count) * 1024 + state.gc(GcCommand::CountBytes);
        assert!(after < before);
    }
}
