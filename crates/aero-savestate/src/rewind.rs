//! Multi-step rewind over a byte-budgeted ring of binary snapshots.
//!
//! The cursor is the slot the next capture writes; slots before it are history, and stepping
//! back moves the cursor down one slot and loads that state. Capturing after stepping back makes
//! every later slot unreachable, since that future was recorded with different inputs.

use std::collections::VecDeque;

use crate::config::RewindConfig;
use crate::error::{RewindError, SaveError};
use crate::manager::SaveManager;
use crate::memory::StateMemory;

/// One stored binary snapshot.
#[derive(Debug, Default)]
pub struct RamState {
    valid: bool,
    time: u64,
    data: Vec<u8>,
}

impl RamState {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Logical time passed to the capture that filled this state.
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn save<M: StateMemory>(
        &mut self,
        manager: &mut SaveManager<M>,
        mem: &mut M,
        time: u64,
    ) -> Result<(), SaveError> {
        self.valid = false;
        let len = usize::try_from(manager.binary_size())
            .map_err(|_| SaveError::Corrupt("state too large"))?;
        self.data.resize(len, 0);
        manager.save_binary(mem, &mut self.data)?;
        self.time = time;
        self.valid = true;
        Ok(())
    }

    fn load<M: StateMemory>(
        &self,
        manager: &mut SaveManager<M>,
        mem: &mut M,
    ) -> Result<(), SaveError> {
        manager.load_binary(mem, &self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindOperation {
    Capture,
    Step,
}

#[derive(Debug)]
pub struct Rewinder {
    enabled: bool,
    capacity: u64,
    states: VecDeque<RamState>,
    cursor: usize,
    first_invalid: Option<usize>,
    capacity_noted: bool,
}

impl Rewinder {
    pub fn new(config: RewindConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.capacity_bytes,
            states: VecDeque::new(),
            cursor: 0,
            first_invalid: None,
            capacity_noted: false,
        }
    }

    /// Builds a rewinder sized for a sealed manager's snapshots.
    pub fn for_manager<M: StateMemory>(
        config: RewindConfig,
        manager: &SaveManager<M>,
    ) -> Result<Self, SaveError> {
        if !manager.is_sealed() {
            return Err(SaveError::NotSealed);
        }
        let mut rewinder = Self::new(config);
        rewinder.clamp_capacity(manager.binary_size());
        Ok(rewinder)
    }

    /// Disables rewind if the budget cannot hold even one snapshot of `snapshot_size` bytes.
    pub fn clamp_capacity(&mut self, snapshot_size: u64) {
        if self.enabled && self.capacity < snapshot_size {
            self.enabled = false;
            tracing::warn!(
                capacity = self.capacity,
                snapshot_size,
                "rewind disabled: capacity is smaller than one save state"
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    /// Number of allocated slots, valid or not.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.states.iter().filter(|s| s.valid).count()
    }

    /// Slot the next capture writes.
    pub fn current_index(&self) -> usize {
        self.cursor
    }

    pub fn first_invalid_index(&self) -> Option<usize> {
        self.first_invalid
    }

    pub fn state_time(&self, index: usize) -> Option<u64> {
        self.states.get(index).filter(|s| s.valid).map(RamState::time)
    }

    pub fn state(&self, index: usize) -> Option<&RamState> {
        self.states.get(index)
    }

    /// Captures the current state at logical time `time`; returns its 1-based slot number.
    pub fn capture<M: StateMemory>(
        &mut self,
        manager: &mut SaveManager<M>,
        mem: &mut M,
        time: u64,
    ) -> Result<usize, RewindError> {
        if !self.enabled {
            return Err(RewindError::Disabled);
        }

        let snapshot_size = manager.binary_size().max(1);
        let max_states = usize::try_from(self.capacity / snapshot_size)
            .unwrap_or(usize::MAX)
            .max(1);

        let slot = if self.cursor < self.states.len() {
            self.invalidate_from(self.cursor);
            self.cursor
        } else if self.states.len() < max_states {
            self.states.push_back(RamState::default());
            self.states.len() - 1
        } else {
            self.recycle_oldest(snapshot_size);
            self.states.len() - 1
        };

        if let Err(err) = self.states[slot].save(manager, mem, time) {
            self.cursor = slot;
            self.first_invalid = Some(slot);
            return Err(err.into());
        }

        self.cursor = slot + 1;
        self.first_invalid = (self.cursor < self.states.len()).then_some(self.cursor);
        tracing::debug!(slot, time, "captured rewind state");
        Ok(slot + 1)
    }

    /// Steps back one state and loads it; returns its 1-based slot number.
    ///
    /// A failed load leaves the cursor on the failed slot.
    pub fn step<M: StateMemory>(
        &mut self,
        manager: &mut SaveManager<M>,
        mem: &mut M,
    ) -> Result<usize, RewindError> {
        if !self.enabled {
            return Err(RewindError::Disabled);
        }

        let reachable = match self.first_invalid {
            Some(first_invalid) => self.cursor.min(first_invalid),
            None => self.cursor,
        };
        let Some(index) = reachable.checked_sub(1) else {
            return Err(RewindError::NotFound);
        };
        if !self.states[index].valid {
            return Err(RewindError::NotFound);
        }

        self.cursor = index;
        self.states[index].load(manager, mem)?;
        tracing::info!(
            slot = index,
            time = self.states[index].time,
            "loaded rewind state"
        );
        Ok(index + 1)
    }

    fn invalidate_from(&mut self, index: usize) {
        for state in self.states.iter_mut().skip(index) {
            state.valid = false;
        }
        self.first_invalid = Some(index);
    }

    fn recycle_oldest(&mut self, snapshot_size: u64) {
        if let Some(mut oldest) = self.states.pop_front() {
            oldest.valid = false;
            self.states.push_back(oldest);
        }
        if !self.capacity_noted {
            self.capacity_noted = true;
            tracing::warn!(
                capacity = self.capacity,
                snapshot_size,
                states = self.states.len(),
                "rewind capacity reached; oldest states will be dropped"
            );
        }
    }
}

/// Short end-user notification for the outcome of a rewind operation.
pub fn status_message(operation: RewindOperation, result: &Result<usize, RewindError>) -> String {
    let verb = match operation {
        RewindOperation::Capture => "save",
        RewindOperation::Step => "load",
    };
    match result {
        Ok(index) => {
            let done = match operation {
                RewindOperation::Capture => "captured",
                RewindOperation::Step => "loaded",
            };
            format!("Rewind state {index} {done}.")
        }
        Err(RewindError::Disabled) => "Rewind error: Rewind is disabled.".to_string(),
        Err(RewindError::NotFound) => "Rewind error: No rewind state to load.".to_string(),
        Err(RewindError::Save(err)) if err.is_registration_error() => {
            format!("Rewind error: Unable to {verb} state due to illegal registrations.")
        }
        Err(RewindError::Save(SaveError::InvalidHeader(_))) => {
            format!("Rewind error: Unable to {verb} state due to an invalid header.")
        }
        Err(RewindError::Save(SaveError::ReadError { .. })) => {
            format!("Rewind error: Unable to {verb} state due to a read error.")
        }
        Err(RewindError::Save(SaveError::WriteError { .. })) => {
            format!("Rewind error: Unable to {verb} state due to a write error.")
        }
        Err(RewindError::Save(err)) => format!("Rewind error: Unable to {verb} state: {err}."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StateArena;

    fn counter_machine() -> (SaveManager<StateArena>, StateArena, u64) {
        let mut arena = StateArena::new();
        let base = arena.alloc(8, 8).unwrap();
        let mut manager = SaveManager::new();
        manager.registrar().unwrap().reg::<u64>(base, "frame").unwrap();
        manager.seal().unwrap();
        (manager, arena, base)
    }

    fn enabled(capacity_bytes: u64) -> RewindConfig {
        RewindConfig {
            enabled: true,
            capacity_bytes,
        }
    }

    #[test]
    fn disabled_rewinder_reports_disabled() {
        let (mut manager, mut arena, _) = counter_machine();
        let mut rewinder = Rewinder::for_manager(RewindConfig::default(), &manager).unwrap();
        let result = rewinder.capture(&mut manager, &mut arena, 0);
        assert!(matches!(result, Err(RewindError::Disabled)));
        assert_eq!(
            status_message(RewindOperation::Step, &rewinder.step(&mut manager, &mut arena)),
            "Rewind error: Rewind is disabled."
        );
    }

    #[test]
    fn capacity_below_one_snapshot_disables() {
        let (manager, _, _) = counter_machine();
        let rewinder = Rewinder::for_manager(enabled(7), &manager).unwrap();
        assert!(!rewinder.is_enabled());
        assert!(Rewinder::for_manager(enabled(8), &manager).unwrap().is_enabled());
    }

    #[test]
    fn step_walks_back_through_history() {
        let (mut manager, mut arena, base) = counter_machine();
        let mut rewinder = Rewinder::for_manager(enabled(1024), &manager).unwrap();
        for frame in 1..=3u64 {
            arena.write_u64(base, frame).unwrap();
            let slot = rewinder.capture(&mut manager, &mut arena, frame * 10).unwrap();
            assert_eq!(slot as u64, frame);
        }
        arena.write_u64(base, 99).unwrap();

        assert_eq!(rewinder.step(&mut manager, &mut arena).unwrap(), 3);
        assert_eq!(arena.read_u64(base).unwrap(), 3);
        assert_eq!(rewinder.step(&mut manager, &mut arena).unwrap(), 2);
        assert_eq!(arena.read_u64(base).unwrap(), 2);
        assert_eq!(rewinder.state_time(0), Some(10));
        assert_eq!(rewinder.current_index(), 1);
    }

    #[test]
    fn empty_history_has_nothing_to_load() {
        let (mut manager, mut arena, _) = counter_machine();
        let mut rewinder = Rewinder::for_manager(enabled(1024), &manager).unwrap();
        let result = rewinder.step(&mut manager, &mut arena);
        assert!(matches!(result, Err(RewindError::NotFound)));
        assert_eq!(
            status_message(RewindOperation::Step, &result),
            "Rewind error: No rewind state to load."
        );
    }

    #[test]
    fn status_messages() {
        assert_eq!(
            status_message(RewindOperation::Capture, &Ok(3)),
            "Rewind state 3 captured."
        );
        assert_eq!(status_message(RewindOperation::Step, &Ok(1)), "Rewind state 1 loaded.");
        let write = Err(RewindError::Save(SaveError::WriteError {
            expected: 1,
            produced: 2,
        }));
        assert_eq!(
            status_message(RewindOperation::Capture, &write),
            "Rewind error: Unable to save state due to a write error."
        );
    }
}
