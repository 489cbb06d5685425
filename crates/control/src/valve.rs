//! Simulated valve hardware. Each irrigation system owns one output that the
//! controller switches on when a session starts and off when it closes.

use std::collections::HashMap;
use tracing::{info, warn};

use crate::model::HardwareKind;

#[derive(Debug, Clone, Copy)]
struct ValveOutput {
    kind: HardwareKind,
    on: bool,
}

#[derive(Default)]
pub struct ValveBoard {
    outputs: HashMap<String, ValveOutput>, // system_id -> output
}

impl ValveBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output for `system_id`, initially OFF. Re-registering an
    /// existing system only updates its kind.
    pub fn register(&mut self, system_id: &str, kind: HardwareKind) {
        match self.outputs.get_mut(system_id) {
            Some(out) => out.kind = kind,
            None => {
                info!(system = %system_id, %kind, "[sim-valve] registered (not wired)");
                self.outputs
                    .insert(system_id.to_string(), ValveOutput { kind, on: false });
            }
        }
    }

    pub fn set(&mut self, system_id: &str, on: bool) {
        if let Some(out) = self.outputs.get_mut(system_id) {
            out.on = on;
            info!(
                system = %system_id,
                kind = %out.kind,
                "[sim-valve] set {}",
                if on { "ON" } else { "OFF" }
            );
        } else {
            warn!(system = %system_id, "[sim-valve] unknown system");
        }
    }

    #[cfg(test)]
    pub fn is_on(&self, system_id: &str) -> bool {
        self.outputs.get(system_id).is_some_and(|o| o.on)
    }

    pub fn open_count(&self) -> usize {
        self.outputs.values().filter(|o| o.on).count()
    }

    pub fn all_off(&mut self) {
        let keys: Vec<String> = self.outputs.keys().cloned().collect();
        for k in keys {
            self.set(&k, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
