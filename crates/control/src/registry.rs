//! Owner of each irrigation system's operating state.

use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::ControlError;
use crate::model::{IrrigationSystem, SystemStatus};
use crate::store::{with_retry, Store, StoreError};

/// Outcome of a requested state change.
#[derive(Debug, Clone)]
pub struct Transition {
    pub previous: SystemStatus,
    /// False for idempotent no-ops (`Idle -> Idle`, `Running -> Running`).
    pub changed: bool,
    /// Snapshot after the transition.
    pub system: IrrigationSystem,
    previous_activated: Option<i64>,
}

pub struct StateRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl StateRegistry {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn snapshot(&self, system_id: &str) -> Result<IrrigationSystem, ControlError> {
        with_retry("get_system", || self.store.get_system(system_id))
            .await?
            .ok_or_else(|| ControlError::NotFound(system_id.to_string()))
    }

    /// Move a system to `desired`. Only `Idle -> Running` and
    /// `Running -> Idle` write anything and report `changed`.
    pub async fn transition(
        &self,
        system_id: &str,
        desired: SystemStatus,
    ) -> Result<Transition, ControlError> {
        let current = self.snapshot(system_id).await?;
        let previous = current.status;

        if previous == desired {
            debug!(system = %system_id, status = %desired, "transition is a no-op");
            return Ok(Transition {
                previous,
                changed: false,
                previous_activated: current.last_activated,
                system: current,
            });
        }

        let last_activated = match desired {
            SystemStatus::Running => Some(self.clock.now_ms()),
            SystemStatus::Idle => current.last_activated,
        };

        let swapped = with_retry("compare_and_set_status", || {
            self.store
                .compare_and_set_status(system_id, previous, desired, last_activated)
        })
        .await?;

        if !swapped {
            // Someone else moved it first; report what is there now.
            let now = self.snapshot(system_id).await?;
            return Ok(Transition {
                previous: now.status,
                changed: false,
                previous_activated: now.last_activated,
                system: now,
            });
        }

        info!(system = %system_id, from = %previous, to = %desired, "state transition");

        let previous_activated = current.last_activated;
        let mut system = current;
        system.status = desired;
        system.last_activated = last_activated;
        Ok(Transition {
            previous,
            changed: true,
            system,
            previous_activated,
        })
    }

    /// Undo a real transition after the paired log write failed.
    pub async fn revert(&self, transition: &Transition) -> Result<(), ControlError> {
        if !transition.changed {
            return Ok(());
        }
        let system_id = &transition.system.system_id;
        let reverted = with_retry("compare_and_set_status", || {
            self.store.compare_and_set_status(
                system_id,
                transition.system.status,
                transition.previous,
                transition.previous_activated,
            )
        })
        .await?;
        if reverted {
            info!(system = %system_id, to = %transition.previous, "transition rolled back");
        }
        Ok(())
    }

    /// Add a new system. Rejects invalid definitions and taken ids.
    pub async fn register(&self, system: &IrrigationSystem) -> Result<(), ControlError> {
        let problems = system.problems();
        if !problems.is_empty() {
            return Err(ControlError::InvalidSystem(problems.join("; ")));
        }
        match with_retry("insert_system", || self.store.insert_system(system)).await {
            Err(StoreError::Conflict(_)) => {
                Err(ControlError::AlreadyExists(system.system_id.clone()))
            }
            other => Ok(other?),
        }
    }

    /// Seed or refresh a system's metadata without touching its state.
    pub async fn upsert(&self, system: &IrrigationSystem) -> Result<(), ControlError> {
        Ok(with_retry("upsert_system", || self.store.upsert_system(system)).await?)
    }

    pub async fn systems_for_field(
        &self,
        field_id: &str,
    ) -> Result<Vec<IrrigationSystem>, ControlError> {
        Ok(with_retry("systems_for_field", || self.store.systems_for_field(field_id)).await?)
    }

    pub async fn all(&self) -> Result<Vec<IrrigationSystem>, ControlError> {
        Ok(with_retry("list_systems", || self.store.list_systems()).await?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::model::HardwareKind;
    use crate::store::MemoryStore;

    async fn registry_with(ids: &[&str]) -> StateRegistry {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store
                .insert_system(&IrrigationSystem::new(*id, "f1", HardwareKind::Drip))
                .await
                .unwrap();
        }
        StateRegistry::new(store, Arc::new(TokioClock::starting_at(1_000)))
    }

    #[tokio::test]
    async fn transition_unknown_system_is_not_found() {
        let reg = registry_with(&[]).await;
        let err = reg.transition("ghost", SystemStatus::Running).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn idle_to_idle_is_noop() {
        let reg = registry_with(&["s1"]).await;
        let t = reg.transition("s1", SystemStatus::Idle).await.unwrap();
        assert!(!t.changed);
        assert_eq!(t.previous, SystemStatus::Idle);
        assert_eq!(t.system.status, SystemStatus::Idle);
    }

    #[tokio::test]
    async fn idle_to_running_stamps_activation() {
        let reg = registry_with(&["s1"]).await;
        let t = reg.transition("s1", SystemStatus::Running).await.unwrap();
        assert!(t.changed);
        assert_eq!(t.previous, SystemStatus::Idle);
        assert_eq!(t.system.status, SystemStatus::Running);
        assert!(t.system.last_activated.is_some());

        let stored = reg.snapshot("s1").await.unwrap();
        assert_eq!(stored.status, SystemStatus::Running);
        assert_eq!(stored.last_activated, t.system.last_activated);
    }

    #[tokio::test]
    async fn running_to_running_is_noop() {
        let reg = registry_with(&["s1"]).await;
        reg.transition("s1", SystemStatus::Running).await.unwrap();
        let t = reg.transition("s1", SystemStatus::Running).await.unwrap();
        assert!(!t.changed);
        assert_eq!(t.previous, SystemStatus::Running);
    }

    #[tokio::test]
    async fn running_to_idle_keeps_last_activated() {
        let reg = registry_with(&["s1"]).await;
        let started = reg.transition("s1", SystemStatus::Running).await.unwrap();
        let stopped = reg.transition("s1", SystemStatus::Idle).await.unwrap();
        assert!(stopped.changed);
        assert_eq!(stopped.system.last_activated, started.system.last_activated);
    }

    #[tokio::test]
    async fn revert_restores_previous_state() {
        let reg = registry_with(&["s1"]).await;
        let t = reg.transition("s1", SystemStatus::Running).await.unwrap();
        reg.revert(&t).await.unwrap();

        let s = reg.snapshot("s1").await.unwrap();
        assert_eq!(s.status, SystemStatus::Idle);
        assert_eq!(s.last_activated, None);
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_invalid_systems() {
        let reg = registry_with(&["s1"]).await;

        let dup = IrrigationSystem::new("s1", "f2", HardwareKind::Flood);
        assert!(matches!(
            reg.register(&dup).await.unwrap_err(),
            ControlError::AlreadyExists(_)
        ));

        let bad = IrrigationSystem::new("s2", "", HardwareKind::Flood);
        assert!(matches!(
            reg.register(&bad).await.unwrap_err(),
            ControlError::InvalidSystem(msg) if msg.contains("field_id")
        ));

        reg.register(&IrrigationSystem::new("s2", "f2", HardwareKind::Flood))
            .await
            .unwrap();
        assert_eq!(reg.systems_for_field("f2").await.unwrap().len(), 1);
        assert_eq!(reg.all().await.unwrap().len(), 2);
    }
}
