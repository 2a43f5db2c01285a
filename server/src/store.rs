//! Persistence collaborator for tasks and beacons.
//!
//! The engine only needs the narrow [`Store`] contract below. Updates are
//! last-write-wins; `create_task` requires a caller-supplied unique id.
//! [`MemoryStore`] is the in-process implementation used by the server
//! binary and the tests. Durable backends plug in behind the same trait.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::tasks::types::{Beacon, Task, TaskStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("task '{0}' already exists")]
    DuplicateTask(String),
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("beacon '{0}' not found")]
    BeaconNotFound(String),
}

pub trait Store: Send + Sync {
    fn create_task(&self, task: Task) -> Result<(), StoreError>;
    fn get_task(&self, task_id: &str) -> Option<Task>;
    /// Overwrites the stored record with the same id.
    fn update_task(&self, task: &Task) -> Result<(), StoreError>;
    /// Tasks of one beacon in creation order, optionally filtered by status.
    fn get_tasks_by_beacon(&self, beacon_id: &str, status: Option<TaskStatus>) -> Vec<Task>;

    fn get_beacon(&self, beacon_id: &str) -> Option<Beacon>;
    fn update_beacon(&self, beacon: &Beacon) -> Result<(), StoreError>;
    /// Insert or overwrite.
    fn upsert_beacon(&self, beacon: Beacon);
    fn list_beacons(&self) -> Vec<Beacon>;
}

#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    /// Insertion order per beacon, so dispatch is FIFO.
    order: RwLock<HashMap<String, Vec<String>>>,
    beacons: RwLock<HashMap<String, Beacon>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn create_task(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.task_id) {
            return Err(StoreError::DuplicateTask(task.task_id));
        }
        self.order
            .write()
            .entry(task.beacon_id.clone())
            .or_default()
            .push(task.task_id.clone());
        tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let slot = tasks
            .get_mut(&task.task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task.task_id.clone()))?;
        *slot = task.clone();
        Ok(())
    }

    fn get_tasks_by_beacon(&self, beacon_id: &str, status: Option<TaskStatus>) -> Vec<Task> {
        let order = self.order.read();
        let tasks = self.tasks.read();
        order
            .get(beacon_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tasks.get(id))
                    .filter(|t| status.map_or(true, |s| t.status == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_beacon(&self, beacon_id: &str) -> Option<Beacon> {
        self.beacons.read().get(beacon_id).cloned()
    }

    fn update_beacon(&self, beacon: &Beacon) -> Result<(), StoreError> {
        let mut beacons = self.beacons.write();
        let slot = beacons
            .get_mut(&beacon.beacon_id)
            .ok_or_else(|| StoreError::BeaconNotFound(beacon.beacon_id.clone()))?;
        *slot = beacon.clone();
        Ok(())
    }

    fn upsert_beacon(&self, beacon: Beacon) {
        self.beacons.write().insert(beacon.beacon_id.clone(), beacon);
    }

    fn list_beacons(&self) -> Vec<Beacon> {
        let mut out: Vec<Beacon> = self.beacons.read().values().cloned().collect();
        out.sort_by(|a, b| a.beacon_id.cmp(&b.beacon_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::TaskOrigin;

    fn task(id: &str, beacon: &str) -> Task {
        Task {
            task_id: id.into(),
            beacon_id: beacon.into(),
            command: "shell".into(),
            arguments: b"id".to_vec(),
            status: TaskStatus::Queued,
            output: String::new(),
            origin: TaskOrigin::Policy,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let store = MemoryStore::new();
        store.create_task(task("t1", "b1")).unwrap();
        assert_eq!(
            store.create_task(task("t1", "b2")),
            Err(StoreError::DuplicateTask("t1".into()))
        );
    }

    #[test]
    fn tasks_by_beacon_keep_creation_order() {
        let store = MemoryStore::new();
        for id in ["c", "a", "b"] {
            store.create_task(task(id, "b1")).unwrap();
        }
        store.create_task(task("x", "b2")).unwrap();

        let mut done = store.get_task("a").unwrap();
        done.status = TaskStatus::Canceled;
        store.update_task(&done).unwrap();

        let ids: Vec<String> = store
            .get_tasks_by_beacon("b1", None)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, ["c", "a", "b"]);

        let queued: Vec<String> = store
            .get_tasks_by_beacon("b1", Some(TaskStatus::Queued))
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(queued, ["c", "b"]);
    }

    #[test]
    fn update_of_missing_task_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_task(&task("ghost", "b1")),
            Err(StoreError::TaskNotFound(_))
        ));
    }
}
