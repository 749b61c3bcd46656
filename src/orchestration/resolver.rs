//! Dependency resolution.
//!
//! The `DependencyResolver` answers which tasks may be claimed right now.
//! It holds no state of its own: every call re-reads the store, so a task
//! becomes eligible the moment its last dependency completes and never
//! before.

use std::collections::HashMap;

use crate::core::{Task, TaskId, TaskOutput, TaskStatus};
use crate::error::{Error, Result};
use crate::store::SharedStore;

pub struct DependencyResolver {
    store: SharedStore,
}

impl DependencyResolver {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Pending tasks whose every dependency is complete.
    ///
    /// Ordered by priority (high first), then creation order.
    pub fn eligible_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.store.list_tasks()?;
        let status: HashMap<&TaskId, TaskStatus> =
            tasks.iter().map(|t| (&t.id, t.status)).collect();

        let mut eligible: Vec<Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| dependencies_complete(t, &status))
            .cloned()
            .collect();
        eligible.sort_by_key(|t| (t.priority, t.seq));
        Ok(eligible)
    }

    /// Read a task and confirm it can be claimed.
    ///
    /// # Errors
    /// `AlreadyClaimed` if another worker holds it, `NotEligible` if it is
    /// terminal or waiting on a dependency.
    pub fn check_eligible(&self, id: &TaskId) -> Result<Task> {
        let task = self.store.read(id)?;
        if task.status.is_active() {
            if let Some(owner) = task.owner {
                return Err(Error::AlreadyClaimed {
                    id: id.clone(),
                    owner,
                });
            }
        }
        if task.status != TaskStatus::Pending {
            return Err(Error::NotEligible {
                id: id.clone(),
                status: task.status,
            });
        }
        for dep in &task.dependencies {
            let complete = match self.store.read(dep) {
                Ok(d) => d.status == TaskStatus::Complete,
                Err(Error::NotFound(_)) => false,
                Err(e) => return Err(e),
            };
            if !complete {
                return Err(Error::NotEligible {
                    id: id.clone(),
                    status: task.status,
                });
            }
        }
        Ok(task)
    }

    /// Outputs of a task's dependencies, in declaration order.
    pub fn dependency_outputs(&self, task: &Task) -> Result<Vec<(TaskId, TaskOutput)>> {
        let mut outputs = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            let dep_task = self.store.read(dep)?;
            outputs.push((dep.clone(), dep_task.output.unwrap_or_default()));
        }
        Ok(outputs)
    }

    /// Pending tasks still waiting on a dependency, with the ids they wait on.
    pub fn blocked_tasks(&self) -> Result<Vec<(TaskId, Vec<TaskId>)>> {
        let tasks = self.store.list_tasks()?;
        let status: HashMap<&TaskId, TaskStatus> =
            tasks.iter().map(|t| (&t.id, t.status)).collect();
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| {
                let waiting: Vec<TaskId> = t
                    .dependencies
                    .iter()
                    .filter(|d| status.get(d) != Some(&TaskStatus::Complete))
                    .cloned()
                    .collect();
                (!waiting.is_empty()).then(|| (t.id.clone(), waiting))
            })
            .collect())
    }
}

fn dependencies_complete(task: &Task, status: &HashMap<&TaskId, TaskStatus>) -> bool {
    task.dependencies
        .iter()
        .all(|d| status.get(d) == Some(&TaskStatus::Complete))
}
