//! Admission checks and step ordering for composite tasks.

use std::collections::{HashMap, HashSet};

use crate::error::SchedulerError;
use crate::task::model::{Task, TaskId, TaskKind};

/// Why a set of sibling sub-tasks can't be ordered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("sub-task {task} depends on {dependency}, which is not a sibling")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("dependency cycle among sub-tasks {0:?}")]
    Cycle(Vec<TaskId>),
}

/// Order sibling sub-tasks so every task runs after its dependencies.
///
/// Stable: among tasks whose dependencies are satisfied, the earliest
/// declared runs first. Returns indices into `subtasks`.
pub fn execution_order(subtasks: &[Task]) -> Result<Vec<usize>, OrderError> {
    let index: HashMap<TaskId, usize> = subtasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id, i))
        .collect();

    for task in subtasks {
        for dep in &task.dependencies {
            if !index.contains_key(dep) {
                return Err(OrderError::UnknownDependency {
                    task: task.id,
                    dependency: *dep,
                });
            }
        }
    }

    let mut done = vec![false; subtasks.len()];
    let mut order = Vec::with_capacity(subtasks.len());
    while order.len() < subtasks.len() {
        let ready = (0..subtasks.len()).find(|&i| {
            !done[i]
                && subtasks[i]
                    .dependencies
                    .iter()
                    .all(|dep| index.get(dep).is_some_and(|&d| done[d]))
        });

        match ready {
            Some(i) => {
                done[i] = true;
                order.push(i);
            }
            None => {
                let stuck = (0..subtasks.len())
                    .filter(|&i| !done[i])
                    .map(|i| subtasks[i].id)
                    .collect();
                return Err(OrderError::Cycle(stuck));
            }
        }
    }
    Ok(order)
}

/// Check a task before admission: top-level tasks carry no dependencies,
/// ids are unique across the whole task tree, and every composite's
/// sub-tasks can be ordered.
pub fn validate(task: &Task) -> Result<(), SchedulerError> {
    if !task.dependencies.is_empty() {
        return Err(invalid(
            task.id,
            "only composite sub-tasks may declare dependencies",
        ));
    }

    let mut seen = HashSet::new();
    validate_tree(task, task.id, &mut seen)
}

fn validate_tree(task: &Task, root: TaskId, seen: &mut HashSet<TaskId>) -> Result<(), SchedulerError> {
    if !seen.insert(task.id) {
        return Err(invalid(root, &format!("task id {} appears more than once", task.id)));
    }

    if let TaskKind::Composite { subtasks, .. } = &task.kind {
        execution_order(subtasks).map_err(|e| invalid(root, &e.to_string()))?;
        for sub in subtasks {
            validate_tree(sub, root, seen)?;
        }
    }
    Ok(())
}

fn invalid(id: TaskId, reason: &str) -> SchedulerError {
    SchedulerError::InvalidTask {
        id,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str) -> Task {
        Task::tool(name, json!({}))
    }

    #[test]
    fn independent_steps_keep_declaration_order() {
        let steps = vec![step("a"), step("b"), step("c")];
        assert_eq!(execution_order(&steps).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn dependencies_run_first() {
        let a = step("a");
        let b = step("b");
        let c = step("c");
        // c <- a, a <- b
        let steps = vec![
            c.clone().with_dependencies([a.id]),
            a.clone().with_dependencies([b.id]),
            b.clone(),
        ];
        assert_eq!(execution_order(&steps).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn ready_steps_run_in_declaration_order() {
        let a = step("a");
        let steps = vec![
            a.clone(),
            step("b").with_dependencies([a.id]),
            step("c"),
        ];
        // c becomes ready alongside b once a ran, but b was declared first.
        assert_eq!(execution_order(&steps).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cycle_detected() {
        let a = step("a");
        let b = step("b");
        let steps = vec![
            a.clone().with_dependencies([b.id]),
            b.clone().with_dependencies([a.id]),
            step("free"),
        ];
        match execution_order(&steps).unwrap_err() {
            OrderError::Cycle(ids) => assert_eq!(ids, vec![a.id, b.id]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_rejected() {
        let outsider = step("x");
        let steps = vec![step("a").with_dependencies([outsider.id])];
        assert!(matches!(
            execution_order(&steps),
            Err(OrderError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn top_level_dependencies_rejected() {
        let other = step("a");
        let task = step("b").with_dependencies([other.id]);
        assert!(matches!(
            validate(&task),
            Err(SchedulerError::InvalidTask { .. })
        ));
    }

    #[test]
    fn duplicate_ids_in_tree_rejected() {
        let a = step("a");
        let task = Task::composite(vec![a.clone(), a]);
        assert!(validate(&task).is_err());
    }

    #[test]
    fn nested_composites_validated() {
        let a = step("a");
        let b = step("b");
        let inner = Task::composite(vec![
            a.clone().with_dependencies([b.id]),
            b.clone().with_dependencies([a.id]),
        ]);
        let task = Task::composite(vec![step("first"), inner]);
        assert!(validate(&task).is_err());

        let ok = Task::composite(vec![step("first"), Task::composite(vec![step("x")])]);
        assert!(validate(&ok).is_ok());
    }
}
