//! Status engine: derives a task's status from its subtasks and computes the
//! progress percentage shown on dashboards.

use futures_util::StreamExt;
use mongodb::bson::doc;

use crate::db::MongoDB;
use crate::error::ApiError;
use crate::models::{SubtaskStatus, Task, TaskStatus};
use crate::notify::Notifier;

/// Derives a task's aggregate status from the statuses of its subtasks.
///
/// An empty slice means the task has no subtasks yet and stays `pending`;
/// direct completion is a separate explicit action, not handled here.
pub fn derive_task_status(subtasks: &[SubtaskStatus]) -> TaskStatus {
    if subtasks.is_empty() {
        return TaskStatus::Pending;
    }
    if subtasks.iter().all(|s| *s == SubtaskStatus::Done) {
        TaskStatus::Completed
    } else if subtasks.iter().all(|s| *s == SubtaskStatus::NotStarted) {
        TaskStatus::Pending
    } else {
        TaskStatus::InProgress
    }
}

/// Percentage of done subtasks, rounded half-away-from-zero to one decimal.
/// A completed task always reads 100%, whatever its subtasks say.
pub fn compute_progress(status: TaskStatus, subtasks: &[SubtaskStatus]) -> f64 {
    if status == TaskStatus::Completed {
        return 100.0;
    }
    if subtasks.is_empty() {
        return 0.0;
    }
    let done = subtasks.iter().filter(|s| **s == SubtaskStatus::Done).count();
    let pct = 100.0 * done as f64 / subtasks.len() as f64;
    (pct * 10.0).round() / 10.0
}

/// Derives the status and reports whether it differs from `current`.
/// Notifications for the task-status channel fire only on an actual
/// transition, so re-applying the same subtask write announces nothing.
pub fn status_transition(
    current: TaskStatus,
    subtasks: &[SubtaskStatus],
) -> (TaskStatus, bool) {
    let derived = derive_task_status(subtasks);
    (derived, derived != current)
}

/// Repair target for a task read back as `completed` while its subtasks
/// disagree. The correction is always `in_progress`, even when every
/// subtask is `not_started`: a completed task that regressed was being
/// worked on, it is not back to untouched.
pub fn heal_target(status: TaskStatus, subtasks: &[SubtaskStatus]) -> Option<TaskStatus> {
    if status != TaskStatus::Completed {
        return None;
    }
    if subtasks.is_empty() || subtasks.iter().all(|s| *s == SubtaskStatus::Done) {
        return None;
    }
    Some(TaskStatus::InProgress)
}

/// Loads the statuses of every subtask belonging to `task_id`.
pub async fn load_subtask_statuses(
    db: &MongoDB,
    task_id: &str,
) -> Result<Vec<SubtaskStatus>, ApiError> {
    let coll = db.db.collection::<crate::models::Subtask>("subtasks");
    let mut cursor = coll.find(doc! { "task_id": task_id }).await?;
    let mut statuses = Vec::new();
    while let Some(subtask) = cursor.next().await {
        statuses.push(subtask?.status);
    }
    Ok(statuses)
}

/// Recomputes the task's status from its subtasks, persists it when it
/// changed, and returns `(new_status, changed)`. The caller decides which
/// notifications to emit.
pub async fn recompute_task_status(
    db: &MongoDB,
    task: &Task,
) -> Result<(TaskStatus, bool), ApiError> {
    let statuses = load_subtask_statuses(db, &task.task_id).await?;
    let (derived, changed) = status_transition(task.status, &statuses);
    if !changed {
        return Ok((derived, false));
    }
    let tasks = db.db.collection::<Task>("tasks");
    tasks
        .update_one(
            doc! { "task_id": &task.task_id },
            doc! { "$set": { "status": derived.as_str() } },
        )
        .await?;
    Ok((derived, true))
}

/// Repairs a task stored as `completed` whose subtasks are not all done.
///
/// Runs on every read path that shows a task (task detail, group detail);
/// the correction is persisted and announced before the status reaches the
/// caller. Returns the status the caller should display.
pub async fn self_heal_task_status(
    db: &MongoDB,
    notifier: &Notifier,
    task: &Task,
) -> Result<TaskStatus, ApiError> {
    if task.status != TaskStatus::Completed {
        return Ok(task.status);
    }
    let statuses = load_subtask_statuses(db, &task.task_id).await?;
    let corrected = match heal_target(task.status, &statuses) {
        Some(status) => status,
        None => return Ok(task.status),
    };
    let tasks = db.db.collection::<Task>("tasks");
    tasks
        .update_one(
            doc! { "task_id": &task.task_id },
            doc! { "$set": { "status": corrected.as_str() } },
        )
        .await?;
    notifier.task_status_changed(&task.group_id, &task.task_id);
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubtaskStatus::*;

    #[test]
    fn no_subtasks_means_pending() {
        assert_eq!(derive_task_status(&[]), TaskStatus::Pending);
    }

    #[test]
    fn all_done_means_completed() {
        assert_eq!(derive_task_status(&[Done, Done]), TaskStatus::Completed);
        assert_eq!(derive_task_status(&[Done]), TaskStatus::Completed);
    }

    #[test]
    fn all_not_started_means_pending() {
        assert_eq!(
            derive_task_status(&[NotStarted, NotStarted]),
            TaskStatus::Pending
        );
    }

    #[test]
    fn any_other_mix_means_in_progress() {
        assert_eq!(
            derive_task_status(&[Done, NotStarted]),
            TaskStatus::InProgress
        );
        assert_eq!(derive_task_status(&[InProgress]), TaskStatus::InProgress);
        assert_eq!(
            derive_task_status(&[Done, InProgress, NotStarted]),
            TaskStatus::InProgress
        );
    }

    #[test]
    fn completed_task_always_reads_100() {
        assert_eq!(compute_progress(TaskStatus::Completed, &[]), 100.0);
        assert_eq!(
            compute_progress(TaskStatus::Completed, &[NotStarted, NotStarted]),
            100.0
        );
    }

    #[test]
    fn no_subtasks_reads_0() {
        assert_eq!(compute_progress(TaskStatus::Pending, &[]), 0.0);
    }

    #[test]
    fn progress_is_the_done_fraction() {
        assert_eq!(
            compute_progress(TaskStatus::InProgress, &[Done, Done, NotStarted, NotStarted]),
            50.0
        );
        assert_eq!(
            compute_progress(TaskStatus::InProgress, &[Done, NotStarted, NotStarted]),
            33.3
        );
        assert_eq!(
            compute_progress(TaskStatus::InProgress, &[Done, Done, NotStarted]),
            66.7
        );
    }

    #[test]
    fn progress_counts_only_done_not_in_progress() {
        assert_eq!(
            compute_progress(TaskStatus::InProgress, &[InProgress, InProgress]),
            0.0
        );
    }

    // Three subtasks walked from not_started to done, as a member would.
    #[test]
    fn lifecycle_walkthrough() {
        let mut s = vec![NotStarted, NotStarted, NotStarted];
        assert_eq!(derive_task_status(&s), TaskStatus::Pending);
        assert_eq!(compute_progress(derive_task_status(&s), &s), 0.0);

        s[0] = InProgress;
        assert_eq!(derive_task_status(&s), TaskStatus::InProgress);
        assert_eq!(compute_progress(derive_task_status(&s), &s), 0.0);

        s = vec![Done, Done, Done];
        assert_eq!(derive_task_status(&s), TaskStatus::Completed);
        assert_eq!(compute_progress(derive_task_status(&s), &s), 100.0);
    }

    #[test]
    fn derivation_is_idempotent() {
        let s = [Done, InProgress];
        let first = derive_task_status(&s);
        assert_eq!(derive_task_status(&s), first);
    }

    #[test]
    fn transition_reports_a_real_change() {
        assert_eq!(
            status_transition(TaskStatus::Pending, &[Done]),
            (TaskStatus::Completed, true)
        );
        assert_eq!(
            status_transition(TaskStatus::Pending, &[InProgress, NotStarted]),
            (TaskStatus::InProgress, true)
        );
    }

    // Re-applying the same subtask write derives the same status again and
    // reports no change, so the status channel stays quiet.
    #[test]
    fn repeated_transition_reports_no_change() {
        assert_eq!(
            status_transition(TaskStatus::Completed, &[Done]),
            (TaskStatus::Completed, false)
        );
        assert_eq!(
            status_transition(TaskStatus::Pending, &[NotStarted, NotStarted]),
            (TaskStatus::Pending, false)
        );
        assert_eq!(
            status_transition(TaskStatus::InProgress, &[Done, NotStarted]),
            (TaskStatus::InProgress, false)
        );
    }

    // A task stored completed with subtasks {done, in_progress} reads back
    // as in_progress.
    #[test]
    fn stale_completed_task_heals_to_in_progress() {
        assert_eq!(
            heal_target(TaskStatus::Completed, &[Done, InProgress]),
            Some(TaskStatus::InProgress)
        );
    }

    // The repair always lands on in_progress, never pending, even when no
    // subtask has been touched.
    #[test]
    fn heal_ignores_what_derivation_would_say() {
        assert_eq!(
            heal_target(TaskStatus::Completed, &[NotStarted, NotStarted]),
            Some(TaskStatus::InProgress)
        );
        assert_ne!(
            Some(derive_task_status(&[NotStarted, NotStarted])),
            heal_target(TaskStatus::Completed, &[NotStarted, NotStarted])
        );
    }

    #[test]
    fn consistent_tasks_need_no_healing() {
        assert_eq!(heal_target(TaskStatus::Completed, &[Done, Done]), None);
        assert_eq!(heal_target(TaskStatus::Completed, &[]), None);
        assert_eq!(heal_target(TaskStatus::InProgress, &[NotStarted]), None);
        assert_eq!(heal_target(TaskStatus::Pending, &[]), None);
    }
}
