// Task assignment, subtasks and the status mutations that drive the
// recompute-and-notify cascade.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::info;
use mongodb::bson::doc;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::error::ApiError;
use crate::groups::{ensure_member, find_group, TaskWithProgress};
use crate::models::{Subtask, SubtaskStatus, Task, TaskStatus};
use crate::status::{
    compute_progress, load_subtask_statuses, recompute_task_status, self_heal_task_status,
};

async fn find_task(data: &AppState, task_id: &str) -> Result<Task, ApiError> {
    let tasks = data.mongodb.db.collection::<Task>("tasks");
    tasks
        .find_one(doc! { "task_id": task_id })
        .await?
        .ok_or_else(|| ApiError::not_found("Task"))
}

fn ensure_assignee(task: &Task, user_id: &str, action: &str) -> Result<(), ApiError> {
    if task.assigned_to == user_id {
        Ok(())
    } else {
        Err(ApiError::Unauthorized(format!(
            "Only the task assignee can {}",
            action
        )))
    }
}

#[derive(Debug, Deserialize)]
pub struct AssignTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub assigned_to: String,
    pub due_date: Option<DateTime<Utc>>,
}

// POST /groups/{group_id}/tasks
pub async fn assign_task(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<AssignTaskRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let group_id = path.into_inner();
    let group = find_group(&data, &group_id).await?;
    ensure_member(&group, &user_id)?;

    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::InvalidInput("Task title is required".to_string()));
    }
    if !group.members.contains(&payload.assigned_to) {
        return Err(ApiError::InvalidInput(
            "Assignee must be a group member".to_string(),
        ));
    }

    let task = Task {
        id: None,
        task_id: Uuid::new_v4().to_string(),
        group_id,
        title,
        description: payload.description.clone().unwrap_or_default(),
        assigned_to: payload.assigned_to.clone(),
        created_by: user_id,
        status: TaskStatus::Pending,
        due_date: payload.due_date,
        created_at: Utc::now(),
    };

    let tasks = data.mongodb.db.collection::<Task>("tasks");
    tasks.insert_one(&task).await?;

    info!("Task {} assigned to {}", task.task_id, task.assigned_to);
    Ok(HttpResponse::Ok().json(task))
}

// GET /tasks/{task_id}
pub async fn task_detail(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let task_id = path.into_inner();
    let mut task = find_task(&data, &task_id).await?;
    let group = find_group(&data, &task.group_id).await?;
    ensure_member(&group, &user_id)?;

    // Correct a stale completed status before anyone sees it.
    task.status = self_heal_task_status(&data.mongodb, &data.notifier, &task).await?;

    let subtasks_coll = data.mongodb.db.collection::<Subtask>("subtasks");
    let mut cursor = subtasks_coll
        .find(doc! { "task_id": &task_id })
        .sort(doc! { "created_at": -1 })
        .await?;
    let mut subtasks = Vec::new();
    while let Some(subtask) = cursor.next().await {
        subtasks.push(subtask?);
    }

    let statuses: Vec<SubtaskStatus> = subtasks.iter().map(|s| s.status).collect();
    let progress = compute_progress(task.status, &statuses);
    let is_assignee = task.assigned_to == user_id;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "task": TaskWithProgress { task, progress },
        "subtasks": subtasks,
        "is_assignee": is_assignee,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateSubtaskRequest {
    pub title: String,
    pub description: Option<String>,
}

// POST /tasks/{task_id}/subtasks
pub async fn create_subtask(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<CreateSubtaskRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let task_id = path.into_inner();
    let task = find_task(&data, &task_id).await?;
    let group = find_group(&data, &task.group_id).await?;
    ensure_member(&group, &user_id)?;
    ensure_assignee(&task, &user_id, "create subtasks for this task")?;

    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::InvalidInput(
            "Subtask title is required".to_string(),
        ));
    }

    // A subtask always carries the parent task's assignee.
    let subtask = Subtask {
        id: None,
        subtask_id: Uuid::new_v4().to_string(),
        task_id: task_id.clone(),
        title,
        description: payload.description.clone().unwrap_or_default(),
        assigned_to: task.assigned_to.clone(),
        status: SubtaskStatus::NotStarted,
        created_at: Utc::now(),
    };
    let subtasks = data.mongodb.db.collection::<Subtask>("subtasks");
    subtasks.insert_one(&subtask).await?;

    let (task_status, _) = recompute_task_status(&data.mongodb, &task).await?;
    data.notifier.task_status_changed(&task.group_id, &task_id);
    data.notifier.progress_changed(&task.group_id, Some(&task_id));

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "subtask": subtask,
        "task_status": task_status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubtaskStatusRequest {
    pub status: String,
}

// POST /subtasks/{subtask_id}/status
pub async fn update_subtask_status(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateSubtaskStatusRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let subtask_id = path.into_inner();

    let subtasks = data.mongodb.db.collection::<Subtask>("subtasks");
    let subtask = subtasks
        .find_one(doc! { "subtask_id": &subtask_id })
        .await?
        .ok_or_else(|| ApiError::not_found("Subtask"))?;

    let task = find_task(&data, &subtask.task_id).await?;
    let group = find_group(&data, &task.group_id).await?;
    ensure_member(&group, &user_id)?;
    ensure_assignee(&task, &user_id, "update subtask status")?;

    let new_status: SubtaskStatus = payload
        .status
        .parse()
        .map_err(|_| ApiError::InvalidInput("Invalid status".to_string()))?;

    subtasks
        .update_one(
            doc! { "subtask_id": &subtask_id },
            doc! { "$set": { "status": new_status.as_str() } },
        )
        .await?;

    let (task_status, task_status_changed) = recompute_task_status(&data.mongodb, &task).await?;
    // The status event fires only on an actual transition; the progress
    // event fires on every write so dashboards re-fetch their percentages.
    if task_status_changed {
        data.notifier
            .task_status_changed(&task.group_id, &task.task_id);
    }
    data.notifier
        .progress_changed(&task.group_id, Some(&task.task_id));

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "subtask_id": subtask_id,
        "status": new_status,
        "task_completed": task_status == TaskStatus::Completed,
        "task_status": task_status,
        "task_status_changed": task_status_changed,
    })))
}

// POST /tasks/{task_id}/complete
//
// The one path that completes a task without deriving from subtasks: it
// force-marks every subtask done and the task completed.
pub async fn complete_task(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let task_id = path.into_inner();
    let task = find_task(&data, &task_id).await?;
    let group = find_group(&data, &task.group_id).await?;
    ensure_member(&group, &user_id)?;
    ensure_assignee(&task, &user_id, "complete this task")?;

    let tasks = data.mongodb.db.collection::<Task>("tasks");
    tasks
        .update_one(
            doc! { "task_id": &task_id },
            doc! { "$set": { "status": TaskStatus::Completed.as_str() } },
        )
        .await?;

    let subtasks = data.mongodb.db.collection::<Subtask>("subtasks");
    subtasks
        .update_many(
            doc! { "task_id": &task_id, "status": { "$ne": SubtaskStatus::Done.as_str() } },
            doc! { "$set": { "status": SubtaskStatus::Done.as_str() } },
        )
        .await?;

    data.notifier.task_status_changed(&task.group_id, &task_id);
    data.notifier.progress_changed(&task.group_id, Some(&task_id));

    info!("Task {} completed by {}", task_id, user_id);
    let statuses = load_subtask_statuses(&data.mongodb, &task_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "task_status": TaskStatus::Completed,
        "progress": compute_progress(TaskStatus::Completed, &statuses),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_assigned_to(user: &str) -> Task {
        Task {
            id: None,
            task_id: "t1".to_string(),
            group_id: "g1".to_string(),
            title: "Write report".to_string(),
            description: String::new(),
            assigned_to: user.to_string(),
            created_by: "u1".to_string(),
            status: TaskStatus::Pending,
            due_date: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn only_the_assignee_passes_the_check() {
        let task = task_assigned_to("u2");
        assert!(ensure_assignee(&task, "u2", "complete this task").is_ok());
        let err = ensure_assignee(&task, "u1", "complete this task").unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn status_payload_validation_matches_the_enum() {
        assert!("done".parse::<SubtaskStatus>().is_ok());
        assert!("completed".parse::<SubtaskStatus>().is_err());
    }
}
