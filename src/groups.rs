// Group lifecycle, membership and invitations.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use futures_util::StreamExt;
use log::info;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::error::ApiError;
use crate::models::{ChatMessage, Group, Subtask, Task, User};
use crate::status::{compute_progress, load_subtask_statuses, self_heal_task_status};

pub async fn find_group(data: &AppState, group_id: &str) -> Result<Group, ApiError> {
    let groups = data.mongodb.db.collection::<Group>("groups");
    groups
        .find_one(doc! { "group_id": group_id })
        .await?
        .ok_or_else(|| ApiError::not_found("Group"))
}

pub fn ensure_member(group: &Group, user_id: &str) -> Result<(), ApiError> {
    if group.members.iter().any(|m| m == user_id) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized(
            "You do not have access to this group".to_string(),
        ))
    }
}

async fn find_user(data: &AppState, user_id: &str) -> Result<User, ApiError> {
    let users = data.mongodb.db.collection::<User>("users");
    users
        .find_one(doc! { "user_id": user_id })
        .await?
        .ok_or(ApiError::Unauthenticated)
}

#[derive(Debug, Serialize)]
pub struct TaskWithProgress {
    #[serde(flatten)]
    pub task: Task,
    pub progress: f64,
}

#[derive(Debug, Serialize)]
struct MemberInfo {
    user_id: String,
    name: String,
    email: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: Option<String>,
    /// Optional email to invite in the same call.
    pub invite_email: Option<String>,
}

// POST /groups
pub async fn create_group(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateGroupRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let user = find_user(&data, &user_id).await?;

    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::InvalidInput("Group name is required".to_string()));
    }

    let group = Group {
        id: None,
        group_id: Uuid::new_v4().to_string(),
        name,
        description: payload.description.clone().unwrap_or_default(),
        members: vec![user_id.clone()],
        created_by: user_id.clone(),
        created_at: Utc::now(),
    };

    let groups = data.mongodb.db.collection::<Group>("groups");
    groups.insert_one(&group).await?;

    let users = data.mongodb.db.collection::<User>("users");
    users
        .update_one(
            doc! { "user_id": &user_id },
            doc! { "$addToSet": { "groups": &group.group_id } },
        )
        .await?;

    // An invite failure never fails group creation; it is reported alongside.
    let mut invitation = None;
    if let Some(email) = payload
        .invite_email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        let email = email.to_lowercase();
        invitation = Some(match users.find_one(doc! { "email": &email }).await? {
            None => format!("User with email {} not found", email),
            Some(invitee) if invitee.user_id == user.user_id => {
                "You are already a member of this group".to_string()
            }
            Some(invitee) => {
                users
                    .update_one(
                        doc! { "user_id": &invitee.user_id },
                        doc! { "$addToSet": { "invites": &group.group_id } },
                    )
                    .await?;
                format!("Invitation sent to {}", invitee.full_name())
            }
        });
    }

    info!("Group created: {} by {}", group.group_id, user_id);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "group": group,
        "invitation": invitation,
    })))
}

// GET /groups
pub async fn list_groups(
    req: HttpRequest,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let groups = data.mongodb.db.collection::<Group>("groups");
    let mut cursor = groups
        .find(doc! { "members": &user_id })
        .sort(doc! { "created_at": -1 })
        .await?;

    let mut result = Vec::new();
    while let Some(group) = cursor.next().await {
        result.push(group?);
    }
    Ok(HttpResponse::Ok().json(result))
}

// GET /groups/{group_id}
pub async fn group_detail(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let group_id = path.into_inner();
    let group = find_group(&data, &group_id).await?;
    ensure_member(&group, &user_id)?;

    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    let mut cursor = tasks_coll
        .find(doc! { "group_id": &group_id })
        .sort(doc! { "created_at": -1 })
        .await?;

    let subtasks_coll = data.mongodb.db.collection::<Subtask>("subtasks");
    let mut tasks = Vec::new();
    let mut subtasks = Vec::new();
    while let Some(task) = cursor.next().await {
        let mut task = task?;
        // Repair inconsistent completed tasks before they are shown.
        task.status = self_heal_task_status(&data.mongodb, &data.notifier, &task).await?;
        let statuses = load_subtask_statuses(&data.mongodb, &task.task_id).await?;
        let progress = compute_progress(task.status, &statuses);

        let mut sub_cursor = subtasks_coll
            .find(doc! { "task_id": &task.task_id })
            .sort(doc! { "created_at": -1 })
            .await?;
        while let Some(subtask) = sub_cursor.next().await {
            subtasks.push(subtask?);
        }
        tasks.push(TaskWithProgress { task, progress });
    }

    let users = data.mongodb.db.collection::<User>("users");
    let mut member_cursor = users
        .find(doc! { "user_id": { "$in": &group.members } })
        .await?;
    let mut members = Vec::new();
    while let Some(member) = member_cursor.next().await {
        let member = member?;
        let name = member.full_name();
        members.push(MemberInfo {
            user_id: member.user_id,
            name,
            email: member.email,
        });
    }

    let messages_coll = data.mongodb.db.collection::<ChatMessage>("chat_messages");
    let mut msg_cursor = messages_coll
        .find(doc! { "group_id": &group_id })
        .sort(doc! { "timestamp": 1 })
        .limit(100)
        .await?;
    let mut chat_messages = Vec::new();
    while let Some(message) = msg_cursor.next().await {
        chat_messages.push(message?);
    }

    let is_creator = group.created_by == user_id;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "group": group,
        "members": members,
        "tasks": tasks,
        "subtasks": subtasks,
        "chat_messages": chat_messages,
        "is_creator": is_creator,
    })))
}

// DELETE /groups/{group_id}
pub async fn delete_group(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let group_id = path.into_inner();
    let group = find_group(&data, &group_id).await?;

    if group.created_by != user_id {
        return Err(ApiError::Unauthorized(
            "You do not have permission to delete this group".to_string(),
        ));
    }

    let db = &data.mongodb.db;
    let tasks_coll = db.collection::<Task>("tasks");
    let mut cursor = tasks_coll.find(doc! { "group_id": &group_id }).await?;
    let mut task_ids = Vec::new();
    while let Some(task) = cursor.next().await {
        task_ids.push(task?.task_id);
    }

    db.collection::<Subtask>("subtasks")
        .delete_many(doc! { "task_id": { "$in": &task_ids } })
        .await?;
    tasks_coll.delete_many(doc! { "group_id": &group_id }).await?;
    db.collection::<ChatMessage>("chat_messages")
        .delete_many(doc! { "group_id": &group_id })
        .await?;

    let users = db.collection::<User>("users");
    users
        .update_many(
            doc! { "groups": &group_id },
            doc! { "$pull": { "groups": &group_id } },
        )
        .await?;
    users
        .update_many(
            doc! { "invites": &group_id },
            doc! { "$pull": { "invites": &group_id } },
        )
        .await?;

    db.collection::<Group>("groups")
        .delete_one(doc! { "group_id": &group_id })
        .await?;

    info!("Group deleted: {} by {}", group_id, user_id);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub email: String,
}

// POST /groups/{group_id}/invite
pub async fn invite_member(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<InviteRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let group_id = path.into_inner();
    let group = find_group(&data, &group_id).await?;
    ensure_member(&group, &user_id)?;

    let email = payload.email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::InvalidInput(
            "Please provide an email address".to_string(),
        ));
    }

    let users = data.mongodb.db.collection::<User>("users");
    let invitee = users
        .find_one(doc! { "email": &email })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("User with email {} not found", email)))?;

    if group.members.contains(&invitee.user_id) {
        return Err(ApiError::InvalidInput(format!(
            "{} is already a member of this group",
            invitee.full_name()
        )));
    }
    if invitee.invites.contains(&group_id) {
        return Err(ApiError::InvalidInput(format!(
            "{} already has a pending invitation",
            invitee.full_name()
        )));
    }

    users
        .update_one(
            doc! { "user_id": &invitee.user_id },
            doc! { "$addToSet": { "invites": &group_id } },
        )
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": format!("Invitation sent to {}", invitee.full_name()),
    })))
}

// GET /invitations
pub async fn list_invitations(
    req: HttpRequest,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let user = find_user(&data, &user_id).await?;

    let groups = data.mongodb.db.collection::<Group>("groups");
    let mut invitations = Vec::new();
    for group_id in &user.invites {
        // Invitations to since-deleted groups are simply skipped.
        if let Some(group) = groups.find_one(doc! { "group_id": group_id }).await? {
            invitations.push(serde_json::json!({
                "group_id": group.group_id,
                "name": group.name,
                "description": group.description,
            }));
        }
    }
    Ok(HttpResponse::Ok().json(invitations))
}

#[derive(Debug, Deserialize)]
pub struct InvitationResponse {
    pub group_id: String,
    /// "accept" or "reject"
    pub action: String,
}

// POST /invitations/respond
pub async fn respond_invitation(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<InvitationResponse>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&req)?;
    let user = find_user(&data, &user_id).await?;
    let group_id = payload.group_id.trim().to_string();

    if group_id.is_empty() {
        return Err(ApiError::InvalidInput("Invalid invitation".to_string()));
    }
    if !user.invites.contains(&group_id) {
        return Err(ApiError::InvalidInput(
            "This invitation is no longer valid".to_string(),
        ));
    }

    let users = data.mongodb.db.collection::<User>("users");
    let groups = data.mongodb.db.collection::<Group>("groups");

    let group = match groups.find_one(doc! { "group_id": &group_id }).await? {
        Some(g) => g,
        None => {
            // Stale invitation to a deleted group: clear it out.
            users
                .update_one(
                    doc! { "user_id": &user_id },
                    doc! { "$pull": { "invites": &group_id } },
                )
                .await?;
            return Err(ApiError::not_found("Group"));
        }
    };

    match payload.action.as_str() {
        "accept" => {
            groups
                .update_one(
                    doc! { "group_id": &group_id },
                    doc! { "$addToSet": { "members": &user_id } },
                )
                .await?;
            users
                .update_one(
                    doc! { "user_id": &user_id },
                    doc! {
                        "$addToSet": { "groups": &group_id },
                        "$pull": { "invites": &group_id },
                    },
                )
                .await?;
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "message": format!("You have joined {}", group.name),
            })))
        }
        "reject" => {
            users
                .update_one(
                    doc! { "user_id": &user_id },
                    doc! { "$pull": { "invites": &group_id } },
                )
                .await?;
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "message": "Invitation rejected",
            })))
        }
        _ => Err(ApiError::InvalidInput("Invalid action".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with_members(members: &[&str]) -> Group {
        Group {
            id: None,
            group_id: "g1".to_string(),
            name: "Test".to_string(),
            description: String::new(),
            members: members.iter().map(|m| m.to_string()).collect(),
            created_by: members.first().unwrap_or(&"u1").to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ensure_member_accepts_members_only() {
        let group = group_with_members(&["u1", "u2"]);
        assert!(ensure_member(&group, "u2").is_ok());
        assert!(matches!(
            ensure_member(&group, "u3"),
            Err(ApiError::Unauthorized(_))
        ));
    }
}
