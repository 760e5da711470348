use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use rand::Rng;
use tracing::{info, warn};

use chatline_db::GroupJoinOutcome;
use chatline_db::models::{GroupRow, parse_timestamp};
use chatline_types::GroupId;
use chatline_types::api::{Claims, CreateGroupRequest, GroupResponse, JoinGroupRequest, StatusResponse};
use chatline_types::models::ChatMessage;

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;
const CODE_ATTEMPTS: usize = 5;

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn to_response(row: GroupRow) -> GroupResponse {
    GroupResponse {
        created_at: parse_timestamp(&row.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on group {}", row.created_at, row.id);
            chrono::DateTime::default()
        }),
        id: row.id,
        name: row.name,
        code: row.code,
        created_by: row.created_by,
        creator_username: row.creator_username,
    }
}

/// Create a group with a fresh join code. The creator is its first member.
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.chars().count() > 64 {
        return Err(ApiError::BadRequest("Group name must be 1-64 characters".into()));
    }

    let creator = claims.sub;
    for _ in 0..CODE_ATTEMPTS {
        let code = generate_code();
        let group_name = name.clone();
        let created = blocking(&state, move |db| {
            match db.create_group(&group_name, &code, creator)? {
                Some(id) => db.get_group(id),
                None => Ok(None),
            }
        })
        .await?;

        if let Some(row) = created {
            info!("Group {} '{}' created by {}", row.id, row.name, creator);
            return Ok((StatusCode::CREATED, Json(to_response(row))));
        }
    }

    Err(ApiError::Internal(anyhow::anyhow!(
        "no free group code after {} attempts",
        CODE_ATTEMPTS
    )))
}

pub async fn list_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<GroupResponse>>, ApiError> {
    let uid = claims.sub;
    let rows = blocking(&state, move |db| db.list_user_groups(uid)).await?;
    Ok(Json(rows.into_iter().map(to_response).collect()))
}

pub async fn join_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<JoinGroupRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let code = req.code.trim().to_uppercase();
    let uid = claims.sub;

    match blocking(&state, move |db| db.join_group_by_code(&code, uid)).await? {
        GroupJoinOutcome::Joined(group_id) => {
            info!("User {} joined group {}", uid, group_id);
            Ok(Json(StatusResponse::new("Successfully joined group")))
        }
        GroupJoinOutcome::AlreadyMember(_) => {
            Err(ApiError::Conflict("Already a member of this group".into()))
        }
        GroupJoinOutcome::UnknownCode => Err(ApiError::NotFound("Invalid group code".into())),
    }
}

/// Full history of a group, oldest first. Members only.
pub async fn group_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let uid = claims.sub;
    let is_member = blocking(&state, move |db| db.is_group_member(group_id, uid)).await?;
    if !is_member {
        return Err(ApiError::Forbidden("Not a member of this group".into()));
    }

    let store = state.store.clone();
    let messages = tokio::task::spawn_blocking(move || store.group_history(group_id))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("worker failed: {}", e)))??;

    Ok(Json(messages))
}
