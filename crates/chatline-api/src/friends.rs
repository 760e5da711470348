use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{info, warn};

use chatline_db::FriendRequestOutcome;
use chatline_db::models::parse_timestamp;
use chatline_types::api::{
    AcceptFriendBody, Claims, FriendRequestBody, PendingRequestResponse, StatusResponse,
};
use chatline_types::models::User;

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

pub async fn list_friends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<User>>, ApiError> {
    let uid = claims.sub;
    let friends = blocking(&state, move |db| db.list_friends(uid)).await?;
    Ok(Json(friends))
}

/// Create a pending request and push it to the target if they are online.
pub async fn send_friend_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<FriendRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.friend_username.trim().to_string();
    let target = blocking(&state, move |db| db.get_user_by_username(&name))
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    let from = claims.sub;
    let to = target.id;
    let outcome = blocking(&state, move |db| db.send_friend_request(from, to)).await?;

    match outcome {
        FriendRequestOutcome::Created => {
            info!("Friend request {} -> {}", from, to);
            state
                .notifier
                .notify_friend_request(to, from, &claims.username)
                .await;
            Ok((
                StatusCode::CREATED,
                Json(StatusResponse::new("Friend request sent successfully")),
            ))
        }
        FriendRequestOutcome::AlreadyFriends => Err(ApiError::Conflict("Already friends".into())),
        FriendRequestOutcome::AlreadyPending => {
            Err(ApiError::Conflict("Friend request already pending".into()))
        }
        FriendRequestOutcome::SelfRequest => Err(ApiError::BadRequest(
            "Cannot send a friend request to yourself".into(),
        )),
    }
}

pub async fn list_pending(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<PendingRequestResponse>>, ApiError> {
    let uid = claims.sub;
    let rows = blocking(&state, move |db| db.list_pending_requests(uid)).await?;

    let pending = rows
        .into_iter()
        .map(|row| PendingRequestResponse {
            created_at: parse_timestamp(&row.created_at).unwrap_or_else(|| {
                warn!("Corrupt created_at '{}' on request from {}", row.created_at, row.user_id);
                chrono::DateTime::default()
            }),
            id: row.user_id,
            username: row.username,
        })
        .collect();

    Ok(Json(pending))
}

/// Accept a pending request. Both parties are notified, each told about the
/// other.
pub async fn accept_friend_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AcceptFriendBody>,
) -> Result<Json<StatusResponse>, ApiError> {
    let requester = req.friend_id;
    let accepter = claims.sub;

    let accepted =
        blocking(&state, move |db| db.accept_friend_request(requester, accepter)).await?;
    if !accepted {
        return Err(ApiError::NotFound("No pending friend request found".into()));
    }

    let requester_name = blocking(&state, move |db| db.get_username(requester))
        .await?
        .unwrap_or_else(|| "unknown".to_string());

    info!("Friend request {} -> {} accepted", requester, accepter);
    state
        .notifier
        .notify_friend_accepted(requester, accepter, &claims.username)
        .await;
    state
        .notifier
        .notify_friend_accepted(accepter, requester, &requester_name)
        .await;

    Ok(Json(StatusResponse::new("Friend request accepted")))
}
