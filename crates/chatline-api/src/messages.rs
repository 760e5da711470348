use axum::{
    Extension, Json,
    extract::{Path, State},
};

use chatline_types::UserId;
use chatline_types::api::Claims;
use chatline_types::models::ChatMessage;

use crate::auth::AppState;
use crate::error::ApiError;

/// Direct history between the caller and `friend_id`, oldest first.
///
/// This is the durable fallback for live delivery, so it reads through the
/// same store the dispatcher writes to.
pub async fn direct_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(friend_id): Path<UserId>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let uid = claims.sub;
    let store = state.store.clone();
    let messages = tokio::task::spawn_blocking(move || store.direct_history(uid, friend_id))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("worker failed: {}", e)))??;

    Ok(Json(messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{claims_for, test_state};
    use chatline_db::NewMessage;
    use chatline_types::models::MessageTarget;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn history_is_scoped_to_the_pair() {
        let state = test_state();
        for name in ["alice", "bob", "carol"] {
            state.db.create_user(name, "hash").unwrap();
        }
        let alice = claims_for(&state, "alice");
        let bob = claims_for(&state, "bob");
        let carol = claims_for(&state, "carol");

        let send = |from: UserId, to: UserId, content: &str, ms: i64| {
            state
                .db
                .insert_message(&NewMessage {
                    sender_id: from,
                    target: MessageTarget::Direct(to),
                    content: content.into(),
                    created_at: Utc.timestamp_millis_opt(ms).unwrap(),
                    client_nonce: None,
                })
                .unwrap();
        };
        send(bob.sub, alice.sub, "second", 2000);
        send(alice.sub, bob.sub, "first", 1000);
        send(carol.sub, alice.sub, "elsewhere", 1500);

        let Json(history) = direct_messages(State(state.clone()), Extension(alice), Path(bob.sub))
            .await
            .unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
        assert_eq!(history[1].sender_username, "bob");
    }
}
