//! The room state machine (RSM).
//!
//! A single pure entry point, [`apply`], folds an [`Operation`] into a
//! [`RoomState`]. No I/O, no clocks, no randomness — every field that looks
//! like a timestamp comes from the operation's `submit_timestamp`, which the
//! leader stamps authoritatively at propose time. Two nodes that have applied
//! the same log prefix must produce byte-identical `RoomState` under
//! `serde_json::to_vec`.

use serde::{Deserialize, Serialize};

const MAX_CHAT_LOG: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub joined_at: i64,
    pub is_creator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub video_id: String,
    pub title: Option<String>,
    pub added_by: String,
    pub added_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playback {
    pub is_playing: bool,
    pub current_video_id: Option<String>,
    pub position_seconds: f64,
    pub last_updated: i64,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_video_id: None,
            position_seconds: 0.0,
            last_updated: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: i64,
}

/// The replicated value every node's apply path folds committed operations
/// into. `code`, `created_at`, and `created_by` are fixed at `ROOM_CREATE`
/// and never change afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub code: String,
    pub created_at: i64,
    pub created_by: String,
    pub participants: Vec<Participant>,
    pub playlist: Vec<PlaylistEntry>,
    pub playback: Playback,
    pub chat_log: Vec<ChatMessage>,
}

impl RoomState {
    /// An empty room ready to receive its seeding `ROOM_CREATE`. Not itself
    /// a valid post-create state — `code`/`created_by` are placeholders
    /// until `apply` folds in the creating operation.
    pub fn empty() -> Self {
        Self {
            code: String::new(),
            created_at: 0,
            created_by: String::new(),
            participants: Vec::new(),
            playlist: Vec::new(),
            playback: Playback::default(),
            chat_log: Vec::new(),
        }
    }

    fn is_created(&self) -> bool {
        !self.code.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum OperationKind {
    RoomCreate {
        room_code: String,
        user_id: String,
        username: String,
    },
    RoomJoin {
        user_id: String,
        username: String,
    },
    RoomLeave {
        user_id: String,
    },
    PlaybackPlay {
        video_id: String,
        position_seconds: f64,
    },
    PlaybackPause {
        position_seconds: f64,
    },
    PlaybackSeek {
        new_position_seconds: f64,
    },
    PlaylistAdd {
        video_id: String,
        title: Option<String>,
        /// Insert position, clamped to `[0, len]`. `-1` means append.
        position: i64,
    },
    PlaylistRemove {
        video_id: String,
        removed_video_position: i64,
    },
    ChatMessage {
        text: String,
    },
}

/// `{kind, payload, originUserId, submitTimestamp}` from spec §3, flattened
/// into one struct since `OperationKind` already carries its own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub origin_user_id: String,
    pub submit_timestamp: i64,
}

impl Operation {
    pub fn new(kind: OperationKind, origin_user_id: impl Into<String>, submit_timestamp: i64) -> Self {
        Self {
            kind,
            origin_user_id: origin_user_id.into(),
            submit_timestamp,
        }
    }
}

/// Folds `op` into `state`, returning the new state. Pure and total — never
/// panics, regardless of how malformed or out-of-order the operation looks;
/// operations that don't apply (e.g. leaving a room you aren't in) are
/// no-ops.
pub fn apply(state: &RoomState, op: &Operation) -> RoomState {
    match &op.kind {
        OperationKind::RoomCreate {
            room_code,
            user_id,
            username,
        } => apply_room_create(state, room_code, user_id, username, op.submit_timestamp),
        OperationKind::RoomJoin { user_id, username } => {
            apply_room_join(state, user_id, username, op.submit_timestamp)
        }
        OperationKind::RoomLeave { user_id } => apply_room_leave(state, user_id),
        OperationKind::PlaybackPlay {
            video_id,
            position_seconds,
        } => apply_playback_play(state, video_id, *position_seconds, op.submit_timestamp),
        OperationKind::PlaybackPause { position_seconds } => {
            apply_playback_pause(state, *position_seconds, op.submit_timestamp)
        }
        OperationKind::PlaybackSeek {
            new_position_seconds,
        } => apply_playback_seek(state, *new_position_seconds, op.submit_timestamp),
        OperationKind::PlaylistAdd {
            video_id,
            title,
            position,
        } => apply_playlist_add(
            state,
            video_id,
            title.clone(),
            *position,
            &op.origin_user_id,
            op.submit_timestamp,
        ),
        OperationKind::PlaylistRemove {
            video_id,
            removed_video_position,
        } => apply_playlist_remove(state, video_id, *removed_video_position),
        OperationKind::ChatMessage { text } => {
            apply_chat_message(state, text, &op.origin_user_id, op.submit_timestamp)
        }
    }
}

fn apply_room_create(
    state: &RoomState,
    room_code: &str,
    user_id: &str,
    username: &str,
    submit_timestamp: i64,
) -> RoomState {
    if state.is_created() {
        // Idempotent: a second ROOM_CREATE for an already-created room is a no-op.
        return state.clone();
    }
    let mut next = RoomState::empty();
    next.code = room_code.to_string();
    next.created_at = submit_timestamp;
    next.created_by = user_id.to_string();
    next.participants.push(Participant {
        user_id: user_id.to_string(),
        username: username.to_string(),
        joined_at: submit_timestamp,
        is_creator: true,
    });
    next
}

fn apply_room_join(
    state: &RoomState,
    user_id: &str,
    username: &str,
    submit_timestamp: i64,
) -> RoomState {
    let mut next = state.clone();
    if next.participants.iter().any(|p| p.user_id == user_id) {
        return next; // idempotent
    }
    next.participants.push(Participant {
        user_id: user_id.to_string(),
        username: username.to_string(),
        joined_at: submit_timestamp,
        is_creator: false,
    });
    next
}

fn apply_room_leave(state: &RoomState, user_id: &str) -> RoomState {
    let mut next = state.clone();
    // isCreator is never transferred; createdBy is untouched regardless of
    // who leaves.
    next.participants.retain(|p| p.user_id != user_id);
    next
}

fn apply_playback_play(
    state: &RoomState,
    video_id: &str,
    position_seconds: f64,
    submit_timestamp: i64,
) -> RoomState {
    let mut next = state.clone();
    next.playback = Playback {
        is_playing: true,
        current_video_id: Some(video_id.to_string()),
        position_seconds,
        last_updated: submit_timestamp,
    };
    next
}

fn apply_playback_pause(state: &RoomState, position_seconds: f64, submit_timestamp: i64) -> RoomState {
    let mut next = state.clone();
    next.playback.is_playing = false;
    next.playback.position_seconds = position_seconds;
    next.playback.last_updated = submit_timestamp;
    next
}

fn apply_playback_seek(
    state: &RoomState,
    new_position_seconds: f64,
    submit_timestamp: i64,
) -> RoomState {
    let mut next = state.clone();
    next.playback.position_seconds = new_position_seconds;
    next.playback.last_updated = submit_timestamp;
    next
}

fn apply_playlist_add(
    state: &RoomState,
    video_id: &str,
    title: Option<String>,
    position: i64,
    added_by: &str,
    submit_timestamp: i64,
) -> RoomState {
    let mut next = state.clone();
    let entry = PlaylistEntry {
        video_id: video_id.to_string(),
        title,
        added_by: added_by.to_string(),
        added_at: submit_timestamp,
    };
    let len = next.playlist.len();
    let idx = if position < 0 {
        len
    } else {
        (position as usize).min(len)
    };
    next.playlist.insert(idx, entry);
    next
}

fn apply_playlist_remove(state: &RoomState, video_id: &str, removed_video_position: i64) -> RoomState {
    let mut next = state.clone();
    let len = next.playlist.len();
    if removed_video_position >= 0 {
        let idx = removed_video_position as usize;
        if idx < len && next.playlist[idx].video_id == video_id {
            next.playlist.remove(idx);
            return next;
        }
    }
    // Stale position: fall back to the first matching videoId from the head.
    if let Some(idx) = next.playlist.iter().position(|e| e.video_id == video_id) {
        next.playlist.remove(idx);
    }
    next
}

fn apply_chat_message(
    state: &RoomState,
    text: &str,
    origin_user_id: &str,
    submit_timestamp: i64,
) -> RoomState {
    let mut next = state.clone();
    next.chat_log.push(ChatMessage {
        id: format!("{}-{}", submit_timestamp, origin_user_id),
        user_id: origin_user_id.to_string(),
        text: text.to_string(),
        timestamp: submit_timestamp,
    });
    if next.chat_log.len() > MAX_CHAT_LOG {
        let overflow = next.chat_log.len() - MAX_CHAT_LOG;
        next.chat_log.drain(0..overflow);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_op(code: &str, user: &str, name: &str, ts: i64) -> Operation {
        Operation::new(
            OperationKind::RoomCreate {
                room_code: code.to_string(),
                user_id: user.to_string(),
                username: name.to_string(),
            },
            user,
            ts,
        )
    }

    #[test]
    fn room_create_seeds_creator_as_sole_participant() {
        let state = apply(&RoomState::empty(), &create_op("ABC123", "u1", "Alice", 100));
        assert_eq!(state.code, "ABC123");
        assert_eq!(state.created_by, "u1");
        assert_eq!(state.participants.len(), 1);
        assert!(state.participants[0].is_creator);
    }

    #[test]
    fn room_create_is_idempotent() {
        let s1 = apply(&RoomState::empty(), &create_op("ABC123", "u1", "Alice", 100));
        let op2 = create_op("ABC123", "u1", "Alice", 200);
        let s2 = apply(&s1, &op2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn room_join_is_idempotent() {
        let s0 = apply(&RoomState::empty(), &create_op("ABC123", "u1", "Alice", 100));
        let join = Operation::new(
            OperationKind::RoomJoin {
                user_id: "u2".to_string(),
                username: "Bob".to_string(),
            },
            "u2",
            150,
        );
        let s1 = apply(&s0, &join);
        let s2 = apply(&s1, &join);
        assert_eq!(s1, s2);
        assert_eq!(s1.participants.len(), 2);
        assert!(!s1.participants[1].is_creator);
    }

    #[test]
    fn room_leave_is_idempotent_and_preserves_created_by() {
        let s0 = apply(&RoomState::empty(), &create_op("ABC123", "u1", "Alice", 100));
        let join = Operation::new(
            OperationKind::RoomJoin {
                user_id: "u2".to_string(),
                username: "Bob".to_string(),
            },
            "u2",
            150,
        );
        let s1 = apply(&s0, &join);
        let leave = Operation::new(
            OperationKind::RoomLeave {
                user_id: "u1".to_string(),
            },
            "u1",
            200,
        );
        let s2 = apply(&s1, &leave);
        let s3 = apply(&s2, &leave);
        assert_eq!(s2, s3);
        assert_eq!(s2.created_by, "u1");
        assert_eq!(s2.participants.len(), 1);
        assert_eq!(s2.participants[0].user_id, "u2");
        assert!(!s2.participants[0].is_creator);
    }

    #[test]
    fn seek_while_paused_preserves_is_playing() {
        let mut state = RoomState::empty();
        state.code = "ABC123".into();
        state.playback = Playback {
            is_playing: false,
            current_video_id: Some("v1".into()),
            position_seconds: 10.0,
            last_updated: 1,
        };
        let seek = Operation::new(
            OperationKind::PlaybackSeek {
                new_position_seconds: 42.0,
            },
            "u1",
            999,
        );
        let next = apply(&state, &seek);
        assert!(!next.playback.is_playing);
        assert_eq!(next.playback.position_seconds, 42.0);
        assert_eq!(next.playback.last_updated, 999);
    }

    #[test]
    fn pause_preserves_current_video_id() {
        let mut state = RoomState::empty();
        state.playback.current_video_id = Some("v1".into());
        state.playback.is_playing = true;
        let pause = Operation::new(
            OperationKind::PlaybackPause {
                position_seconds: 5.0,
            },
            "u1",
            10,
        );
        let next = apply(&state, &pause);
        assert!(!next.playback.is_playing);
        assert_eq!(next.playback.current_video_id.as_deref(), Some("v1"));
    }

    #[test]
    fn playlist_add_negative_one_appends() {
        let mut state = RoomState::empty();
        let add = |video_id: &str, position: i64| {
            Operation::new(
                OperationKind::PlaylistAdd {
                    video_id: video_id.to_string(),
                    title: None,
                    position,
                },
                "u1",
                1,
            )
        };
        state = apply(&state, &add("v1", -1));
        state = apply(&state, &add("v2", -1));
        assert_eq!(
            state.playlist.iter().map(|e| e.video_id.clone()).collect::<Vec<_>>(),
            vec!["v1", "v2"]
        );
    }

    #[test]
    fn playlist_add_position_beyond_len_appends() {
        let mut state = RoomState::empty();
        let add = Operation::new(
            OperationKind::PlaylistAdd {
                video_id: "v1".to_string(),
                title: None,
                position: 50,
            },
            "u1",
            1,
        );
        state = apply(&state, &add);
        assert_eq!(state.playlist.len(), 1);
        assert_eq!(state.playlist[0].video_id, "v1");
    }

    #[test]
    fn playlist_add_position_zero_prepends() {
        let mut state = RoomState::empty();
        let add = |video_id: &str, position: i64| {
            Operation::new(
                OperationKind::PlaylistAdd {
                    video_id: video_id.to_string(),
                    title: None,
                    position,
                },
                "u1",
                1,
            )
        };
        state = apply(&state, &add("v1", -1));
        state = apply(&state, &add("v2", 0));
        assert_eq!(
            state.playlist.iter().map(|e| e.video_id.clone()).collect::<Vec<_>>(),
            vec!["v2", "v1"]
        );
    }

    #[test]
    fn playlist_remove_stale_position_falls_back_to_head_match() {
        let mut state = RoomState::empty();
        let add = |video_id: &str| {
            Operation::new(
                OperationKind::PlaylistAdd {
                    video_id: video_id.to_string(),
                    title: None,
                    position: -1,
                },
                "u1",
                1,
            )
        };
        state = apply(&state, &add("v1"));
        state = apply(&state, &add("v2"));
        state = apply(&state, &add("v1"));

        // removed_video_position points past the current length — stale.
        let remove = Operation::new(
            OperationKind::PlaylistRemove {
                video_id: "v1".to_string(),
                removed_video_position: 99,
            },
            "u1",
            2,
        );
        state = apply(&state, &remove);
        assert_eq!(
            state.playlist.iter().map(|e| e.video_id.clone()).collect::<Vec<_>>(),
            vec!["v2", "v1"]
        );
    }

    #[test]
    fn playlist_remove_no_match_is_noop() {
        let state = RoomState::empty();
        let remove = Operation::new(
            OperationKind::PlaylistRemove {
                video_id: "missing".to_string(),
                removed_video_position: 0,
            },
            "u1",
            2,
        );
        let next = apply(&state, &remove);
        assert_eq!(next, state);
    }

    #[test]
    fn chat_log_caps_at_1000() {
        let mut state = RoomState::empty();
        for i in 0..1001 {
            let chat = Operation::new(
                OperationKind::ChatMessage {
                    text: format!("msg {}", i),
                },
                "u1",
                i,
            );
            state = apply(&state, &chat);
        }
        assert_eq!(state.chat_log.len(), 1000);
        assert_eq!(state.chat_log[0].timestamp, 1);
        assert_eq!(state.chat_log.last().unwrap().timestamp, 1000);
    }

    #[test]
    fn participant_uniqueness_holds_after_joins() {
        let mut state = apply(&RoomState::empty(), &create_op("ABC123", "u1", "Alice", 1));
        let join = Operation::new(
            OperationKind::RoomJoin {
                user_id: "u2".to_string(),
                username: "Bob".to_string(),
            },
            "u2",
            2,
        );
        state = apply(&state, &join);
        state = apply(&state, &join);
        let mut ids: Vec<_> = state.participants.iter().map(|p| p.user_id.clone()).collect();
        let original_len = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), original_len);
    }

    #[test]
    fn canonical_serialization_is_deterministic() {
        let state = apply(&RoomState::empty(), &create_op("ABC123", "u1", "Alice", 1));
        let a = serde_json::to_vec(&state).unwrap();
        let b = serde_json::to_vec(&state).unwrap();
        assert_eq!(a, b);
    }
}
