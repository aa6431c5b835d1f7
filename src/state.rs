//! Room registry: metadata, membership and chat log per room.
//!
//! The outer map lock is only taken to find a room (or, for create and
//! delete, to change the map). Everything inside a room sits behind that
//! room's own mutex, so traffic in one room never waits on another.

use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    time,
};
use tracing::warn;

use crate::{
    config::DEFAULT_SEND_TIMEOUT_MS,
    error::{JoinErr, RoomNotFound},
    fanout::{fan_out, Delivery},
    history::ChatLog,
    protocol::{ChatMessage, Outbound},
};

/// Write side of a session's outbound queue.
pub type Outbox = mpsc::Sender<Message>;

/// Number of sessions with a live receive loop.
pub type LiveSessions = Arc<AtomicUsize>;

/// Non-owning handle to a session, as seen by its room.
#[derive(Clone, Debug)]
pub struct Member {
    pub id: String,
    pub tx: Outbox,
}

/* ------------ one room ------------ */
pub struct RoomState {
    pub id:         String,
    pub label:      String,
    pub widget_url: String,
    created:        DateTime<Utc>,
    members:        HashMap<String, Outbox>,
    history:        ChatLog,
    // set once the room is removed from the map; late joiners bounce off it
    deleted:        bool,
}

impl RoomState {
    /// Point-in-time copy of the member handles; fan-out works on this, never
    /// on the live map.
    fn snapshot(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|(id, tx)| Member { id: id.clone(), tx: tx.clone() })
            .collect()
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            id:           self.id.clone(),
            label:        self.label.clone(),
            widget_url:   self.widget_url.clone(),
            member_count: self.members.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id:           String,
    pub label:        String,
    pub widget_url:   String,
    pub member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id:           String,
    pub label:        String,
    pub member_count: usize,
}

type Shared = Arc<Mutex<RoomState>>;

/* ------------ registry ------------ */
#[derive(Clone)]
pub struct Rooms {
    map:           Arc<RwLock<HashMap<String, Shared>>>,
    history_limit: Option<usize>,
    // how long a joiner's queue may stay full before the join is refused
    replay_wait:   Duration,
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new(None, Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS))
    }
}

impl Rooms {
    pub fn new(history_limit: Option<usize>, replay_wait: Duration) -> Self {
        Self { map: Arc::default(), history_limit, replay_wait }
    }

    async fn get(&self, id: &str) -> Result<Shared, RoomNotFound> {
        self.map
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RoomNotFound(id.to_owned()))
    }

    /* ---- metadata (REST side) ---- */

    pub async fn create(&self, label: String, widget_url: String) -> RoomInfo {
        let id = uuid::Uuid::new_v4().to_string();
        let room = RoomState {
            id: id.clone(),
            label,
            widget_url,
            created: Utc::now(),
            members: HashMap::new(),
            history: ChatLog::new(self.history_limit),
            deleted: false,
        };
        let info = room.info();
        self.map.write().await.insert(id, Arc::new(Mutex::new(room)));
        info
    }

    /// Metadata only: members and chat log are kept.
    pub async fn update(&self, id: &str, label: String, widget_url: String) -> Result<RoomInfo, RoomNotFound> {
        let room = self.get(id).await?;
        let mut st = room.lock().await;
        st.label = label;
        st.widget_url = widget_url;
        Ok(st.info())
    }

    /// Drops the room with its members and chat log.
    pub async fn delete(&self, id: &str) -> Result<(), RoomNotFound> {
        let room = self
            .map
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RoomNotFound(id.to_owned()))?;
        let mut st = room.lock().await;
        st.deleted = true;
        st.members.clear();
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Result<RoomInfo, RoomNotFound> {
        let room = self.get(id).await?;
        let st = room.lock().await;
        Ok(st.info())
    }

    /// Oldest room first.
    pub async fn list(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Shared> = self.map.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            let st = room.lock().await;
            out.push((st.created, RoomSummary {
                id:           st.id.clone(),
                label:        st.label.clone(),
                member_count: st.members.len(),
            }));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.into_iter().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    /* ---- membership (session side) ---- */

    /// Add the session and queue the room's chat log to it, both under the
    /// room lock: no live chat frame can land between the two.
    ///
    /// Queue space for the replay is reserved before the lock is taken. If
    /// the joiner's queue stays full for `replay_wait` (or is closed), the
    /// join is refused rather than leaving a member without history.
    /// Returns the new member count.
    pub async fn join(&self, room_id: &str, session_id: &str, tx: Outbox) -> Result<usize, JoinErr> {
        let room = self.get(room_id).await?;
        let permit = match time::timeout(self.replay_wait, tx.clone().reserve_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(JoinErr::NoReplay(session_id.to_owned())),
        };

        let mut st = room.lock().await;
        if st.deleted {
            return Err(RoomNotFound(room_id.to_owned()).into());
        }
        let frame = Outbound::Chat(st.history.replay()).encode().map_err(|e| {
            warn!(room = room_id, "encode chat replay: {e}");
            JoinErr::NoReplay(session_id.to_owned())
        })?;
        permit.send(Message::Text(frame));
        st.members.insert(session_id.to_owned(), tx);
        Ok(st.members.len())
    }

    /// Idempotent. Returns whether the session was actually removed.
    pub async fn leave(&self, room_id: &str, session_id: &str) -> bool {
        match self.get(room_id).await {
            Ok(room) => room.lock().await.members.remove(session_id).is_some(),
            Err(_) => false,
        }
    }

    pub async fn member_count(&self, room_id: &str) -> Result<usize, RoomNotFound> {
        let room = self.get(room_id).await?;
        let n = room.lock().await.members.len();
        Ok(n)
    }

    /* ---- fan-out ---- */

    /// Frames are queued while the room lock is held so every member sees
    /// the room's messages in dispatch order. Queueing never waits.
    pub async fn broadcast(&self, room_id: &str, msg: &Outbound) -> Result<Delivery, RoomNotFound> {
        let room = self.get(room_id).await?;
        let st = room.lock().await;
        if st.deleted {
            return Err(RoomNotFound(room_id.to_owned()));
        }
        Ok(send_encoded(&st.snapshot(), msg))
    }

    /// Append to the chat log and broadcast the updated log.
    pub async fn post_chat(&self, room_id: &str, msg: ChatMessage) -> Result<Delivery, RoomNotFound> {
        let room = self.get(room_id).await?;
        let mut st = room.lock().await;
        if st.deleted {
            return Err(RoomNotFound(room_id.to_owned()));
        }
        let log = st.history.append(msg);
        Ok(send_encoded(&st.snapshot(), &Outbound::Chat(log)))
    }
}

fn send_encoded(members: &[Member], msg: &Outbound) -> Delivery {
    match msg.encode() {
        Ok(frame) => fan_out(members, &frame),
        Err(e) => {
            warn!("encode outbound: {e}");
            Delivery::default()
        }
    }
}
