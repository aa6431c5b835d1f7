//! Per-connection state and message dispatch.
//!
//! A `Session` is owned by its connection's receive loop. Its outbox is the
//! only way anything reaches the socket; rooms hold clones of it for fan-out.

use axum::extract::ws::Message;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    error::SessionErr,
    protocol::{self, ChatInput, ChatMessage, Inbound, Outbound},
    state::{Outbox, Rooms},
};

pub struct Session {
    id:     String,
    outbox: Outbox,
    rooms:  Rooms,
    room:   Option<String>,
}

impl Session {
    /// Assign a fresh id and tell the client about it.
    pub async fn open(rooms: Rooms, outbox: Outbox) -> Result<Self, SessionErr> {
        let id = uuid::Uuid::new_v4().to_string();
        let hello = Outbound::SocketId(id.clone())
            .encode()
            .map_err(SessionErr::Encode)?;
        outbox.send(Message::Text(hello)).await.map_err(|_| SessionErr::Closed)?;
        info!(session = %id, "new connection");
        Ok(Self { id, outbox, rooms, room: None })
    }

    pub fn id(&self) -> &str { &self.id }

    /// Current room id, `None` while idle.
    pub fn current_room(&self) -> Option<&str> { self.room.as_deref() }

    /// Decode and dispatch one text frame. A decode failure is returned so
    /// the caller can end the connection.
    pub async fn handle_frame(&mut self, raw: &str) -> Result<(), SessionErr> {
        match protocol::decode(raw)? {
            Some(msg) => self.dispatch(msg).await,
            None => debug!(session = %self.id, "unknown message type ignored"),
        }
        Ok(())
    }

    pub async fn dispatch(&mut self, msg: Inbound) {
        match msg {
            Inbound::Seek(ms)        => self.relay(Outbound::Seek(ms)).await,
            Inbound::Skip(ms)        => self.relay(Outbound::Skip(ms)).await,
            Inbound::Playback(state) => self.relay(Outbound::Playback(state)).await,
            Inbound::ChangeRoom(to)  => self.change_room(to).await,
            Inbound::Chat(input)     => self.chat(input).await,
        }
    }

    async fn relay(&self, msg: Outbound) {
        let Some(room) = self.room.as_deref() else {
            debug!(session = %self.id, "not in a room, {msg:?} dropped");
            return;
        };
        match self.rooms.broadcast(room, &msg).await {
            Ok(d) => debug!(session = %self.id, room, delivered = d.delivered, failed = d.failed.len(), "relayed"),
            Err(e) => warn!(session = %self.id, "{e}, message dropped"),
        }
    }

    async fn chat(&self, input: ChatInput) {
        let Some(room) = self.room.as_deref() else {
            debug!(session = %self.id, "not in a room, chat dropped");
            return;
        };
        let msg = ChatMessage {
            sender_id:   self.id.clone(),
            sender_name: input.sender_name,
            message:     input.message,
            timestamp:   Utc::now(),
        };
        match self.rooms.post_chat(room, msg).await {
            Ok(d) => debug!(session = %self.id, room, delivered = d.delivered, "chat posted"),
            Err(e) => warn!(session = %self.id, "{e}, chat dropped"),
        }
    }

    async fn change_room(&mut self, target: String) {
        if target.is_empty() {
            self.leave_current().await;
            info!(session = %self.id, "moved to index");
            return;
        }
        // an unknown target leaves the session where it was
        if let Err(e) = self.rooms.lookup(&target).await {
            warn!(session = %self.id, "{e}, room change ignored");
            return;
        }
        self.leave_current().await;
        match self.rooms.join(&target, &self.id, self.outbox.clone()).await {
            Ok(count) => {
                info!(session = %self.id, room = %target, members = count, "room change");
                self.room = Some(target);
            }
            // deleted between lookup and join, or our own queue is jammed:
            // end up idle rather than in a room without its history
            Err(e) => warn!(session = %self.id, "{e}, now idle"),
        }
    }

    async fn leave_current(&mut self) {
        if let Some(room) = self.room.take() {
            if !self.rooms.leave(&room, &self.id).await {
                debug!(session = %self.id, room = %room, "room already gone");
                return;
            }
            if let Ok(left) = self.rooms.member_count(&room).await {
                info!(session = %self.id, room = %room, members = left, "left room");
            }
        }
    }

    /// Leave the current room. Consumes the session, so this runs once.
    pub async fn close(mut self) {
        self.leave_current().await;
        info!(session = %self.id, "connection closed");
    }
}
