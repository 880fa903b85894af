//! Group server actor: owns the room registry, validates joins against group
//! membership, relays chat into rooms and fans out published events.

use actix::prelude::*;
use chrono::Utc;
use log::info;
use mongodb::bson::doc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::MongoDB;
use crate::models::{ChatMessage, Group, User};
use crate::notify::{FanoutTarget, Publish, ServerEvent};

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub session_id: Uuid,
    pub addr: Recipient<ServerEvent>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub session_id: Uuid,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct JoinRoom {
    pub session_id: Uuid,
    pub user_id: String,
    pub group_id: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct LeaveRoom {
    pub session_id: Uuid,
    pub group_id: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct SendChatMessage {
    pub session_id: Uuid,
    pub user_id: String,
    pub group_id: String,
    pub text: String,
}

/// Explicit registry of connected sessions and the rooms they joined.
/// Join and leave are idempotent; a session may sit in any number of rooms.
pub struct RoomRegistry {
    sessions: HashMap<Uuid, Recipient<ServerEvent>>,
    rooms: HashMap<String, HashSet<Uuid>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        RoomRegistry {
            sessions: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    pub fn connect(&mut self, session_id: Uuid, addr: Recipient<ServerEvent>) {
        self.sessions.insert(session_id, addr);
    }

    pub fn disconnect(&mut self, session_id: Uuid) {
        self.sessions.remove(&session_id);
        self.rooms.retain(|_, members| {
            members.remove(&session_id);
            !members.is_empty()
        });
    }

    pub fn join(&mut self, group_id: &str, session_id: Uuid) {
        if self.sessions.contains_key(&session_id) {
            self.rooms
                .entry(group_id.to_string())
                .or_default()
                .insert(session_id);
        }
    }

    pub fn leave(&mut self, group_id: &str, session_id: Uuid) {
        if let Some(members) = self.rooms.get_mut(group_id) {
            members.remove(&session_id);
            if members.is_empty() {
                self.rooms.remove(group_id);
            }
        }
    }

    pub fn is_in_room(&self, group_id: &str, session_id: Uuid) -> bool {
        self.rooms
            .get(group_id)
            .map_or(false, |members| members.contains(&session_id))
    }

    pub fn recipient(&self, session_id: Uuid) -> Option<Recipient<ServerEvent>> {
        self.sessions.get(&session_id).cloned()
    }

    pub fn recipients_for(&self, target: &FanoutTarget) -> Vec<Recipient<ServerEvent>> {
        match target {
            FanoutTarget::Room(group_id) => self
                .rooms
                .get(group_id)
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|id| self.sessions.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default(),
            FanoutTarget::Default => self.sessions.values().cloned().collect(),
        }
    }
}

pub struct GroupServer {
    registry: RoomRegistry,
    db: Arc<MongoDB>,
}

impl GroupServer {
    pub fn new(db: Arc<MongoDB>) -> Self {
        GroupServer {
            registry: RoomRegistry::new(),
            db,
        }
    }

    fn reply(&self, session_id: Uuid, event: ServerEvent) {
        if let Some(addr) = self.registry.recipient(session_id) {
            addr.do_send(event);
        }
    }
}

impl Actor for GroupServer {
    type Context = Context<Self>;
}

impl Handler<Connect> for GroupServer {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) {
        info!("Session {} connected (WS)", msg.session_id);
        self.registry.connect(msg.session_id, msg.addr);
    }
}

impl Handler<Disconnect> for GroupServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) {
        info!("Session {} disconnected (WS)", msg.session_id);
        self.registry.disconnect(msg.session_id);
    }
}

impl Handler<JoinRoom> for GroupServer {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: JoinRoom, _: &mut Context<Self>) -> Self::Result {
        let JoinRoom {
            session_id,
            user_id,
            group_id,
        } = msg;
        let db = self.db.clone();
        let lookup_id = group_id.clone();
        Box::pin(
            async move {
                let groups = db.db.collection::<Group>("groups");
                match groups.find_one(doc! { "group_id": &lookup_id }).await {
                    Ok(Some(group)) if group.members.contains(&user_id) => Ok(group.name),
                    Ok(Some(_)) => Err("You are not a member of this group".to_string()),
                    Ok(None) => Err("Group not found".to_string()),
                    Err(_) => Err("Group lookup failed".to_string()),
                }
            }
            .into_actor(self)
            .map(move |res, act, _| match res {
                Ok(group_name) => {
                    act.registry.join(&group_id, session_id);
                    info!("Session {} joined room {}", session_id, group_id);
                    act.reply(
                        session_id,
                        ServerEvent::JoinedGroup {
                            group_id,
                            message: format!("Joined group {}", group_name),
                        },
                    );
                }
                Err(message) => act.reply(session_id, ServerEvent::Error { message }),
            }),
        )
    }
}

impl Handler<LeaveRoom> for GroupServer {
    type Result = ();

    // Leaving never checks membership: leaving a room you were never in is
    // a no-op and still gets the confirmation.
    fn handle(&mut self, msg: LeaveRoom, _: &mut Context<Self>) {
        self.registry.leave(&msg.group_id, msg.session_id);
        self.reply(
            msg.session_id,
            ServerEvent::LeftGroup {
                group_id: msg.group_id,
                message: "Left group".to_string(),
            },
        );
    }
}

impl Handler<SendChatMessage> for GroupServer {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: SendChatMessage, _: &mut Context<Self>) -> Self::Result {
        let SendChatMessage {
            session_id,
            user_id,
            group_id,
            text,
        } = msg;
        let db = self.db.clone();
        let room_id = group_id.clone();
        Box::pin(
            async move {
                let groups = db.db.collection::<Group>("groups");
                let group = match groups.find_one(doc! { "group_id": &group_id }).await {
                    Ok(Some(g)) => g,
                    Ok(None) => return Err("Group not found".to_string()),
                    Err(_) => return Err("Group lookup failed".to_string()),
                };
                if !group.members.contains(&user_id) {
                    return Err("You are not a member of this group".to_string());
                }
                let users = db.db.collection::<User>("users");
                let user = match users.find_one(doc! { "user_id": &user_id }).await {
                    Ok(Some(u)) => u,
                    _ => return Err("Authentication required".to_string()),
                };
                let chat_message = ChatMessage {
                    id: None,
                    message_id: Uuid::new_v4().to_string(),
                    group_id,
                    user_id: user_id.clone(),
                    message: text,
                    timestamp: Utc::now(),
                };
                let messages = db.db.collection::<ChatMessage>("chat_messages");
                if messages.insert_one(&chat_message).await.is_err() {
                    return Err("Could not store message".to_string());
                }
                Ok(ServerEvent::MessageReceived {
                    message_id: chat_message.message_id,
                    user_id,
                    user_name: user.full_name(),
                    message: chat_message.message,
                    timestamp: chat_message.timestamp.to_rfc3339(),
                })
            }
            .into_actor(self)
            .map(move |res, act, _| match res {
                // Chat goes to the room only; the default channel is for
                // status and progress events.
                Ok(event) => {
                    for addr in act.registry.recipients_for(&FanoutTarget::Room(room_id)) {
                        addr.do_send(event.clone());
                    }
                }
                Err(message) => act.reply(session_id, ServerEvent::Error { message }),
            }),
        )
    }
}

impl Handler<Publish> for GroupServer {
    type Result = ();

    fn handle(&mut self, msg: Publish, _: &mut Context<Self>) {
        for target in &msg.targets {
            for addr in self.registry.recipients_for(target) {
                addr.do_send(msg.event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink;

    impl Actor for Sink {
        type Context = Context<Self>;
    }

    impl Handler<ServerEvent> for Sink {
        type Result = ();

        fn handle(&mut self, _: ServerEvent, _: &mut Context<Self>) {}
    }

    fn sink() -> Recipient<ServerEvent> {
        Sink.start().recipient()
    }

    #[actix_rt::test]
    async fn join_requires_a_connected_session() {
        let mut reg = RoomRegistry::new();
        let stranger = Uuid::new_v4();
        reg.join("g1", stranger);
        assert!(!reg.is_in_room("g1", stranger));

        let member = Uuid::new_v4();
        reg.connect(member, sink());
        reg.join("g1", member);
        assert!(reg.is_in_room("g1", member));
    }

    #[actix_rt::test]
    async fn join_and_leave_are_idempotent() {
        let mut reg = RoomRegistry::new();
        let id = Uuid::new_v4();
        reg.connect(id, sink());
        reg.join("g1", id);
        reg.join("g1", id);
        assert_eq!(reg.recipients_for(&FanoutTarget::Room("g1".into())).len(), 1);

        reg.leave("g1", id);
        reg.leave("g1", id);
        assert!(!reg.is_in_room("g1", id));
        // Leaving a room never joined is a no-op.
        reg.leave("g2", id);
    }

    #[actix_rt::test]
    async fn room_fanout_only_reaches_room_members() {
        let mut reg = RoomRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.connect(a, sink());
        reg.connect(b, sink());
        reg.join("g1", a);

        assert_eq!(reg.recipients_for(&FanoutTarget::Room("g1".into())).len(), 1);
        assert_eq!(reg.recipients_for(&FanoutTarget::Default).len(), 2);
        assert!(reg
            .recipients_for(&FanoutTarget::Room("missing".into()))
            .is_empty());
    }

    #[actix_rt::test]
    async fn dual_emit_delivers_twice_to_room_members() {
        let mut reg = RoomRegistry::new();
        let a = Uuid::new_v4();
        reg.connect(a, sink());
        reg.join("g1", a);

        let targets = [
            FanoutTarget::Room("g1".into()),
            FanoutTarget::Default,
        ];
        let total: usize = targets.iter().map(|t| reg.recipients_for(t).len()).sum();
        // One delivery per target: the duplicate to room members is the
        // accepted cost of reaching late joiners through the default channel.
        assert_eq!(total, 2);
    }

    #[actix_rt::test]
    async fn disconnect_removes_session_from_all_rooms() {
        let mut reg = RoomRegistry::new();
        let a = Uuid::new_v4();
        reg.connect(a, sink());
        reg.join("g1", a);
        reg.join("g2", a);

        reg.disconnect(a);
        assert!(!reg.is_in_room("g1", a));
        assert!(!reg.is_in_room("g2", a));
        assert!(reg.recipients_for(&FanoutTarget::Default).is_empty());
    }
}
