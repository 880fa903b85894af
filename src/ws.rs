//! Per-connection WebSocket actor. Parses inbound events, runs the cheap
//! validations locally and forwards the rest to the group server.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::warn;
use serde::Deserialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::validate_jwt;
use crate::group_server::{Connect, Disconnect, GroupServer, JoinRoom, LeaveRoom, SendChatMessage};
use crate::notify::ServerEvent;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound real-time event, `{"event": ..., ...fields}`. Identifiers default
/// to empty strings so a missing field reports the same error as an empty one.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinGroup {
        #[serde(default)]
        group_id: String,
    },
    LeaveGroup {
        #[serde(default)]
        group_id: String,
    },
    SendMessage {
        #[serde(default)]
        group_id: String,
        #[serde(default)]
        message: String,
    },
}

pub struct WsSession {
    pub id: Uuid,
    /// Set when the connection presented a valid token at upgrade time.
    pub user_id: Option<String>,
    pub hb: Instant,
    pub server: Addr<GroupServer>,
}

impl WsSession {
    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!("WebSocket client heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        let event = ServerEvent::Error {
            message: message.to_string(),
        };
        ctx.text(serde_json::to_string(&event).unwrap_or_default());
    }

    fn handle_event(&mut self, event: ClientEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            ClientEvent::JoinGroup { group_id } => {
                if group_id.is_empty() {
                    self.send_error(ctx, "Group ID is required");
                    return;
                }
                let user_id = match &self.user_id {
                    Some(uid) => uid.clone(),
                    None => {
                        self.send_error(ctx, "Authentication required");
                        return;
                    }
                };
                self.server.do_send(JoinRoom {
                    session_id: self.id,
                    user_id,
                    group_id,
                });
            }
            ClientEvent::LeaveGroup { group_id } => {
                if group_id.is_empty() {
                    self.send_error(ctx, "Group ID is required");
                    return;
                }
                self.server.do_send(LeaveRoom {
                    session_id: self.id,
                    group_id,
                });
            }
            ClientEvent::SendMessage { group_id, message } => {
                if group_id.is_empty() {
                    self.send_error(ctx, "Group ID is required");
                    return;
                }
                let text = message.trim().to_string();
                if text.is_empty() {
                    self.send_error(ctx, "Message cannot be empty");
                    return;
                }
                let user_id = match &self.user_id {
                    Some(uid) => uid.clone(),
                    None => {
                        self.send_error(ctx, "Authentication required");
                        return;
                    }
                };
                self.server.do_send(SendChatMessage {
                    session_id: self.id,
                    user_id,
                    group_id,
                    text,
                });
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
        self.server.do_send(Connect {
            session_id: self.id,
            addr: ctx.address().recipient(),
        });
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        self.server.do_send(Disconnect {
            session_id: self.id,
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => self.handle_event(event, ctx),
                Err(_) => self.send_error(ctx, "Invalid event payload"),
            },
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!("WebSocket error: {}", e);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<ServerEvent> for WsSession {
    type Result = ();

    fn handle(&mut self, event: ServerEvent, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.text(serde_json::to_string(&event).unwrap_or_default());
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws?token=<jwt> — upgrades to a WebSocket session. A missing or bad
/// token still connects, but join and send will answer with an error event.
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    query: web::Query<WsQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    let user_id = query
        .token
        .as_deref()
        .and_then(|token| validate_jwt(token, &data.config.jwt_secret).ok())
        .map(|claims| claims.sub);

    ws::start(
        WsSession {
            id: Uuid::new_v4(),
            user_id,
            hb: Instant::now(),
            server: data.group_server.clone(),
        },
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_group_event_parses() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"join_group","group_id":"g1"}"#).unwrap();
        match ev {
            ClientEvent::JoinGroup { group_id } => assert_eq!(group_id, "g1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn missing_group_id_defaults_to_empty() {
        let ev: ClientEvent = serde_json::from_str(r#"{"event":"leave_group"}"#).unwrap();
        match ev {
            ClientEvent::LeaveGroup { group_id } => assert!(group_id.is_empty()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn send_message_event_parses() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"send_message","group_id":"g1","message":" hi "}"#)
                .unwrap();
        match ev {
            ClientEvent::SendMessage { group_id, message } => {
                assert_eq!(group_id, "g1");
                assert_eq!(message.trim(), "hi");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"shout"}"#).is_err());
    }
}
