use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::gateway::GatewayError;
use crate::gateway::event::{ClientEvent, ServerEvent};
use crate::gateway::multiplex::publish;
use crate::gateway::registry::{ConnectionId, ConnectionRegistry};
use crate::store::{Message, MessageStore, now_rfc3339};

/// Core event handlers for one gateway process: the message dispatch
/// pipeline plus the ephemeral presence/typing relays.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    send_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            registry,
            store,
            send_guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Routes one inbound event. Failures are reported back to the
    /// originating connection only; a stale connection id is dropped
    /// silently since the disconnect race is expected.
    pub async fn dispatch(&self, conn: ConnectionId, event: ClientEvent) {
        let result = match event {
            ClientEvent::JoinRoom { room_id } => self.handle_join(conn, &room_id).await,
            ClientEvent::LeaveRoom { room_id } => self.handle_leave(conn, &room_id).await,
            ClientEvent::SendMessage { room_id, content } => self
                .handle_send(conn, &room_id, &content)
                .await
                .map(|_| ()),
            ClientEvent::TypingStart { room_id } => self.handle_typing(conn, &room_id, true).await,
            ClientEvent::TypingStop { room_id } => self.handle_typing(conn, &room_id, false).await,
        };

        match result {
            Ok(()) => {}
            Err(GatewayError::UnknownConnection) => {
                debug!("dropped event from disconnected connection {conn}");
            }
            Err(err) => {
                self.registry
                    .send_to(conn, ServerEvent::Error { message: err.to_string() })
                    .await;
            }
        }
    }

    /// Persist-then-broadcast. The per-room guard (not the registry
    /// lock) is held across the store call so that broadcasts for one
    /// room follow its append order; sends to other rooms do not wait
    /// on it. The subscriber snapshot is taken after the write
    /// completes, never before.
    ///
    /// Room membership is deliberately not re-checked here: it was
    /// authorized at join time, and a connection that left the room
    /// may still post (it just no longer receives the echo).
    pub async fn handle_send(
        &self,
        conn: ConnectionId,
        room_id: &str,
        content: &str,
    ) -> Result<Message, GatewayError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(GatewayError::InvalidContent);
        }

        let identity = self
            .registry
            .identity_of(conn)
            .await
            .ok_or(GatewayError::UnknownConnection)?;

        let guard = self.send_guard(room_id).await;
        let result = {
            let _ordering = guard.lock().await;

            match self.store.append_fast(room_id, &identity, content).await {
                Ok(message) => {
                    info!("message sent by {} in room {room_id}", identity.username);

                    // Sender included: every replica of the room UI sees the
                    // same canonical message, no separate local echo.
                    publish(
                        &self.registry,
                        room_id,
                        ServerEvent::MessageReceived(message.clone()),
                        None,
                    )
                    .await;

                    Ok(message)
                }
                Err(err) => Err(err.into()),
            }
        };
        self.release_send_guard(room_id, guard).await;

        result
    }

    pub async fn handle_join(&self, conn: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        let identity = self
            .registry
            .subscribe(conn, room_id)
            .await
            .ok_or(GatewayError::UnknownConnection)?;
        info!("{} joined room {room_id}", identity.username);

        publish(
            &self.registry,
            room_id,
            ServerEvent::UserJoined {
                room_id: room_id.to_owned(),
                user_id: identity.id,
                username: identity.username,
                timestamp: now_rfc3339(),
            },
            Some(conn),
        )
        .await;

        self.registry
            .send_to(
                conn,
                ServerEvent::RoomJoined {
                    room_id: room_id.to_owned(),
                    message: "Successfully joined room".to_string(),
                },
            )
            .await;

        Ok(())
    }

    pub async fn handle_leave(&self, conn: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        let identity = self
            .registry
            .unsubscribe(conn, room_id)
            .await
            .ok_or(GatewayError::UnknownConnection)?;
        info!("{} left room {room_id}", identity.username);

        publish(
            &self.registry,
            room_id,
            ServerEvent::UserLeft {
                room_id: room_id.to_owned(),
                user_id: identity.id,
                username: identity.username,
                timestamp: now_rfc3339(),
            },
            Some(conn),
        )
        .await;

        Ok(())
    }

    /// Typing notices mutate nothing and are never persisted.
    pub async fn handle_typing(
        &self,
        conn: ConnectionId,
        room_id: &str,
        is_typing: bool,
    ) -> Result<(), GatewayError> {
        let identity = self
            .registry
            .identity_of(conn)
            .await
            .ok_or(GatewayError::UnknownConnection)?;

        publish(
            &self.registry,
            room_id,
            ServerEvent::UserTyping {
                room_id: room_id.to_owned(),
                user_id: identity.id,
                username: identity.username,
                is_typing,
            },
            Some(conn),
        )
        .await;

        Ok(())
    }

    pub async fn handle_disconnect(&self, conn: ConnectionId) {
        if let Some(identity) = self.registry.unregister(conn).await {
            info!("user disconnected: {} ({conn})", identity.username);
        }
    }

    async fn send_guard(&self, room_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.send_guards.lock().await;
        guards.entry(room_id.to_owned()).or_default().clone()
    }

    /// Evicts the room's guard once the last in-flight send finishes,
    /// so the map tracks only rooms with sends in progress. Guards are
    /// cloned out of `send_guards` only under the map lock, so the
    /// reference count is stable here: two references means the map's
    /// entry and ours.
    async fn release_send_guard(&self, room_id: &str, guard: Arc<Mutex<()>>) {
        let mut guards = self.send_guards.lock().await;
        if Arc::strong_count(&guard) == 2 {
            guards.remove(room_id);
        }
    }
}
