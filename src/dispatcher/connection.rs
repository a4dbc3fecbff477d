//! Listener connection lifecycle on the dispatcher side
//!
//! A connection starts `Unregistered`. The first command must be `register`;
//! anything else is a protocol violation and closes the socket. Once
//! registered, result frames are routed to the session's pending relay and
//! unknown commands are answered without closing.

use crate::error::Error;
use crate::protocol::{
    decode_inbound, encode, Command, InboundFrame, ResultMessage, MSG_ALREADY_REGISTERED,
    MSG_MALFORMED, MSG_NOT_REGISTERED, MSG_UNAUTHORIZED, MSG_UNRECOGNIZED_COMMAND,
};
use crate::registry::{ListenerRegistry, ListenerSession, ReplyRouting};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Whether the connection survives the frame just handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Close,
}

enum ConnectionState {
    Unregistered,
    Registered(Arc<ListenerSession>),
}

/// Registration state machine for one accepted WebSocket
pub(crate) struct Connection {
    remote_addr: IpAddr,
    registry: Arc<ListenerRegistry>,
    outbound: mpsc::UnboundedSender<String>,
    state: ConnectionState,
}

impl Connection {
    pub(crate) fn new(
        remote_addr: IpAddr,
        registry: Arc<ListenerRegistry>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            remote_addr,
            registry,
            outbound,
            state: ConnectionState::Unregistered,
        }
    }

    /// The registered session, if any
    pub(crate) fn session(&self) -> Option<&Arc<ListenerSession>> {
        match &self.state {
            ConnectionState::Registered(session) => Some(session),
            ConnectionState::Unregistered => None,
        }
    }

    fn reply(&self, result: ResultMessage) {
        match encode(&result) {
            Ok(text) => {
                // A closed writer means the socket is already gone
                let _ = self.outbound.send(text);
            }
            Err(e) => tracing::error!("Failed to encode reply: {}", e),
        }
    }

    /// Handle one text frame from the listener
    pub(crate) async fn handle_frame(&mut self, text: &str) -> Step {
        let frame = match decode_inbound(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(remote = %self.remote_addr, "Could not decode message: {}", e);
                self.reply(ResultMessage::failure(MSG_MALFORMED));
                return Step::Close;
            }
        };

        match self.session().cloned() {
            None => self.handle_unregistered(frame).await,
            Some(session) => self.handle_registered(&session, frame),
        }
    }

    async fn handle_unregistered(&mut self, frame: InboundFrame) -> Step {
        match frame {
            InboundFrame::Command(Command::Register { name, actions }) => {
                if name.is_empty() {
                    self.reply(ResultMessage::failure("A listener name is required"));
                    return Step::Continue;
                }

                let session = Arc::new(ListenerSession::new(
                    name,
                    self.remote_addr,
                    actions,
                    self.outbound.clone(),
                ));
                // The ack must be queued before a relay can see the session
                let registered = self
                    .registry
                    .insert_with(session.clone(), || self.reply(ResultMessage::success()))
                    .await;
                match registered {
                    Ok(()) => self.state = ConnectionState::Registered(session),
                    Err(Error::Registration(reason)) => {
                        tracing::warn!(
                            listener = %session.name(),
                            remote = %self.remote_addr,
                            "Registration rejected: {}",
                            reason
                        );
                        self.reply(ResultMessage::failure(reason));
                    }
                    Err(e) => self.reply(ResultMessage::failure(e.to_string())),
                }
                Step::Continue
            }
            InboundFrame::Command(Command::Unrecognized(command)) => {
                tracing::warn!(
                    remote = %self.remote_addr,
                    command = %command,
                    "Command received before registration"
                );
                self.reply(ResultMessage::failure(MSG_NOT_REGISTERED));
                Step::Close
            }
            InboundFrame::Result(_) => {
                tracing::warn!(remote = %self.remote_addr, "Result received before registration");
                self.reply(ResultMessage::failure(MSG_NOT_REGISTERED));
                Step::Close
            }
        }
    }

    fn handle_registered(&self, session: &Arc<ListenerSession>, frame: InboundFrame) -> Step {
        match frame {
            InboundFrame::Result(result) => match session.deliver_result(result) {
                ReplyRouting::Routed => {}
                ReplyRouting::Discarded => tracing::debug!(
                    listener = %session.name(),
                    "Discarded late reply to a timed out relay"
                ),
                ReplyRouting::Unsolicited => tracing::warn!(
                    listener = %session.name(),
                    "Result received with no relay pending"
                ),
            },
            InboundFrame::Command(Command::Register { .. }) => {
                self.reply(ResultMessage::failure(MSG_ALREADY_REGISTERED));
            }
            InboundFrame::Command(Command::Unrecognized(command)) => {
                tracing::warn!(
                    listener = %session.name(),
                    command = %command,
                    "Unrecognized command"
                );
                self.reply(ResultMessage::failure(MSG_UNRECOGNIZED_COMMAND));
            }
        }
        Step::Continue
    }

    /// Deregister and release the outbound channel
    pub(crate) async fn close(self) {
        if let ConnectionState::Registered(session) = self.state {
            self.registry.remove_by_connection(session.id()).await;
            session.close();
        }
    }
}

/// Drive an authorized listener WebSocket until it closes
pub(crate) async fn handle_socket(
    socket: WebSocket,
    remote_addr: IpAddr,
    registry: Arc<ListenerRegistry>,
) {
    tracing::info!(remote = %remote_addr, "Connection from listener");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Single writer: replies and relayed actions share this queue
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!(remote = %remote_addr, "WebSocket write failed: {}", e);
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let mut connection = Connection::new(remote_addr, registry, tx);

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    connection.reply(ResultMessage::failure(MSG_MALFORMED));
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(remote = %remote_addr, "WebSocket read failed: {}", e);
                break;
            }
        };

        if connection.handle_frame(&text).await == Step::Close {
            break;
        }
    }

    let name = connection.session().map(|s| s.name().to_string());
    connection.close().await;
    let _ = writer.await;

    tracing::info!(
        remote = %remote_addr,
        listener = name.as_deref().unwrap_or("-"),
        "Listener disconnected"
    );
}

/// Tell an unauthorized peer why it is being dropped, then close
pub(crate) async fn reject_socket(mut socket: WebSocket, remote_addr: IpAddr) {
    tracing::warn!(remote = %remote_addr, "Unauthorized listener token");
    if let Ok(text) = encode(&ResultMessage::failure(MSG_UNAUTHORIZED)) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;

    // Let the peer read the reply and finish the close handshake
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = socket.recv().await {}
    })
    .await;
}
