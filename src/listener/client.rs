//! Listener session: dial, register, serve relayed actions

use super::actions::{ActionExecutor, ActionTable, ShellExecutor};
use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::protocol::{decode_listener_frame, encode, ListenerFrame, ListenerMessage};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Why a connected session ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown was requested; the close handshake has been attempted
    Interrupted,
    /// The transport failed or the dispatcher closed it
    ConnectionLost(String),
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_BACKOFF)
}

/// Outbound-connecting listener
pub struct ListenerClient {
    config: ListenerConfig,
    table: Arc<ActionTable>,
    executor: Arc<dyn ActionExecutor>,
}

impl ListenerClient {
    /// Create a listener running its actions through the shell
    pub fn new(config: ListenerConfig) -> Result<Self> {
        config.validate()?;
        let table = Arc::new(ActionTable::new(config.actions.clone()));
        Ok(Self {
            config,
            table,
            executor: Arc::new(ShellExecutor),
        })
    }

    /// Replace the action executor
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn table(&self) -> &ActionTable {
        &self.table
    }

    /// Run until ctrl-c
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` resolves.
    ///
    /// The first dial and registration must succeed. A lost connection is
    /// fatal unless `reconnect` is enabled, in which case the listener redials
    /// with exponential backoff and registers again.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ws = self.connect().await?;
        loop {
            let reason = match self.serve(ws, shutdown.as_mut()).await {
                SessionEnd::Interrupted => return Ok(()),
                SessionEnd::ConnectionLost(reason) => reason,
            };

            if !self.config.reconnect {
                return Err(Error::Transport(format!("Connection lost: {}", reason)));
            }
            tracing::warn!(listener = %self.config.name, "Connection lost: {}", reason);

            ws = match self.reconnect(shutdown.as_mut()).await {
                Some(ws) => ws,
                None => return Ok(()),
            };
        }
    }

    /// Redial until registered again; `None` if shutdown came first
    async fn reconnect<F>(&self, mut shutdown: Pin<&mut F>) -> Option<WsStream>
    where
        F: Future<Output = ()>,
    {
        let mut delay = INITIAL_BACKOFF;
        loop {
            tracing::info!(
                listener = %self.config.name,
                "Reconnecting in {}s",
                delay.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.as_mut() => return None,
            }

            let attempt = tokio::select! {
                attempt = self.connect() => attempt,
                _ = shutdown.as_mut() => return None,
            };
            match attempt {
                Ok(ws) => return Some(ws),
                Err(e) => {
                    tracing::warn!(listener = %self.config.name, "Reconnect failed: {}", e);
                    delay = next_backoff(delay);
                }
            }
        }
    }

    /// Dial the dispatcher and complete the registration handshake
    async fn connect(&self) -> Result<WsStream> {
        tracing::info!(
            listener = %self.config.name,
            dispatcher = %self.config.dispatcher_host,
            "Connecting to dispatcher"
        );
        let (mut ws, _response) = connect_async(self.config.websocket_url()).await?;
        self.register(&mut ws).await?;
        tracing::info!(
            listener = %self.config.name,
            actions = ?self.table.names(),
            "Registered with dispatcher"
        );
        Ok(ws)
    }

    async fn register(&self, ws: &mut WsStream) -> Result<()> {
        let envelope = ListenerMessage::register(self.config.name.clone(), self.table.names());
        ws.send(Message::Text(encode(&envelope)?)).await?;

        let reply = tokio::time::timeout(REGISTER_TIMEOUT, next_text(ws))
            .await
            .map_err(|_| Error::Registration("No reply to the registration".to_string()))??;

        match decode_listener_frame(&reply)? {
            ListenerFrame::Result(result) if result.ok => Ok(()),
            ListenerFrame::Result(result) => Err(Error::Registration(result.message)),
            ListenerFrame::Relay(_) => Err(Error::Protocol(
                "Relayed action received before the registration reply".to_string(),
            )),
        }
    }

    /// Serve one registered connection until it ends or shutdown fires
    async fn serve<F>(&self, mut ws: WsStream, shutdown: Pin<&mut F>) -> SessionEnd
    where
        F: Future<Output = ()>,
    {
        let lost = {
            let receive = self.receive_loop(&mut ws);
            tokio::pin!(receive);
            tokio::select! {
                reason = &mut receive => Some(reason),
                _ = shutdown => None,
            }
        };

        match lost {
            Some(reason) => SessionEnd::ConnectionLost(reason),
            None => {
                tracing::info!(listener = %self.config.name, "Interrupted, closing the connection");
                self.close_gracefully(ws).await;
                SessionEnd::Interrupted
            }
        }
    }

    /// Single reader: returns the reason the connection was lost
    async fn receive_loop(&self, ws: &mut WsStream) -> String {
        loop {
            let text = match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!("Ignoring non UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            format!("Dispatcher closed the connection: {}", frame.reason)
                        }
                        _ => "Dispatcher closed the connection".to_string(),
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return e.to_string(),
                None => return "Connection closed".to_string(),
            };

            let relayed = match decode_listener_frame(&text) {
                Ok(ListenerFrame::Relay(relayed)) => relayed,
                Ok(ListenerFrame::Result(result)) => {
                    tracing::debug!(ok = result.ok, message = %result.message, "Dispatcher reply");
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Ignoring undecodable frame: {}", e);
                    continue;
                }
            };

            let reply = self.table.handle(&relayed, self.executor.as_ref()).await;
            let payload = match encode(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(action = %relayed.action, "Cannot encode reply: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws.send(Message::Text(payload)).await {
                return e.to_string();
            }
        }
    }

    /// Send a Close frame and wait up to the grace period for the peer
    async fn close_gracefully(&self, mut ws: WsStream) {
        let grace = self.config.close_grace();
        let closing = async {
            if let Err(e) = ws.close(None).await {
                tracing::debug!("Close frame not sent: {}", e);
                return;
            }
            while let Some(message) = ws.next().await {
                if message.is_err() {
                    break;
                }
            }
        };

        if tokio::time::timeout(grace, closing).await.is_err() {
            tracing::debug!("Close handshake did not finish within {:?}", grace);
        }
    }
}

/// Next text payload, skipping control frames
async fn next_text(ws: &mut WsStream) -> Result<String> {
    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => return Ok(text),
            Message::Binary(data) => {
                return String::from_utf8(data)
                    .map_err(|_| Error::Protocol("Non UTF-8 binary frame".to_string()))
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(Error::Transport(
        "Connection closed by the dispatcher".to_string(),
    ))
}
