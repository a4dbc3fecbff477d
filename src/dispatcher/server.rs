//! Dispatcher server implementation

use super::handler::{dispatcher_router, DispatcherState};
use crate::config::{BusyPolicy, DispatcherConfig};
use crate::error::{Error, Result};
use crate::registry::ListenerRegistry;
use crate::relay::RelayDispatcher;
use crate::tls::load_server_config;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::Service;

/// Triggerhub dispatcher: registry, relay and HTTP surface
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<ListenerRegistry>,
    relay: Arc<RelayDispatcher>,
}

impl Dispatcher {
    /// Create a dispatcher; fails if the configuration cannot be served
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ListenerRegistry::new());
        let relay = Arc::new(RelayDispatcher::from_config(registry.clone(), &config));

        Ok(Self {
            config,
            registry,
            relay,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Get the listener registry
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Get the relay dispatcher
    pub fn relay(&self) -> &Arc<RelayDispatcher> {
        &self.relay
    }

    /// Build the HTTP router
    pub fn router(&self) -> Router {
        dispatcher_router(DispatcherState {
            registry: self.registry.clone(),
            relay: self.relay.clone(),
            token: Arc::from(self.config.token.as_str()),
        })
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Transport(format!("Cannot bind {}: {}", addr, e)))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_on<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        let app = self.router();

        if self.config.tls_enabled {
            // validate() guarantees both paths are set
            let (cert, key) = match (&self.config.tls_cert, &self.config.tls_key) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    return Err(Error::Config(
                        "The certificate and key file are needed to run with TLS enabled"
                            .to_string(),
                    ))
                }
            };
            let acceptor = TlsAcceptor::from(load_server_config(cert, key)?);
            tracing::info!("Listening TLS on {}", local);
            serve_tls(listener, acceptor, app, shutdown).await
        } else {
            tracing::info!("Listening HTTP on {}", local);
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await?;
            Ok(())
        }
    }
}

/// Accept loop for TLS connections.
///
/// Each accepted socket gets its own task for the handshake and the HTTP
/// connection, so a slow client cannot stall the loop.
async fn serve_tls<F>(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::pin!(shutdown);

    loop {
        let (tcp, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let app = app.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(remote = %remote, "TLS handshake failed: {}", e);
                    return;
                }
            };

            let hyper_service =
                hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
                    request.extensions_mut().insert(ConnectInfo(remote));
                    app.clone().call(request)
                });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), hyper_service)
                .await
            {
                tracing::debug!(remote = %remote, "Connection error: {}", e);
            }
        });
    }

    tracing::info!("Dispatcher stopped accepting connections");
    Ok(())
}

/// Builder for Dispatcher
pub struct DispatcherBuilder {
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the bind host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the shared secret
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Enable TLS with the given PEM files
    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.tls_enabled = true;
        self.config.tls_cert = Some(cert.into());
        self.config.tls_key = Some(key.into());
        self
    }

    /// Set the relay timeout in seconds
    pub fn relay_timeout_secs(mut self, secs: u64) -> Self {
        self.config.relay_timeout_secs = secs;
        self
    }

    /// Set the busy policy
    pub fn busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.config.busy_policy = policy;
        self
    }

    /// Build the dispatcher
    pub fn build(self) -> Result<Dispatcher> {
        Dispatcher::new(self.config)
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
