//! HTTP and WebSocket handlers of the dispatcher

use super::connection::{handle_socket, reject_socket};
use crate::registry::ListenerRegistry;
use crate::relay::{RelayDispatcher, RelayReport};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, Path, Request, State,
    },
    http::{header::HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const ALLOW_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept, Authorization";
const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const NOT_FOUND: &str = "Not found";

/// Shared state of the dispatcher handlers
#[derive(Clone)]
pub struct DispatcherState {
    pub registry: Arc<ListenerRegistry>,
    pub relay: Arc<RelayDispatcher>,
    pub token: Arc<str>,
}

/// Build the dispatcher router
pub fn dispatcher_router(state: DispatcherState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Clients pushing triggers
        .route("/triggers/:action/:token", get(trigger))
        .route("/actions/:action/:token", get(trigger))
        // Listeners connecting to us
        .route("/ws/:token", get(ws_upgrade))
        .route("/status/:token", get(status))
        .fallback(fallback)
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Allow-all CORS: browser callers from any origin may fire triggers.
///
/// Any `OPTIONS` request is answered directly with `200`.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        preflight_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

fn preflight_response() -> Response {
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOW_METHODS),
    );
    response
}

async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        return preflight_response();
    }
    (StatusCode::NOT_FOUND, NOT_FOUND).into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Relay a trigger and answer with the last listener's outcome
async fn trigger(
    State(state): State<DispatcherState>,
    Path((action, token)): Path<(String, String)>,
) -> Response {
    let report = state.relay.relay(&action, &token).await;
    match report.last() {
        // Failed relays are still answered 200; the body carries `ok:false`
        Some(delivery) => Json(delivery.outcome.to_result()).into_response(),
        None => {
            debug_assert!(matches!(report, RelayReport::NotFound));
            (StatusCode::NOT_FOUND, NOT_FOUND).into_response()
        }
    }
}

/// Upgrade a listener connection
async fn ws_upgrade(
    State(state): State<DispatcherState>,
    Path(token): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::debug!(remote = %remote, "Rejected non-upgrade request: {}", rejection);
            return (StatusCode::UPGRADE_REQUIRED, "Upgrade required").into_response();
        }
    };

    let authorized = token.as_str() == &*state.token;
    let registry = state.registry.clone();
    let remote_ip = remote.ip();
    ws.on_upgrade(move |socket| async move {
        if authorized {
            handle_socket(socket, remote_ip, registry).await;
        } else {
            reject_socket(socket, remote_ip).await;
        }
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    listeners: Vec<crate::registry::SessionInfo>,
}

/// Registry snapshot, guarded by the shared secret
async fn status(State(state): State<DispatcherState>, Path(token): Path<String>) -> Response {
    if token.as_str() != &*state.token {
        return (StatusCode::NOT_FOUND, NOT_FOUND).into_response();
    }
    Json(StatusResponse {
        listeners: state.registry.describe().await,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusyPolicy;
    use crate::registry::ListenerSession;
    use axum::body::Body;
    use axum::http::Request;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tower::ServiceExt;

    fn make_state() -> DispatcherState {
        let registry = Arc::new(ListenerRegistry::new());
        let relay = Arc::new(RelayDispatcher::new(
            registry.clone(),
            Duration::from_secs(1),
            BusyPolicy::Queue,
        ));
        DispatcherState {
            registry,
            relay,
            token: Arc::from("secret"),
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_trigger_not_found() {
        let app = dispatcher_router(make_state());
        let response = app.oneshot(get("/triggers/deploy/TOK")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            HeaderValue::from_static("*")
        );
        assert_eq!(body_string(response).await, "Not found");
    }

    #[tokio::test]
    async fn test_actions_alias_not_found() {
        let app = dispatcher_router(make_state());
        let response = app.oneshot(get("/actions/deploy/TOK")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_options_is_always_ok() {
        for uri in ["/triggers/deploy/TOK", "/anything/else", "/"] {
            let app = dispatcher_router(make_state());
            let request = Request::builder()
                .method(Method::OPTIONS)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "OPTIONS {}", uri);
            let headers = response.headers();
            assert_eq!(headers["access-control-allow-origin"], "*");
            assert_eq!(headers["access-control-allow-methods"], ALLOW_METHODS);
            assert_eq!(headers["access-control-allow-headers"], ALLOW_HEADERS);
        }
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let app = dispatcher_router(make_state());
        let mut request = get("/ws/secret");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn test_status_requires_token() {
        let state = make_state();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state
            .registry
            .insert(Arc::new(ListenerSession::new(
                "svc1",
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                vec!["deploy".to_string()],
                tx,
            )))
            .await
            .unwrap();

        let app = dispatcher_router(state.clone());
        let response = app.oneshot(get("/status/wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let app = dispatcher_router(state);
        let response = app.oneshot(get("/status/secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["listeners"][0]["name"], "svc1");
        assert_eq!(json["listeners"][0]["actions"][0]["name"], "deploy");
    }

    #[tokio::test]
    async fn test_failed_relay_is_still_ok() {
        let state = make_state();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let session = Arc::new(ListenerSession::new(
            "svc1",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            vec!["deploy".to_string()],
            tx,
        ));
        state.registry.insert(session.clone()).await.unwrap();
        session.close();

        let app = dispatcher_router(state);
        let response = app.oneshot(get("/triggers/deploy/TOK")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["ok"], false);
        assert!(json["message"].as_str().unwrap().contains("closed"));
    }
}
