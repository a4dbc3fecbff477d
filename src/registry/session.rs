//! A registered listener connection

use crate::config::BusyPolicy;
use crate::error::{Error, Result};
use crate::protocol::{encode, RelayedAction, ResultMessage};
use crate::relay::RelayOutcome;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;

/// Per-action dispatch status, tracked for observability only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Never relayed, or waiting for the next trigger
    Idle,
    /// A relay is in flight
    Dispatching,
    /// Last relay reported success
    Succeeded,
    /// Last relay failed, timed out or lost the connection
    Failed,
}

/// Action advertised by a listener, with its current status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvertisedAction {
    pub name: String,
    pub status: ActionStatus,
}

/// Serializable view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub remote_addr: IpAddr,
    pub connected_at: i64,
    pub busy: bool,
    pub actions: Vec<AdvertisedAction>,
}

/// What happened to a result frame handed to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRouting {
    /// Delivered to the pending relay
    Routed,
    /// Late answer to a relay that already timed out
    Discarded,
    /// No relay was waiting
    Unsolicited,
}

#[derive(Default)]
struct ReplySlot {
    waiter: Option<oneshot::Sender<ResultMessage>>,
    /// Replies still owed for relays that gave up waiting
    stale: usize,
}

/// A listener bound to one WebSocket connection.
///
/// Writes go through `outbound`, which feeds the connection's single writer
/// task. Replies are read by the connection task and handed over through
/// `deliver_result`. At most one relay is in flight at a time.
pub struct ListenerSession {
    id: String,
    name: String,
    remote_addr: IpAddr,
    connected_at: i64,
    actions: Vec<String>,
    /// Parallel to `actions`
    statuses: RwLock<Vec<ActionStatus>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reply: Mutex<ReplySlot>,
    in_flight: tokio::sync::Mutex<()>,
}

impl ListenerSession {
    /// Create a session with every action `Idle`
    pub fn new(
        name: impl Into<String>,
        remote_addr: IpAddr,
        actions: Vec<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        let statuses = vec![ActionStatus::Idle; actions.len()];
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            remote_addr,
            connected_at: chrono::Utc::now().timestamp_millis(),
            actions,
            statuses: RwLock::new(statuses),
            outbound: Mutex::new(Some(outbound)),
            reply: Mutex::new(ReplySlot::default()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Connection id, unique for the process lifetime
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    /// Advertised action names, in registration order
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// Whether this session advertises `action`
    pub fn advertises(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }

    /// Whether a relay currently holds the in-flight slot
    pub fn is_busy(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Whether the outbound channel has been closed
    pub fn is_closed(&self) -> bool {
        lock(&self.outbound).is_none()
    }

    /// Update the status of every entry named `action`
    pub async fn set_status(&self, action: &str, status: ActionStatus) {
        let mut statuses = self.statuses.write().await;
        for (name, slot) in self.actions.iter().zip(statuses.iter_mut()) {
            if name == action {
                *slot = status;
            }
        }
    }

    /// Current action statuses
    pub async fn action_statuses(&self) -> Vec<AdvertisedAction> {
        let statuses = self.statuses.read().await;
        self.actions
            .iter()
            .zip(statuses.iter())
            .map(|(name, status)| AdvertisedAction {
                name: name.clone(),
                status: *status,
            })
            .collect()
    }

    /// Snapshot for the status endpoint
    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            remote_addr: self.remote_addr,
            connected_at: self.connected_at,
            busy: self.is_busy(),
            actions: self.action_statuses().await,
        }
    }

    /// Queue a text frame for the writer task
    pub fn send(&self, text: String) -> Result<()> {
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| Error::Transport("Listener connection closed".to_string())),
            None => Err(Error::Transport("Listener connection closed".to_string())),
        }
    }

    /// Hand a result frame read from the connection to the pending relay
    pub fn deliver_result(&self, result: ResultMessage) -> ReplyRouting {
        let mut slot = lock(&self.reply);
        if slot.stale > 0 {
            slot.stale -= 1;
            return ReplyRouting::Discarded;
        }
        match slot.waiter.take() {
            Some(waiter) => {
                // The relay may have been cancelled together with its HTTP request
                let _ = waiter.send(result);
                ReplyRouting::Routed
            }
            None => ReplyRouting::Unsolicited,
        }
    }

    /// Close the outbound channel and fail any pending relay.
    ///
    /// Returns `true` only for the call that actually closed the channel.
    pub fn close(&self) -> bool {
        let closed = lock(&self.outbound).take().is_some();
        lock(&self.reply).waiter.take();
        closed
    }

    /// Write `relayed` to the listener and wait for its result.
    ///
    /// The in-flight slot is held for the whole exchange so concurrent relays
    /// never interleave on the wire. `timeout` bounds the slot wait and the
    /// reply wait together. The action status moves to `Dispatching` only once
    /// the slot is held; a relay that never gets the slot leaves it untouched.
    pub async fn exchange(
        &self,
        relayed: &RelayedAction,
        policy: BusyPolicy,
        timeout: Duration,
    ) -> RelayOutcome {
        let deadline = Instant::now() + timeout;

        let _guard = match policy {
            BusyPolicy::Queue => {
                match tokio::time::timeout_at(deadline, self.in_flight.lock()).await {
                    Ok(guard) => guard,
                    Err(_) => return RelayOutcome::TimedOut,
                }
            }
            BusyPolicy::Reject => match self.in_flight.try_lock() {
                Ok(guard) => guard,
                Err(_) => return RelayOutcome::ListenerBusy,
            },
        };

        self.set_status(&relayed.action, ActionStatus::Dispatching).await;
        let outcome = self.write_and_wait(relayed, deadline).await;
        let status = if outcome.is_success() {
            ActionStatus::Succeeded
        } else {
            ActionStatus::Failed
        };
        self.set_status(&relayed.action, status).await;
        outcome
    }

    /// Send under the in-flight slot and wait for the reply until `deadline`
    async fn write_and_wait(&self, relayed: &RelayedAction, deadline: Instant) -> RelayOutcome {
        let payload = match encode(relayed) {
            Ok(payload) => payload,
            Err(e) => return RelayOutcome::Disconnected(e.to_string()),
        };

        let (tx, mut rx) = oneshot::channel();
        lock(&self.reply).waiter = Some(tx);

        if let Err(e) = self.send(payload) {
            lock(&self.reply).waiter.take();
            return RelayOutcome::Disconnected(e.to_string());
        }

        let mut pending = PendingReply {
            session: self,
            armed: true,
        };
        let received = tokio::time::timeout_at(deadline, &mut rx).await;
        pending.armed = false;

        match received {
            Ok(Ok(result)) => RelayOutcome::Delivered(result),
            Ok(Err(_)) => RelayOutcome::Disconnected("Listener disconnected".to_string()),
            Err(_) => {
                let mut slot = lock(&self.reply);
                if slot.waiter.take().is_some() {
                    slot.stale += 1;
                    RelayOutcome::TimedOut
                } else {
                    // The reply raced the deadline
                    drop(slot);
                    match rx.try_recv() {
                        Ok(result) => RelayOutcome::Delivered(result),
                        Err(_) => {
                            RelayOutcome::Disconnected("Listener disconnected".to_string())
                        }
                    }
                }
            }
        }
    }
}

/// Marks the reply as stale if the exchange is dropped while waiting,
/// e.g. when the HTTP caller goes away.
struct PendingReply<'a> {
    session: &'a ListenerSession,
    armed: bool,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = lock(&self.session.reply);
            if slot.waiter.take().is_some() {
                slot.stale += 1;
            }
        }
    }
}

impl std::fmt::Debug for ListenerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("remote_addr", &self.remote_addr)
            .field("actions", &self.actions)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn make_session(actions: &[&str]) -> (Arc<ListenerSession>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actions = actions.iter().map(|a| a.to_string()).collect();
        (Arc::new(ListenerSession::new("svc1", LOCALHOST, actions, tx)), rx)
    }

    fn relayed(action: &str) -> RelayedAction {
        RelayedAction {
            action: action.to_string(),
            token: "t1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let (session, _rx) = make_session(&["deploy", "restart"]);
        assert!(session.advertises("deploy"));
        assert!(!session.advertises("build"));
        assert!(!session.is_busy());
        let statuses = session.action_statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|a| a.status == ActionStatus::Idle));
    }

    #[tokio::test]
    async fn test_set_status() {
        let (session, _rx) = make_session(&["deploy", "restart"]);
        session.set_status("deploy", ActionStatus::Succeeded).await;
        let statuses = session.action_statuses().await;
        assert_eq!(statuses[0].status, ActionStatus::Succeeded);
        assert_eq!(statuses[1].status, ActionStatus::Idle);
    }

    #[tokio::test]
    async fn test_exchange_delivers_reply() {
        let (session, mut rx) = make_session(&["deploy"]);

        let responder = session.clone();
        let task = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame, r#"{"action":"deploy","token":"t1"}"#);
            assert_eq!(
                responder.deliver_result(ResultMessage::success()),
                ReplyRouting::Routed
            );
        });

        let outcome = session
            .exchange(&relayed("deploy"), BusyPolicy::Queue, Duration::from_secs(5))
            .await;
        assert_eq!(outcome, RelayOutcome::Delivered(ResultMessage::success()));
        task.await.unwrap();
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_exchange_times_out_and_discards_late_reply() {
        let (session, mut rx) = make_session(&["deploy"]);

        let outcome = session
            .exchange(&relayed("deploy"), BusyPolicy::Queue, Duration::from_millis(50))
            .await;
        assert_eq!(outcome, RelayOutcome::TimedOut);
        assert!(rx.recv().await.is_some());
        assert_eq!(
            session.action_statuses().await[0].status,
            ActionStatus::Failed
        );

        // The late answer must not be attributed to the next relay
        assert_eq!(
            session.deliver_result(ResultMessage::failure("late")),
            ReplyRouting::Discarded
        );
        assert_eq!(
            session.deliver_result(ResultMessage::success()),
            ReplyRouting::Unsolicited
        );
    }

    #[tokio::test]
    async fn test_cancelled_exchange_marks_reply_stale() {
        let (session, mut rx) = make_session(&["deploy"]);

        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .exchange(&relayed("deploy"), BusyPolicy::Queue, Duration::from_secs(5))
                    .await
            })
        };
        rx.recv().await.unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(
            session.deliver_result(ResultMessage::success()),
            ReplyRouting::Discarded
        );
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_exchange_on_closed_session() {
        let (session, _rx) = make_session(&["deploy"]);
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());

        let outcome = session
            .exchange(&relayed("deploy"), BusyPolicy::Queue, Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, RelayOutcome::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_exchange() {
        let (session, mut rx) = make_session(&["deploy"]);

        let closer = session.clone();
        tokio::spawn(async move {
            rx.recv().await.unwrap();
            closer.close();
        });

        let outcome = session
            .exchange(&relayed("deploy"), BusyPolicy::Queue, Duration::from_secs(5))
            .await;
        assert!(matches!(outcome, RelayOutcome::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_reject_policy_when_busy() {
        let (session, mut rx) = make_session(&["deploy"]);

        let first = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .exchange(&relayed("deploy"), BusyPolicy::Reject, Duration::from_secs(5))
                    .await
            })
        };

        // Wait until the first relay is on the wire
        rx.recv().await.unwrap();
        assert!(session.is_busy());

        let second = session
            .exchange(&relayed("deploy"), BusyPolicy::Reject, Duration::from_secs(5))
            .await;
        assert_eq!(second, RelayOutcome::ListenerBusy);
        // The rejected relay does not touch the in-flight relay's status
        assert_eq!(
            session.action_statuses().await[0].status,
            ActionStatus::Dispatching
        );

        session.deliver_result(ResultMessage::success());
        assert_eq!(
            first.await.unwrap(),
            RelayOutcome::Delivered(ResultMessage::success())
        );
        assert_eq!(
            session.action_statuses().await[0].status,
            ActionStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_queue_policy_serializes_exchanges() {
        let (session, mut rx) = make_session(&["a", "b"]);

        let spawn_exchange = |action: &'static str| {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .exchange(&relayed(action), BusyPolicy::Queue, Duration::from_secs(5))
                    .await
            })
        };
        let first = spawn_exchange("a");
        let second = spawn_exchange("b");

        for _ in 0..2 {
            let frame = rx.recv().await.unwrap();
            // Only one relay may be on the wire at a time
            assert!(rx.try_recv().is_err());
            let action: RelayedAction = serde_json::from_str(&frame).unwrap();
            session.deliver_result(ResultMessage::failure(action.action));
        }

        assert_eq!(
            first.await.unwrap(),
            RelayOutcome::Delivered(ResultMessage::failure("a"))
        );
        assert_eq!(
            second.await.unwrap(),
            RelayOutcome::Delivered(ResultMessage::failure("b"))
        );
    }
}
