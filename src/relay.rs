//! HTTP trigger to listener relay
//!
//! A trigger is delivered to **every** listener advertising the action, one
//! after the other in registry order. The caller sees the outcome of the last
//! listener processed; earlier outcomes are only logged. This is the
//! documented fan-out policy, not an aggregation.

use crate::config::{BusyPolicy, DispatcherConfig};
use crate::protocol::{RelayedAction, ResultMessage};
use crate::registry::ListenerRegistry;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of relaying to a single listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The listener answered
    Delivered(ResultMessage),
    /// Another relay was in flight and the busy policy is `reject`
    ListenerBusy,
    /// No answer within the relay timeout
    TimedOut,
    /// The connection was lost before an answer arrived
    Disconnected(String),
}

impl RelayOutcome {
    /// Whether the listener reported success
    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Delivered(result) if result.ok)
    }

    /// Result envelope to surface to the HTTP caller
    pub fn to_result(&self) -> ResultMessage {
        match self {
            RelayOutcome::Delivered(result) => result.clone(),
            RelayOutcome::ListenerBusy => ResultMessage::failure("Listener busy"),
            RelayOutcome::TimedOut => ResultMessage::failure("Timed out waiting for the listener"),
            RelayOutcome::Disconnected(reason) => ResultMessage::failure(reason.clone()),
        }
    }
}

/// Relay result for one matched listener
#[derive(Debug, Clone)]
pub struct Delivery {
    pub listener: String,
    pub remote_addr: IpAddr,
    pub outcome: RelayOutcome,
}

/// Result of a trigger
#[derive(Debug, Clone)]
pub enum RelayReport {
    /// No listener advertises the action
    NotFound,
    /// One delivery per matched listener, in processing order
    Relayed(Vec<Delivery>),
}

impl RelayReport {
    /// The delivery surfaced to the caller (last processed)
    pub fn last(&self) -> Option<&Delivery> {
        match self {
            RelayReport::NotFound => None,
            RelayReport::Relayed(deliveries) => deliveries.last(),
        }
    }
}

/// Relays triggers to registered listeners
pub struct RelayDispatcher {
    registry: Arc<ListenerRegistry>,
    timeout: Duration,
    busy_policy: BusyPolicy,
}

impl RelayDispatcher {
    /// Create a relay dispatcher
    pub fn new(registry: Arc<ListenerRegistry>, timeout: Duration, busy_policy: BusyPolicy) -> Self {
        Self {
            registry,
            timeout,
            busy_policy,
        }
    }

    /// Create a relay dispatcher from dispatcher settings
    pub fn from_config(registry: Arc<ListenerRegistry>, config: &DispatcherConfig) -> Self {
        Self::new(registry, config.relay_timeout(), config.busy_policy)
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Relay `action` with the caller's `token` to every matching listener
    pub async fn relay(&self, action: &str, token: &str) -> RelayReport {
        let matches = self.registry.find_by_action(action).await;
        if matches.is_empty() {
            tracing::info!(action = %action, "No listener for action");
            return RelayReport::NotFound;
        }

        let relayed = RelayedAction {
            action: action.to_string(),
            token: token.to_string(),
        };

        let mut deliveries = Vec::with_capacity(matches.len());
        for session in matches {
            tracing::info!(
                action = %action,
                listener = %session.name(),
                remote = %session.remote_addr(),
                "Relaying action"
            );

            // Updates the action status once the listener's slot is held
            let outcome = session
                .exchange(&relayed, self.busy_policy, self.timeout)
                .await;

            match &outcome {
                RelayOutcome::Delivered(result) => tracing::info!(
                    action = %action,
                    listener = %session.name(),
                    ok = result.ok,
                    message = %result.message,
                    "Listener replied"
                ),
                other => tracing::warn!(
                    action = %action,
                    listener = %session.name(),
                    outcome = ?other,
                    "Relay failed"
                ),
            }

            deliveries.push(Delivery {
                listener: session.name().to_string(),
                remote_addr: session.remote_addr(),
                outcome,
            });
        }

        RelayReport::Relayed(deliveries)
    }
}
