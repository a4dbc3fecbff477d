//! Local action table and execution

use crate::config::ActionEntry;
use crate::error::{Error, Result};
use crate::protocol::{RelayedAction, ResultMessage, MSG_INVALID_TOKEN, MSG_UNKNOWN_ACTION};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Runs a configured action
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute the action; an `Err` is reported back to the dispatcher
    async fn execute(&self, action: &ActionEntry) -> Result<()>;
}

/// Executes actions through `sh -c`
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

#[async_trait]
impl ActionExecutor for ShellExecutor {
    async fn execute(&self, action: &ActionEntry) -> Result<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&action.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Action(format!("Cannot start '{}': {}", action.name, e)))?;

        if output.status.success() {
            tracing::debug!(
                action = %action.name,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "Action finished"
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            Err(Error::Action(output.status.to_string()))
        } else {
            Err(Error::Action(stderr))
        }
    }
}

/// Actions this listener hosts, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    entries: Vec<ActionEntry>,
}

impl ActionTable {
    pub fn new(entries: Vec<ActionEntry>) -> Self {
        Self { entries }
    }

    /// Action names in declaration order, as advertised at registration
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ActionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Resolve a relayed action, checking its token
    pub fn authorize(&self, relayed: &RelayedAction) -> std::result::Result<&ActionEntry, &'static str> {
        let entry = self.get(&relayed.action).ok_or(MSG_UNKNOWN_ACTION)?;
        if entry.token != relayed.token {
            return Err(MSG_INVALID_TOKEN);
        }
        Ok(entry)
    }

    /// Handle one relayed action and build the reply envelope
    pub async fn handle(
        &self,
        relayed: &RelayedAction,
        executor: &dyn ActionExecutor,
    ) -> ResultMessage {
        let entry = match self.authorize(relayed) {
            Ok(entry) => entry,
            Err(reason) => {
                tracing::warn!(action = %relayed.action, "Refused relayed action: {}", reason);
                return ResultMessage::failure(reason);
            }
        };

        tracing::info!(action = %entry.name, "Running action");
        match executor.execute(entry).await {
            Ok(()) => ResultMessage::success(),
            Err(Error::Action(detail)) => {
                tracing::warn!(action = %entry.name, "Action failed: {}", detail);
                ResultMessage::failure(detail)
            }
            Err(e) => {
                tracing::warn!(action = %entry.name, "Action failed: {}", e);
                ResultMessage::failure(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn entry(name: &str, command: &str, token: &str) -> ActionEntry {
        ActionEntry {
            name: name.to_string(),
            command: command.to_string(),
            token: token.to_string(),
        }
    }

    fn relayed(action: &str, token: &str) -> RelayedAction {
        RelayedAction {
            action: action.to_string(),
            token: token.to_string(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn execute(&self, action: &ActionEntry) -> Result<()> {
            self.ran.lock().unwrap().push(action.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let table = ActionTable::new(vec![entry("ping", "true", "t1")]);
        let recorder = Recorder::default();

        let reply = table.handle(&relayed("ping", "t1"), &recorder).await;
        assert_eq!(reply, ResultMessage::success());
        assert_eq!(*recorder.ran.lock().unwrap(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_token_mismatch_does_not_run() {
        let table = ActionTable::new(vec![entry("ping", "true", "t1")]);
        let recorder = Recorder::default();

        let reply = table.handle(&relayed("ping", "nope"), &recorder).await;
        assert_eq!(reply, ResultMessage::failure(MSG_INVALID_TOKEN));
        assert!(recorder.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let table = ActionTable::new(vec![entry("ping", "true", "t1")]);
        let reply = table.handle(&relayed("deploy", "t1"), &Recorder::default()).await;
        assert_eq!(reply, ResultMessage::failure(MSG_UNKNOWN_ACTION));
    }

    #[test]
    fn test_names_keep_declaration_order() {
        let table = ActionTable::new(vec![entry("b", "true", "x"), entry("a", "true", "y")]);
        assert_eq!(table.names(), vec!["b".to_string(), "a".to_string()]);
        assert!(table.get("a").is_some());
        assert!(table.get("c").is_none());
    }

    #[tokio::test]
    async fn test_shell_success() {
        let reply = ActionTable::new(vec![entry("ok", "exit 0", "t")])
            .handle(&relayed("ok", "t"), &ShellExecutor)
            .await;
        assert!(reply.ok);
    }

    #[tokio::test]
    async fn test_shell_failure_reports_stderr() {
        let reply = ActionTable::new(vec![entry("bad", "echo boom >&2; exit 3", "t")])
            .handle(&relayed("bad", "t"), &ShellExecutor)
            .await;
        assert_eq!(reply, ResultMessage::failure("boom"));
    }

    #[tokio::test]
    async fn test_shell_failure_without_stderr() {
        let reply = ActionTable::new(vec![entry("bad", "exit 7", "t")])
            .handle(&relayed("bad", "t"), &ShellExecutor)
            .await;
        assert!(!reply.ok);
        assert!(reply.message.contains('7'));
    }
}
