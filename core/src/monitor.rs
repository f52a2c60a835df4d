use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor receiver has been dropped")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Receives execution events. Calls are made inline from step tasks, so
/// implementations must not block. Errors are logged and otherwise ignored.
pub trait Monitor: Send + Sync {
    fn workflow_started(&self, _workflow: &str, _target: &str) -> Result<(), MonitorError> {
        Ok(())
    }

    fn workflow_completed(
        &self,
        _workflow: &str,
        _target: &str,
        _duration: Duration,
        _error: Option<&str>,
    ) -> Result<(), MonitorError> {
        Ok(())
    }

    fn step_executed(
        &self,
        _workflow: &str,
        _step: &str,
        _step_type: &str,
        _duration: Duration,
        _error: Option<&str>,
    ) -> Result<(), MonitorError> {
        Ok(())
    }

    fn tool_executed(
        &self,
        _tool: &str,
        _args: &[String],
        _duration: Duration,
        _error: Option<&str>,
    ) -> Result<(), MonitorError> {
        Ok(())
    }
}

/// Used when nothing is listening.
#[derive(Default, Clone, Copy)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {}

impl fmt::Debug for NoopMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoopMonitor")
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn workflow_started(&self, workflow: &str, target: &str) -> Result<(), MonitorError> {
        tracing::info!(workflow, target, "workflow started");
        Ok(())
    }

    fn workflow_completed(
        &self,
        workflow: &str,
        target: &str,
        duration: Duration,
        error: Option<&str>,
    ) -> Result<(), MonitorError> {
        let elapsed_ms = duration.as_millis() as u64;
        match error {
            Some(error) => {
                tracing::warn!(workflow, target, elapsed_ms, error, "workflow finished with errors")
            }
            None => tracing::info!(workflow, target, elapsed_ms, "workflow completed"),
        }
        Ok(())
    }

    fn step_executed(
        &self,
        workflow: &str,
        step: &str,
        step_type: &str,
        duration: Duration,
        error: Option<&str>,
    ) -> Result<(), MonitorError> {
        let elapsed_ms = duration.as_millis() as u64;
        match error {
            Some(error) => {
                tracing::warn!(workflow, step, step_type, elapsed_ms, error, "step failed")
            }
            None => tracing::info!(workflow, step, step_type, elapsed_ms, "step finished"),
        }
        Ok(())
    }

    fn tool_executed(
        &self,
        tool: &str,
        args: &[String],
        duration: Duration,
        error: Option<&str>,
    ) -> Result<(), MonitorError> {
        tracing::debug!(
            tool,
            args = ?args,
            elapsed_ms = duration.as_millis() as u64,
            error,
            "tool executed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    WorkflowStarted {
        workflow: String,
        target: String,
    },
    WorkflowCompleted {
        workflow: String,
        target: String,
        duration: Duration,
        error: Option<String>,
    },
    StepExecuted {
        workflow: String,
        step: String,
        step_type: String,
        duration: Duration,
        error: Option<String>,
    },
    ToolExecuted {
        tool: String,
        args: Vec<String>,
        duration: Duration,
        error: Option<String>,
    },
}

/// Pushes every event onto an unbounded channel; sending never blocks.
#[derive(Debug, Clone)]
pub struct ChannelMonitor {
    sender: mpsc::UnboundedSender<MonitorEvent>,
}

impl ChannelMonitor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: MonitorEvent) -> Result<(), MonitorError> {
        self.sender.send(event).map_err(|_| MonitorError::Closed)
    }
}

impl Monitor for ChannelMonitor {
    fn workflow_started(&self, workflow: &str, target: &str) -> Result<(), MonitorError> {
        self.send(MonitorEvent::WorkflowStarted {
            workflow: workflow.to_string(),
            target: target.to_string(),
        })
    }

    fn workflow_completed(
        &self,
        workflow: &str,
        target: &str,
        duration: Duration,
        error: Option<&str>,
    ) -> Result<(), MonitorError> {
        self.send(MonitorEvent::WorkflowCompleted {
            workflow: workflow.to_string(),
            target: target.to_string(),
            duration,
            error: error.map(str::to_string),
        })
    }

    fn step_executed(
        &self,
        workflow: &str,
        step: &str,
        step_type: &str,
        duration: Duration,
        error: Option<&str>,
    ) -> Result<(), MonitorError> {
        self.send(MonitorEvent::StepExecuted {
            workflow: workflow.to_string(),
            step: step.to_string(),
            step_type: step_type.to_string(),
            duration,
            error: error.map(str::to_string),
        })
    }

    fn tool_executed(
        &self,
        tool: &str,
        args: &[String],
        duration: Duration,
        error: Option<&str>,
    ) -> Result<(), MonitorError> {
        self.send(MonitorEvent::ToolExecuted {
            tool: tool.to_string(),
            args: args.to_vec(),
            duration,
            error: error.map(str::to_string),
        })
    }
}

/// Logs a failed monitor call.
pub(crate) fn notify(event: &str, result: Result<(), MonitorError>) {
    if let Err(err) = result {
        tracing::warn!("monitor rejected {event} event: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_monitor_forwards_events() {
        let (monitor, mut events) = ChannelMonitor::new();
        monitor.workflow_started("recon", "example.com").unwrap();
        monitor
            .step_executed("recon", "ports", "naabu", Duration::from_millis(5), Some("boom"))
            .unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            MonitorEvent::WorkflowStarted {
                workflow: "recon".to_string(),
                target: "example.com".to_string(),
            }
        );
        match events.try_recv().unwrap() {
            MonitorEvent::StepExecuted { step, error, .. } => {
                assert_eq!(step, "ports");
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn closed_channel_is_reported() {
        let (monitor, events) = ChannelMonitor::new();
        drop(events);
        assert_eq!(
            monitor.tool_executed("nmap", &[], Duration::ZERO, None),
            Err(MonitorError::Closed)
        );
    }

    #[test]
    fn default_methods_accept_everything() {
        assert!(NoopMonitor.workflow_started("w", "t").is_ok());
        assert!(TracingMonitor
            .workflow_completed("w", "t", Duration::from_secs(1), None)
            .is_ok());
    }
}
