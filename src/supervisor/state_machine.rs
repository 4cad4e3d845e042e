use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle status of a supervised instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Stopped
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

impl InstanceStatus {
    /// Statuses in which the instance owns a live process handle.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Running | InstanceStatus::Stopping
        )
    }

    /// Stopped and Crashed both accept `start`.
    pub fn can_start(self) -> bool {
        matches!(self, InstanceStatus::Stopped | InstanceStatus::Crashed)
    }

    pub fn can_transition(self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Crashed, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Crashed)
                // 정상 종료 코드로 스스로 내려간 경우
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Crashed, Stopped)
        )
    }

    /// Status after the process exits while in `self`.
    ///
    /// Any exit while stopping is expected. A clean exit while running is
    /// treated as a voluntary stop; everything else is a crash.
    pub fn after_exit(self, success: bool) -> InstanceStatus {
        match self {
            InstanceStatus::Stopping => InstanceStatus::Stopped,
            InstanceStatus::Running if success => InstanceStatus::Stopped,
            InstanceStatus::Running | InstanceStatus::Starting => InstanceStatus::Crashed,
            other => other,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

/// Tracks the current status and enforces the allowed edges.
#[derive(Debug, Default, Clone)]
pub struct StateMachine {
    status: InstanceStatus,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn transition(&mut self, to: InstanceStatus) -> Result<InstanceStatus, TransitionError> {
        if self.status.can_transition(to) {
            let from = self.status;
            self.status = to;
            Ok(from)
        } else {
            Err(TransitionError { from: self.status, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn valid_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.status(), Stopped);
        assert_eq!(sm.transition(Starting), Ok(Stopped));
        assert!(sm.transition(Running).is_ok());
        assert!(sm.transition(Stopping).is_ok());
        assert!(sm.transition(Stopped).is_ok());
    }

    #[test]
    fn crashed_accepts_start() {
        let mut sm = StateMachine::new();
        sm.transition(Starting).unwrap();
        sm.transition(Running).unwrap();
        sm.transition(Crashed).unwrap();
        assert!(sm.status().can_start());
        assert!(sm.transition(Starting).is_ok());
    }

    #[test]
    fn invalid_transition() {
        let mut sm = StateMachine::new();
        // Stopped -> Running 직행 불가
        let err = sm.transition(Running).unwrap_err();
        assert_eq!(err, TransitionError { from: Stopped, to: Running });
        assert_eq!(sm.status(), Stopped);
        assert!(!Stopping.can_transition(Starting));
    }

    #[test]
    fn exit_outcomes() {
        assert_eq!(Stopping.after_exit(false), Stopped);
        assert_eq!(Running.after_exit(true), Stopped);
        assert_eq!(Running.after_exit(false), Crashed);
        assert_eq!(Starting.after_exit(true), Crashed);
    }

    #[test]
    fn process_presence() {
        assert!(!Stopped.has_process());
        assert!(!Crashed.has_process());
        assert!(Starting.has_process() && Running.has_process() && Stopping.has_process());
        assert_eq!(Running.to_string(), "running");
    }
}
