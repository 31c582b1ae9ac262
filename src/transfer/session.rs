//! Transfer session state
//!
//! Ephemeral per-call state owned by the task handling one upload or download.
//! Nothing here is persisted; the backend is the only durable state.

use log::debug;

use crate::error::Operation;

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingName,
    Streaming,
    Completing,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    fn can_advance_to(&self, next: Phase) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Phase::Failed) => true,
            (Phase::AwaitingName, Phase::Streaming) => true,
            (Phase::Streaming, Phase::Completing) => true,
            (Phase::Completing, Phase::Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct TransferSession {
    operation: Operation,
    filename: String,
    phase: Phase,
}

impl TransferSession {
    pub fn new(operation: Operation, filename: impl Into<String>) -> Self {
        Self {
            operation,
            filename: filename.into(),
            phase: Phase::AwaitingName,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves to `next` if the transition is legal. Returns whether it happened.
    pub fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_advance_to(next) {
            debug!(
                "{} session for '{}' ignored transition {:?} -> {:?}",
                self.operation, self.filename, self.phase, next
            );
            return false;
        }
        debug!(
            "{} session for '{}': {:?} -> {:?}",
            self.operation, self.filename, self.phase, next
        );
        self.phase = next;
        true
    }

    pub fn fail(&mut self) {
        self.advance(Phase::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_happy_path() {
        let mut session = TransferSession::new(Operation::Upload, "a.txt");
        assert_eq!(session.phase(), Phase::AwaitingName);
        assert!(session.advance(Phase::Streaming));
        assert!(session.advance(Phase::Completing));
        assert!(session.advance(Phase::Done));
        assert!(session.phase().is_terminal());
    }

    #[test]
    fn cannot_skip_or_leave_terminal_phases() {
        let mut session = TransferSession::new(Operation::Download, "a.txt");
        assert!(!session.advance(Phase::Done));
        assert!(session.advance(Phase::Streaming));
        session.fail();
        assert_eq!(session.phase(), Phase::Failed);
        assert!(!session.advance(Phase::Completing));
        assert!(!session.advance(Phase::Failed));
        assert_eq!(session.phase(), Phase::Failed);
    }
}
