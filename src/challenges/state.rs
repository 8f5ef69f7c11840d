//! Per-realm challenge state machine.
//!
//! `Idle -> Challenged -> Submitting -> {Succeeded, Failed} -> Idle`. Every
//! cycle gets a number so late calls from a session of an earlier cycle are
//! rejected instead of corrupting the current one.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengePhase {
    Idle,
    Challenged,
    Submitting,
    Succeeded,
    Failed,
}

impl ChallengePhase {
    pub fn is_active(self) -> bool {
        !matches!(self, ChallengePhase::Idle)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChallengePhase::Succeeded | ChallengePhase::Failed)
    }
}

impl fmt::Display for ChallengePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChallengePhase::Idle => "idle",
            ChallengePhase::Challenged => "challenged",
            ChallengePhase::Submitting => "submitting",
            ChallengePhase::Succeeded => "succeeded",
            ChallengePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("realm '{realm}' cannot move from {from} to {to}")]
    Invalid {
        realm: String,
        from: ChallengePhase,
        to: ChallengePhase,
    },
    #[error("realm '{realm}' is on cycle {current}, not cycle {requested}")]
    StaleCycle {
        realm: String,
        current: u64,
        requested: u64,
    },
}

/// State of one realm's authentication dialogue.
#[derive(Debug, Clone)]
pub struct ChallengeStateMachine {
    realm: String,
    phase: ChallengePhase,
    cycle: u64,
    started_at: Option<Instant>,
}

impl ChallengeStateMachine {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            phase: ChallengePhase::Idle,
            cycle: 0,
            started_at: None,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn phase(&self) -> ChallengePhase {
        self.phase
    }

    /// Number of the current (or last finished) cycle. Zero before the first.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Time spent in the current cycle.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|started| started.elapsed())
    }

    /// `Idle -> Challenged`. Returns the new cycle number.
    pub fn begin(&mut self) -> Result<u64, TransitionError> {
        self.expect_phase(&[ChallengePhase::Idle], ChallengePhase::Challenged)?;
        self.cycle += 1;
        self.phase = ChallengePhase::Challenged;
        self.started_at = Some(Instant::now());
        Ok(self.cycle)
    }

    /// `Challenged | Submitting -> Submitting`. A handler may submit more than
    /// once before reporting an outcome.
    pub fn start_submission(&mut self, cycle: u64) -> Result<(), TransitionError> {
        self.expect_cycle(cycle)?;
        self.expect_phase(
            &[ChallengePhase::Challenged, ChallengePhase::Submitting],
            ChallengePhase::Submitting,
        )?;
        self.phase = ChallengePhase::Submitting;
        Ok(())
    }

    /// `Challenged | Submitting -> Succeeded`.
    pub fn succeed(&mut self, cycle: u64) -> Result<(), TransitionError> {
        self.expect_cycle(cycle)?;
        self.expect_phase(
            &[ChallengePhase::Challenged, ChallengePhase::Submitting],
            ChallengePhase::Succeeded,
        )?;
        self.phase = ChallengePhase::Succeeded;
        Ok(())
    }

    /// `Challenged | Submitting -> Failed`.
    pub fn fail(&mut self, cycle: u64) -> Result<(), TransitionError> {
        self.expect_cycle(cycle)?;
        self.expect_phase(
            &[ChallengePhase::Challenged, ChallengePhase::Submitting],
            ChallengePhase::Failed,
        )?;
        self.phase = ChallengePhase::Failed;
        Ok(())
    }

    /// Terminal phase back to `Idle`.
    pub fn reset(&mut self) -> Result<(), TransitionError> {
        self.expect_phase(
            &[ChallengePhase::Succeeded, ChallengePhase::Failed],
            ChallengePhase::Idle,
        )?;
        self.phase = ChallengePhase::Idle;
        self.started_at = None;
        Ok(())
    }

    fn expect_cycle(&self, cycle: u64) -> Result<(), TransitionError> {
        if cycle == self.cycle {
            Ok(())
        } else {
            Err(TransitionError::StaleCycle {
                realm: self.realm.clone(),
                current: self.cycle,
                requested: cycle,
            })
        }
    }

    fn expect_phase(
        &self,
        allowed: &[ChallengePhase],
        to: ChallengePhase,
    ) -> Result<(), TransitionError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                realm: self.realm.clone(),
                from: self.phase,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_full_cycle_and_returns_to_idle() {
        let mut machine = ChallengeStateMachine::new("AuthRealm");
        let cycle = machine.begin().unwrap();
        assert_eq!(cycle, 1);
        machine.start_submission(cycle).unwrap();
        machine.start_submission(cycle).unwrap();
        machine.succeed(cycle).unwrap();
        assert!(machine.phase().is_terminal());
        machine.reset().unwrap();
        assert_eq!(machine.phase(), ChallengePhase::Idle);
        assert_eq!(machine.begin().unwrap(), 2);
    }

    #[test]
    fn refuses_second_begin_while_active() {
        let mut machine = ChallengeStateMachine::new("R");
        machine.begin().unwrap();
        let err = machine.begin().unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid {
                realm: "R".into(),
                from: ChallengePhase::Challenged,
                to: ChallengePhase::Challenged,
            }
        );
    }

    #[test]
    fn rejects_stale_cycle_and_invalid_moves() {
        let mut machine = ChallengeStateMachine::new("R");
        assert!(machine.succeed(0).is_err());
        let first = machine.begin().unwrap();
        machine.fail(first).unwrap();
        machine.reset().unwrap();
        let second = machine.begin().unwrap();
        assert!(matches!(
            machine.succeed(first),
            Err(TransitionError::StaleCycle { .. })
        ));
        assert!(machine.reset().is_err());
        machine.succeed(second).unwrap();
    }
}
