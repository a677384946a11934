//! The container lifecycle state machine.
//!
//! [`transition`] is pure: it maps a state and an input to the next state
//! plus the side effects to run. The container actor executes the effects
//! and feeds their outcomes back as new inputs.
//!
//! ```text
//! Created ─Start─▶ Starting ─MainSpawned─▶ Running ─Stop/MainExited─▶ Stopping
//!    ▲                 │                    │  ▲                         │
//!    │            SpawnFailed            Exec/ChildExited          AllTerminated
//!    │                 ▼                                                 ▼
//!    │               Dead ──Remove──▶ Removing ─Deleted─▶ Removed     Exited
//!    └──────────────────────────── Start ◀───────────────────────────────┘
//! ```

use pocketbox_common::types::ContainerState;

/// An input to the state machine: a caller operation or an effect outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Caller asks to start the main process.
    Start,
    /// Caller asks to stop every process.
    Stop,
    /// Caller asks to run an additional process.
    Exec,
    /// Caller asks to delete the container.
    Remove,
    /// The main process was spawned.
    MainSpawned,
    /// Spawning the main process failed.
    SpawnFailed(String),
    /// The main process exited on its own.
    MainExited(i32),
    /// An exec'd process exited.
    ChildExited(u32),
    /// Every process is gone; carries the main process's exit code.
    AllTerminated(Option<i32>),
    /// The container's files and record are gone.
    Deleted,
    /// Deleting the container's files failed.
    DeleteFailed(String),
}

impl Input {
    /// Operation name used in invalid-state errors.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Exec => "exec",
            Self::Remove => "remove",
            Self::MainSpawned => "finish starting",
            Self::SpawnFailed(_) => "fail starting",
            Self::MainExited(_) => "observe main exit",
            Self::ChildExited(_) => "observe exec exit",
            Self::AllTerminated(_) => "finish stopping",
            Self::Deleted | Self::DeleteFailed(_) => "finish removing",
        }
    }
}

/// A side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Spawn the main process in the sandbox.
    SpawnMain,
    /// Persist the time the container entered `Running`.
    RecordLastRun,
    /// Spawn an additional process in the running container.
    SpawnChild,
    /// Drop an exited child from the live set.
    ForgetChild(u32),
    /// Terminate the main process and every child, then report back.
    TerminateAll,
    /// Drop every process handle after termination.
    ReleaseProcesses,
    /// Delete the container directory, logs, and record.
    DeleteFiles,
}

impl Effect {
    /// Whether the effect only updates in-memory or persisted bookkeeping.
    ///
    /// Bookkeeping runs before the new state is published, so observers of
    /// a state never see the process index or record lagging behind it.
    #[must_use]
    pub const fn is_bookkeeping(&self) -> bool {
        matches!(
            self,
            Self::RecordLastRun | Self::ForgetChild(_) | Self::ReleaseProcesses
        )
    }
}

/// Result of an accepted input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the input.
    pub next: ContainerState,
    /// Effects to execute, in order.
    pub effects: Vec<Effect>,
}

impl Transition {
    const fn to(next: ContainerState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

/// Computes the transition for `input` in `state`.
///
/// Returns `None` when the state does not accept the input.
#[must_use]
pub fn transition(state: &ContainerState, input: &Input) -> Option<Transition> {
    use ContainerState as S;

    let accepted = match (state, input) {
        (S::Created | S::Exited { .. }, Input::Start) => {
            Transition::to(S::Starting, vec![Effect::SpawnMain])
        }
        (S::Created | S::Exited { .. } | S::Dead { .. }, Input::Remove) => {
            Transition::to(S::Removing, vec![Effect::DeleteFiles])
        }
        (S::Starting, Input::MainSpawned) => {
            Transition::to(S::Running, vec![Effect::RecordLastRun])
        }
        (S::Starting, Input::SpawnFailed(reason)) => Transition::to(
            S::Dead {
                reason: reason.clone(),
            },
            Vec::new(),
        ),
        (S::Running, Input::Exec) => Transition::to(S::Running, vec![Effect::SpawnChild]),
        (S::Running, Input::ChildExited(pid)) => {
            Transition::to(S::Running, vec![Effect::ForgetChild(*pid)])
        }
        (S::Running, Input::Stop | Input::MainExited(_)) => {
            Transition::to(S::Stopping, vec![Effect::TerminateAll])
        }
        (S::Stopping, Input::AllTerminated(exit_code)) => Transition::to(
            S::Exited {
                exit_code: *exit_code,
            },
            vec![Effect::ReleaseProcesses],
        ),
        (S::Removing, Input::Deleted) => Transition::to(S::Removed, Vec::new()),
        (S::Removing, Input::DeleteFailed(reason)) => Transition::to(
            S::Dead {
                reason: reason.clone(),
            },
            Vec::new(),
        ),
        _ => return None,
    };
    Some(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(state: &ContainerState, input: &Input) -> ContainerState {
        transition(state, input).expect("accepted").next
    }

    fn exited() -> ContainerState {
        ContainerState::Exited { exit_code: Some(0) }
    }

    fn dead() -> ContainerState {
        ContainerState::Dead {
            reason: "boom".into(),
        }
    }

    #[test]
    fn exit_releases_processes_as_bookkeeping() {
        let stopped = transition(&ContainerState::Stopping, &Input::AllTerminated(Some(0)))
            .expect("accepted");
        assert!(stopped.effects.iter().all(Effect::is_bookkeeping));

        let running =
            transition(&ContainerState::Starting, &Input::MainSpawned).expect("accepted");
        assert!(running.effects.iter().all(Effect::is_bookkeeping));

        assert!(!Effect::SpawnMain.is_bookkeeping());
        assert!(!Effect::TerminateAll.is_bookkeeping());
        assert!(!Effect::DeleteFiles.is_bookkeeping());
    }

    #[test]
    fn full_lifecycle() {
        let mut state = ContainerState::Created;
        for (input, expected) in [
            (Input::Start, ContainerState::Starting),
            (Input::MainSpawned, ContainerState::Running),
            (Input::Exec, ContainerState::Running),
            (Input::ChildExited(7), ContainerState::Running),
            (Input::Stop, ContainerState::Stopping),
            (Input::AllTerminated(Some(0)), exited()),
            (Input::Start, ContainerState::Starting),
            (Input::MainSpawned, ContainerState::Running),
            (Input::MainExited(0), ContainerState::Stopping),
            (Input::AllTerminated(Some(0)), exited()),
            (Input::Remove, ContainerState::Removing),
            (Input::Deleted, ContainerState::Removed),
        ] {
            state = next(&state, &input);
            assert_eq!(state, expected, "after {input:?}");
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn operations_accepted_per_state() {
        let operations = [Input::Start, Input::Stop, Input::Exec, Input::Remove];
        let table = [
            (ContainerState::Created, vec![Input::Start, Input::Remove]),
            (ContainerState::Starting, vec![]),
            (ContainerState::Running, vec![Input::Stop, Input::Exec]),
            (ContainerState::Stopping, vec![]),
            (exited(), vec![Input::Start, Input::Remove]),
            (dead(), vec![Input::Remove]),
            (ContainerState::Removing, vec![]),
            (ContainerState::Removed, vec![]),
        ];
        for (state, accepted) in table {
            for op in &operations {
                assert_eq!(
                    transition(&state, op).is_some(),
                    accepted.contains(op),
                    "{op:?} in {state}"
                );
            }
        }
    }

    #[test]
    fn exec_only_spawns_when_running() {
        let running = transition(&ContainerState::Running, &Input::Exec).expect("running");
        assert_eq!(running.effects, vec![Effect::SpawnChild]);
        assert!(transition(&ContainerState::Created, &Input::Exec).is_none());
        assert!(transition(&exited(), &Input::Exec).is_none());
    }

    #[test]
    fn spawn_failure_is_dead_with_cause() {
        let state = next(
            &ContainerState::Starting,
            &Input::SpawnFailed("no rootfs".into()),
        );
        assert_eq!(
            state,
            ContainerState::Dead {
                reason: "no rootfs".into()
            }
        );
        assert!(transition(&state, &Input::Start).is_none());
    }

    #[test]
    fn stop_and_main_exit_both_terminate_everything() {
        for input in [Input::Stop, Input::MainExited(3)] {
            let t = transition(&ContainerState::Running, &input).expect("accepted");
            assert_eq!(t.next, ContainerState::Stopping);
            assert_eq!(t.effects, vec![Effect::TerminateAll]);
        }
    }

    #[test]
    fn late_exit_notifications_are_rejected() {
        assert!(transition(&ContainerState::Stopping, &Input::MainExited(0)).is_none());
        assert!(transition(&exited(), &Input::ChildExited(5)).is_none());
    }

    #[test]
    fn failed_removal_leaves_a_removable_dead_container() {
        let state = next(&ContainerState::Removing, &Input::DeleteFailed("busy".into()));
        assert_eq!(next(&state, &Input::Remove), ContainerState::Removing);
    }
}
