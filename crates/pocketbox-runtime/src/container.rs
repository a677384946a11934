//! Container handles and the per-container actor.
//!
//! Every container is driven by one actor task that owns its state and
//! processes. Caller operations and process notifications share a single
//! FIFO queue, so a container handles exactly one input at a time. The
//! actor applies [`transition`], settles bookkeeping, publishes the new
//! state, runs the remaining effects, and feeds effect outcomes back as
//! inputs.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::records::{ContainerConfig, ContainerRecord};
use pocketbox_common::types::{ContainerId, ContainerState};
use tokio::sync::{mpsc, oneshot, watch};

use crate::engine::Shared;
use crate::logs::{self, LogPaths};
use crate::process::{ContainerProcess, ProcessEntry, ProcessKind};
use crate::state::{Effect, Input, transition};

enum Operation {
    Start,
    Stop,
    Exec(Vec<String>),
    Remove,
}

impl Operation {
    const fn input(&self) -> Input {
        match self {
            Self::Start => Input::Start,
            Self::Stop => Input::Stop,
            Self::Exec(_) => Input::Exec,
            Self::Remove => Input::Remove,
        }
    }
}

enum Message {
    Request {
        operation: Operation,
        reply: oneshot::Sender<Result<Option<ContainerProcess>>>,
    },
    Notify {
        generation: u64,
        input: Input,
    },
}

/// Handle to a container. Clones address the same actor.
#[derive(Clone)]
pub struct Container {
    id: ContainerId,
    record: Arc<Mutex<ContainerRecord>>,
    requests: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ContainerState>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Starts the actor for `record` in `initial` state.
    pub(crate) fn spawn(
        record: ContainerRecord,
        initial: ContainerState,
        shared: Arc<Shared>,
    ) -> Self {
        let id = record.id.clone();
        let (requests, inbox) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(initial);
        let record = Arc::new(Mutex::new(record));

        let actor = Actor {
            id: id.clone(),
            rootfs: shared.config.rootfs_dir(&id),
            record: Arc::clone(&record),
            shared,
            state: state_tx,
            inbox,
            notify: requests.downgrade(),
            main: None,
            children: HashMap::new(),
            generation: 0,
        };
        drop(tokio::spawn(actor.run()));

        Self {
            id,
            record,
            requests,
            state,
        }
    }

    /// Container id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> String {
        self.lock_record().name.clone()
    }

    /// Snapshot of the persisted record.
    #[must_use]
    pub fn record(&self) -> ContainerRecord {
        self.lock_record().clone()
    }

    fn lock_record(&self) -> MutexGuard<'_, ContainerRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state.borrow().clone()
    }

    /// Receiver observing every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ContainerState> {
        self.state.clone()
    }

    /// Waits until the state satisfies `predicate` and returns that state.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::NotFound`] if the container was removed
    /// before the predicate held.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&ContainerState) -> bool,
    ) -> Result<ContainerState> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| self.gone())?;
        Ok(reached.clone())
    }

    /// Starts the main process.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::InvalidState`] unless the container is
    /// `Created` or `Exited`, and the spawn error if the container went
    /// `Dead`.
    pub async fn start(&self) -> Result<()> {
        self.request(Operation::Start).await.map(drop)
    }

    /// Stops every process and waits until the container has exited.
    ///
    /// A container that is already stopping or has exited on its own counts
    /// as stopped, so racing a main-process exit is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::InvalidState`] if the container was never
    /// started or cannot be stopped from its current state.
    pub async fn stop(&self) -> Result<ContainerState> {
        match self.request(Operation::Stop).await {
            Ok(_) => {}
            Err(e)
                if e.is_invalid_state()
                    && matches!(
                        self.state(),
                        ContainerState::Stopping | ContainerState::Exited { .. }
                    ) => {}
            Err(e) => return Err(e),
        }
        self.wait_until(|s| *s != ContainerState::Stopping).await
    }

    /// Runs `command` as an additional process of the running container.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::InvalidState`] if the container is not
    /// running, in which case nothing is spawned.
    pub async fn exec(&self, command: Vec<String>) -> Result<ContainerProcess> {
        self.request(Operation::Exec(command))
            .await?
            .ok_or_else(|| PocketboxError::Spawn {
                message: "exec produced no process".into(),
            })
    }

    /// Deletes the container's files and record, stopping it first if it
    /// is running.
    ///
    /// # Errors
    ///
    /// Fails if stopping or deleting fails. A failed deletion leaves the
    /// container `Dead`, from where removal can be retried.
    pub async fn remove(&self) -> Result<()> {
        loop {
            match self.state() {
                ContainerState::Running => {
                    if let Err(e) = self.stop().await {
                        if !e.is_invalid_state() {
                            return Err(e);
                        }
                    }
                }
                ContainerState::Starting | ContainerState::Stopping => {
                    let _ = self
                        .wait_until(|s| {
                            !matches!(s, ContainerState::Starting | ContainerState::Stopping)
                        })
                        .await?;
                }
                _ => break,
            }
        }
        self.request(Operation::Remove).await.map(drop)
    }

    async fn request(&self, operation: Operation) -> Result<Option<ContainerProcess>> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Message::Request { operation, reply })
            .map_err(|_| self.gone())?;
        response.await.map_err(|_| self.gone())?
    }

    fn gone(&self) -> PocketboxError {
        PocketboxError::NotFound {
            kind: "container",
            id: self.id.to_string(),
        }
    }
}

/// What running one effect produced.
enum Reaction {
    Nothing,
    Feed(Input),
    Spawned(ContainerProcess),
    Failed {
        error: PocketboxError,
        feed: Option<Input>,
    },
}

struct Actor {
    id: ContainerId,
    rootfs: PathBuf,
    record: Arc<Mutex<ContainerRecord>>,
    shared: Arc<Shared>,
    state: watch::Sender<ContainerState>,
    inbox: mpsc::UnboundedReceiver<Message>,
    notify: mpsc::WeakUnboundedSender<Message>,
    main: Option<ContainerProcess>,
    children: HashMap<u32, ContainerProcess>,
    generation: u64,
}

impl Actor {
    async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            match message {
                Message::Request { operation, reply } => {
                    let result = self.handle(operation).await;
                    let _ = reply.send(result);
                }
                Message::Notify { generation, input } if generation == self.generation => {
                    if let Err(e) = self.apply(input, None, false).await {
                        tracing::warn!(id = %self.id, error = %e, "container effect failed");
                    }
                }
                Message::Notify { input, .. } => {
                    tracing::trace!(id = %self.id, ?input, "dropping stale notification");
                }
            }
            if self.state.borrow().is_terminal() {
                break;
            }
        }
        tracing::debug!(id = %self.id, "container actor finished");
    }

    async fn handle(&mut self, operation: Operation) -> Result<Option<ContainerProcess>> {
        let input = operation.input();
        let command = match operation {
            Operation::Exec(command) => Some(command),
            _ => None,
        };
        self.apply(input, command, true).await
    }

    /// Applies `first` and every input its effects feed back.
    ///
    /// A rejected caller operation is an invalid-state error; rejected
    /// notifications are dropped.
    async fn apply(
        &mut self,
        first: Input,
        mut command: Option<Vec<String>>,
        from_caller: bool,
    ) -> Result<Option<ContainerProcess>> {
        let mut queue = VecDeque::from([first]);
        let mut spawned = None;
        let mut failure = None;
        let mut is_first = true;

        while let Some(input) = queue.pop_front() {
            let current = self.state.borrow().clone();
            let Some(next) = transition(&current, &input) else {
                if is_first && from_caller {
                    return Err(PocketboxError::InvalidState {
                        id: self.id.to_string(),
                        state: current.to_string(),
                        operation: input.operation(),
                    });
                }
                tracing::debug!(id = %self.id, state = %current, ?input, "input ignored");
                is_first = false;
                continue;
            };
            is_first = false;

            if next.next != current {
                tracing::info!(
                    id = %self.id,
                    from = %current,
                    to = %next.next,
                    "container state changed"
                );
            }
            let (bookkeeping, effects): (Vec<_>, Vec<_>) =
                next.effects.into_iter().partition(Effect::is_bookkeeping);
            let mut reactions = Vec::with_capacity(bookkeeping.len() + effects.len());
            for effect in bookkeeping {
                reactions.push(self.run_effect(effect, &mut command).await);
            }
            let _ = self.state.send_replace(next.next);
            for effect in effects {
                reactions.push(self.run_effect(effect, &mut command).await);
            }

            for reaction in reactions {
                match reaction {
                    Reaction::Nothing => {}
                    Reaction::Feed(input) => queue.push_back(input),
                    Reaction::Spawned(process) => spawned = Some(process),
                    Reaction::Failed { error, feed } => {
                        queue.extend(feed);
                        let _ = failure.get_or_insert(error);
                    }
                }
            }
        }

        failure.map_or(Ok(spawned), Err)
    }

    async fn run_effect(&mut self, effect: Effect, command: &mut Option<Vec<String>>) -> Reaction {
        match effect {
            Effect::SpawnMain => self.spawn_main().await,
            Effect::RecordLastRun => {
                self.record_last_run();
                Reaction::Nothing
            }
            Effect::SpawnChild => self.spawn_child(command.take().unwrap_or_default()).await,
            Effect::ForgetChild(pid) => {
                let _ = self.children.remove(&pid);
                let _ = self.shared.processes.remove(&pid);
                Reaction::Nothing
            }
            Effect::TerminateAll => {
                self.terminate_all();
                Reaction::Nothing
            }
            Effect::ReleaseProcesses => {
                self.release_processes();
                Reaction::Nothing
            }
            Effect::DeleteFiles => match self.delete_files().await {
                Ok(()) => Reaction::Feed(Input::Deleted),
                Err(error) => Reaction::Failed {
                    feed: Some(Input::DeleteFailed(error.to_string())),
                    error,
                },
            },
        }
    }

    fn config(&self) -> ContainerConfig {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    async fn spawn_main(&mut self) -> Reaction {
        let logs = LogPaths::for_container(&self.shared.config.logs_dir(), &self.id);
        let config = self.config();
        let spawned = self
            .shared
            .sandbox
            .spawn(&self.rootfs, &config, None, logs)
            .await;
        match spawned {
            Ok(process) => {
                self.generation += 1;
                tracing::info!(id = %self.id, pid = process.pid(), "main process started");
                self.register(&process, ProcessKind::Main);
                self.notify_on_exit(&process, Input::MainExited);
                self.main = Some(process);
                Reaction::Feed(Input::MainSpawned)
            }
            Err(error) => {
                tracing::warn!(id = %self.id, error = %error, "failed to start container");
                Reaction::Failed {
                    feed: Some(Input::SpawnFailed(error.to_string())),
                    error,
                }
            }
        }
    }

    async fn spawn_child(&mut self, command: Vec<String>) -> Reaction {
        if command.is_empty() {
            return Reaction::Failed {
                error: PocketboxError::Config {
                    message: "exec command is empty".into(),
                },
                feed: None,
            };
        }
        let logs_dir = self.shared.config.logs_dir();
        let id = self.id.clone();
        let logs = match tokio::task::spawn_blocking(move || LogPaths::next_exec(&logs_dir, &id))
            .await
        {
            Ok(Ok(logs)) => logs,
            Ok(Err(error)) => return Reaction::Failed { error, feed: None },
            Err(e) => {
                return Reaction::Failed {
                    error: PocketboxError::Cancelled {
                        operation: format!("exec log allocation: {e}"),
                    },
                    feed: None,
                };
            }
        };

        let config = self.config();
        let spawned = self
            .shared
            .sandbox
            .spawn(&self.rootfs, &config, Some(&command), logs)
            .await;
        match spawned {
            Ok(process) => {
                let pid = process.pid();
                tracing::info!(id = %self.id, pid, cmd = ?command, "exec process started");
                self.register(&process, ProcessKind::Exec);
                self.notify_on_exit(&process, move |_| Input::ChildExited(pid));
                let _ = self.children.insert(pid, process.clone());
                Reaction::Spawned(process)
            }
            Err(error) => Reaction::Failed { error, feed: None },
        }
    }

    fn register(&self, process: &ContainerProcess, kind: ProcessKind) {
        let _ = self.shared.processes.insert(
            process.pid(),
            ProcessEntry {
                container_id: self.id.clone(),
                kind,
                process: process.clone(),
            },
        );
    }

    fn notify_on_exit(
        &self,
        process: &ContainerProcess,
        input: impl FnOnce(i32) -> Input + Send + 'static,
    ) {
        let process = process.clone();
        let notify = self.notify.clone();
        let generation = self.generation;
        drop(tokio::spawn(async move {
            let code = process.wait().await;
            if let Some(tx) = notify.upgrade() {
                let _ = tx.send(Message::Notify {
                    generation,
                    input: input(code),
                });
            }
        }));
    }

    fn record_last_run(&self) {
        let record = {
            let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            record.last_run_at = Some(Utc::now());
            record.clone()
        };
        if let Err(e) = self.shared.store.put_container(&record) {
            tracing::warn!(id = %self.id, error = %e, "failed to persist last run time");
        }
    }

    /// Terminates every live process off the actor, then reports
    /// [`Input::AllTerminated`] with the main process's exit code.
    fn terminate_all(&self) {
        let main = self.main.clone();
        let children: Vec<ContainerProcess> = self.children.values().cloned().collect();
        let grace = self.shared.config.stop_grace_period();
        let notify = self.notify.clone();
        let generation = self.generation;
        let id = self.id.clone();

        drop(tokio::spawn(async move {
            let main_exit = async {
                match &main {
                    Some(process) => Some(process.terminate(grace).await),
                    None => None,
                }
            };
            let children_exit =
                futures::future::join_all(children.iter().map(|c| c.terminate(grace)));
            let (exit_code, _) = tokio::join!(main_exit, children_exit);
            tracing::info!(id = %id, ?exit_code, "container processes terminated");
            if let Some(tx) = notify.upgrade() {
                let _ = tx.send(Message::Notify {
                    generation,
                    input: Input::AllTerminated(exit_code),
                });
            }
        }));
    }

    fn release_processes(&mut self) {
        if let Some(main) = self.main.take() {
            let _ = self.shared.processes.remove(&main.pid());
        }
        for (pid, _) in self.children.drain() {
            let _ = self.shared.processes.remove(&pid);
        }
    }

    async fn delete_files(&self) -> Result<()> {
        let dir = self.shared.config.container_dir(&self.id);
        let logs_dir = self.shared.config.logs_dir();
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PocketboxError::io(&dir, e)),
            }
            logs::remove_logs(&logs_dir, &id)
        })
        .await
        .map_err(|e| PocketboxError::Cancelled {
            operation: format!("container removal: {e}"),
        })??;

        let _ = self.shared.store.delete_container(&self.id)?;
        let _ = self.shared.containers.remove(&self.id);
        tracing::info!(id = %self.id, "container removed");
        Ok(())
    }
}
