//! Script execution engine.
//!
//! One run moves through
//! `Idle -> LockAcquired -> Executing -> {Committed | Aborted | PartiallyApplied} -> LockReleased`.
//!
//! In sequential mode every command runs on its own and the version record
//! is flagged dirty for the duration of the script. In transactional mode
//! the non-structural commands and the version update share one
//! multi-document transaction; structural commands run before it, outside
//! any transaction, because the server refuses them inside one. Only
//! `create` and `createIndexes` may be moved ahead of data commands that
//! precede them; other structural commands must lead the script.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use migrate_rs_backends::{BackendTransaction, DocumentBackend};
use migrate_rs_core::logging::run_span;
use migrate_rs_core::{MigrateError, MigrateResult};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::Instrument;

use crate::codec::{Command, MigrationScript};
use crate::lock::AdvisoryLock;
use crate::version::{VersionRecord, VersionStore};

/// How a script is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Commands run one by one; a failure leaves the record dirty.
    Sequential,
    /// Commands and the version update commit or abort together.
    Transactional,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Transactional => f.write_str("transactional"),
        }
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LockAcquired,
    Executing,
    Committed,
    Aborted,
    PartiallyApplied,
    LockReleased,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LockAcquired => "lock_acquired",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::PartiallyApplied => "partially_applied",
            Self::LockReleased => "lock_released",
        };
        f.write_str(name)
    }
}

/// The outcome of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// How the script was applied.
    pub mode: ExecutionMode,
    /// Number of commands executed.
    pub commands: usize,
    /// How many of them were structural.
    pub structural: usize,
    /// The version record after the run.
    pub version: VersionRecord,
}

/// Applies decoded scripts under the advisory lock.
pub struct ExecutionEngine {
    backend: Arc<dyn DocumentBackend>,
    lock: AdvisoryLock,
    versions: VersionStore,
    transaction_mode: bool,
    transactions_supported: OnceCell<bool>,
    operation_timeout: Option<Duration>,
}

impl ExecutionEngine {
    /// Creates an engine. Transaction support is probed lazily, see
    /// [`resolve_mode`](Self::resolve_mode).
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        lock: AdvisoryLock,
        versions: VersionStore,
        transaction_mode: bool,
        operation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            backend,
            lock,
            versions,
            transaction_mode,
            transactions_supported: OnceCell::new(),
            operation_timeout,
        }
    }

    /// Returns the advisory lock.
    pub const fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }

    /// Returns the version store.
    pub const fn versions(&self) -> &VersionStore {
        &self.versions
    }

    /// Returns the configured operation timeout.
    pub const fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout
    }

    /// Resolves the execution mode.
    ///
    /// With transaction mode requested, the backend is asked once whether it
    /// supports multi-document transactions; the answer is cached. A backend
    /// without support is a configuration error.
    pub async fn resolve_mode(&self) -> MigrateResult<ExecutionMode> {
        if !self.transaction_mode {
            return Ok(ExecutionMode::Sequential);
        }
        let supported = *self
            .transactions_supported
            .get_or_try_init(|| self.backend.supports_transactions())
            .await?;
        if supported {
            Ok(ExecutionMode::Transactional)
        } else {
            Err(MigrateError::Config(format!(
                "transaction mode requested but the {} backend does not support multi-document transactions",
                self.backend.vendor()
            )))
        }
    }

    /// Runs `script` under the advisory lock.
    ///
    /// `target` is the version to record, or `None` to keep the current
    /// one. If `cancel` completes first, the in-flight step is dropped, an
    /// open transaction is aborted and [`MigrateError::Cancelled`] is
    /// returned. Once a commit has been sent it runs to completion.
    pub async fn execute<C>(
        &self,
        target: Option<i64>,
        script: &MigrationScript,
        cancel: C,
    ) -> MigrateResult<RunReport>
    where
        C: Future<Output = ()> + Send,
    {
        let span = run_span(self.backend.database_name(), target);
        async move {
            if self.transaction_mode {
                script.check_transactional()?;
            }
            tokio::pin!(cancel);
            let mut interrupt = Interrupt::new(cancel.as_mut(), self.operation_timeout);
            let mut state = RunState::Idle;

            let mode = interrupt.guard(self.resolve_mode()).await?;
            if let Err(err) = interrupt.guard(self.lock.acquire()).await {
                if matches!(err, MigrateError::Cancelled | MigrateError::Timeout(_)) {
                    if let Err(cleanup) = self.lock.abandon().await {
                        tracing::warn!(error = %cleanup, "failed to clean up interrupted lock acquire");
                    }
                }
                return Err(err);
            }
            advance(&mut state, RunState::LockAcquired);
            tracing::info!(
                mode = %mode,
                commands = script.len(),
                structural = script.structural_count(),
                "starting migration run"
            );

            let result = self
                .execute_locked(mode, target, script, &mut interrupt, &mut state)
                .await;

            if let Err(err) = self.lock.release().await {
                tracing::warn!(error = %err, "failed to release advisory lock");
            }
            advance(&mut state, RunState::LockReleased);

            match &result {
                Ok(report) => tracing::info!(version = %report.version, "migration run finished"),
                Err(err) if err.outcome_unknown() => {
                    tracing::warn!(error = %err, "migration run failed; check the version record to see whether it applied");
                }
                Err(err) if err.leaves_dirty() => {
                    tracing::warn!(error = %err, "migration run failed; database is dirty");
                }
                Err(err) => tracing::warn!(error = %err, "migration run failed; nothing was applied"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute_locked<C>(
        &self,
        mode: ExecutionMode,
        target: Option<i64>,
        script: &MigrationScript,
        interrupt: &mut Interrupt<'_, C>,
        state: &mut RunState,
    ) -> MigrateResult<RunReport>
    where
        C: Future<Output = ()> + Send,
    {
        let current = interrupt.guard(self.versions.current_version()).await?;
        if current.dirty {
            return Err(MigrateError::Dirty {
                version: current.version,
            });
        }
        let version = target.unwrap_or(current.version);
        advance(state, RunState::Executing);

        if script.is_empty() {
            let recorded = match target {
                Some(version) => {
                    interrupt.guard(self.versions.set_version(version, false)).await?;
                    VersionRecord::new(version, false)
                }
                None => current,
            };
            advance(state, RunState::Committed);
            return Ok(RunReport {
                mode,
                commands: 0,
                structural: 0,
                version: recorded,
            });
        }

        match mode {
            ExecutionMode::Sequential => self.run_sequential(version, script, interrupt, state).await,
            ExecutionMode::Transactional => {
                self.run_transactional(version, script, interrupt, state)
                    .await
            }
        }
    }

    async fn run_sequential<C>(
        &self,
        version: i64,
        script: &MigrationScript,
        interrupt: &mut Interrupt<'_, C>,
        state: &mut RunState,
    ) -> MigrateResult<RunReport>
    where
        C: Future<Output = ()> + Send,
    {
        // Flag the record up front so a crash mid-script is visible.
        interrupt.guard(self.versions.set_version(version, true)).await?;

        for (index, command) in script.iter().enumerate() {
            log_command(index, command);
            let sent = self.backend.run_command(command.document().clone());
            if let Err(cause) = interrupt.guard(sent).await {
                advance(state, RunState::PartiallyApplied);
                return Err(command_error(index, command, cause, true));
            }
        }

        if let Err(cause) = interrupt.guard(self.versions.set_version(version, false)).await {
            advance(state, RunState::PartiallyApplied);
            return Err(MigrateError::VersionUpdate {
                version,
                cause: Box::new(cause),
                dirty: true,
            });
        }
        advance(state, RunState::Committed);
        Ok(RunReport {
            mode: ExecutionMode::Sequential,
            commands: script.len(),
            structural: script.structural_count(),
            version: VersionRecord::new(version, false),
        })
    }

    async fn run_transactional<C>(
        &self,
        version: i64,
        script: &MigrationScript,
        interrupt: &mut Interrupt<'_, C>,
        state: &mut RunState,
    ) -> MigrateResult<RunReport>
    where
        C: Future<Output = ()> + Send,
    {
        let (structural, transactional): (Vec<_>, Vec<_>) =
            script.iter().enumerate().partition(|(_, c)| c.is_structural());

        // The version update inside the transaction needs an existing
        // collection on servers that refuse implicit creation there.
        interrupt.guard(self.versions.ensure_collection()).await?;

        let prelude = !structural.is_empty();
        if prelude {
            interrupt.guard(self.versions.set_version(version, true)).await?;
            for (index, command) in &structural {
                log_command(*index, command);
                let sent = self.backend.run_command(command.document().clone());
                if let Err(cause) = interrupt.guard(sent).await {
                    advance(state, RunState::PartiallyApplied);
                    return Err(command_error(*index, command, cause, true));
                }
            }
        }

        let mut transaction = interrupt
            .guard(self.backend.begin_transaction())
            .await
            .map_err(|err| flag_dirty(err, version, prelude))?;
        tracing::debug!(commands = transactional.len(), "transaction started");

        let outcome = interrupt
            .guard(self.run_in_transaction(transaction.as_mut(), &transactional, version))
            .await;

        match outcome {
            Ok(()) => {
                if let Err(err) = transaction.commit().await {
                    if err.outcome_unknown() {
                        advance(state, RunState::PartiallyApplied);
                        return Err(err);
                    }
                    advance(state, RunState::Aborted);
                    return Err(flag_dirty(err, version, prelude));
                }
                advance(state, RunState::Committed);
                Ok(RunReport {
                    mode: ExecutionMode::Transactional,
                    commands: script.len(),
                    structural: structural.len(),
                    version: VersionRecord::new(version, false),
                })
            }
            Err(err) => {
                if let Err(abort) = transaction.abort().await {
                    tracing::warn!(error = %abort, "failed to abort transaction");
                }
                advance(state, RunState::Aborted);
                Err(flag_dirty(err, version, prelude))
            }
        }
    }

    async fn run_in_transaction(
        &self,
        transaction: &mut dyn BackendTransaction,
        commands: &[(usize, &Command)],
        version: i64,
    ) -> MigrateResult<()> {
        for (index, command) in commands {
            log_command(*index, command);
            transaction
                .run_command(command.document().clone())
                .await
                .map_err(|cause| command_error(*index, command, cause, false))?;
        }
        self.versions
            .set_version_in(transaction, version, false)
            .await
            .map_err(|cause| MigrateError::VersionUpdate {
                version,
                cause: Box::new(cause),
                dirty: false,
            })
    }
}

/// Races each step of a run against the caller's cancellation future and
/// the run's deadline.
struct Interrupt<'a, C> {
    cancel: Pin<&'a mut C>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl<'a, C> Interrupt<'a, C>
where
    C: Future<Output = ()> + Send,
{
    fn new(cancel: Pin<&'a mut C>, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            timeout,
            // A deadline past what the clock can represent means none at all.
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
        }
    }

    async fn guard<T, F>(&mut self, work: F) -> MigrateResult<T>
    where
        F: Future<Output = MigrateResult<T>> + Send,
    {
        let deadline = self.deadline;
        let timeout = self.timeout.unwrap_or_default();
        let bounded = async move {
            match deadline {
                Some(at) => tokio::time::timeout_at(at, work)
                    .await
                    .unwrap_or_else(|_| Err(MigrateError::Timeout(timeout))),
                None => work.await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.as_mut() => Err(MigrateError::Cancelled),
            result = bounded => result,
        }
    }
}

fn advance(state: &mut RunState, next: RunState) {
    tracing::trace!(from = %state, to = %next, "run state");
    *state = next;
}

fn log_command(index: usize, command: &Command) {
    tracing::debug!(
        index,
        command = command.name(),
        collection = command.collection(),
        structural = command.is_structural(),
        "running command"
    );
}

fn command_error(index: usize, command: &Command, cause: MigrateError, dirty: bool) -> MigrateError {
    MigrateError::Command {
        index,
        name: command.name().to_string(),
        cause: Box::new(cause),
        dirty,
    }
}

/// Marks a failure as dirty when structural commands already ran outside
/// the transaction.
fn flag_dirty(err: MigrateError, version: i64, dirty: bool) -> MigrateError {
    if !dirty || err.leaves_dirty() {
        return err;
    }
    match err {
        MigrateError::Command {
            index, name, cause, ..
        } => MigrateError::Command {
            index,
            name,
            cause,
            dirty: true,
        },
        MigrateError::VersionUpdate { version, cause, .. } => MigrateError::VersionUpdate {
            version,
            cause,
            dirty: true,
        },
        other => MigrateError::VersionUpdate {
            version,
            cause: Box::new(other),
            dirty: true,
        },
    }
}
