// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crossbeam::utils::CachePadded;
use meridian_mvstore::types::{Incarnation, TxnIndex, Version};
use parking_lot::Mutex;
use std::{
    cmp::max,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

const TXN_IDX_MASK: u64 = (1 << 32) - 1;

pub type Wave = u32;

/// A holder for a potential task returned from the scheduler. ExecutionTask
/// and ValidationTask each contain a version of a transaction that must be
/// executed or validated, respectively. NoTask holds no task, and Done
/// implies that there are no more tasks and the scheduler is done.
#[derive(Debug)]
pub enum SchedulerTask {
    ExecutionTask(Version),
    ValidationTask(Version, Wave),
    NoTask,
    Done,
}

/// All possible statuses for each transaction. Each status contains the
/// latest incarnation number.
///
/// 'ReadyToExecute' means that the corresponding incarnation should be
/// executed and the scheduler must eventually create a corresponding
/// execution task. The scheduler ensures that exactly one execution task
/// gets created, changing the status to 'Executing' in the process.
///
/// 'Executing' turns into 'Executed' when the execution task finishes. If a
/// blocked read is encountered instead, the incarnation is discarded
/// immediately and the status moves straight back to
/// 'ReadyToExecute(incarnation + 1)' -- there is no suspended state and no
/// signal to wake a waiting worker, by design: the one-shot wake-up
/// primitive this replaces is exactly the thing that deadlocks when a
/// second signal arrives after its only consumer stopped listening.
///
/// An 'Executed' status allows creation of validation tasks, and a
/// validation failure leads to an abort. The scheduler ensures that there
/// is exactly one abort per version, changing the status to 'Aborting' in
/// the process, and the aborting thread then moves the status to
/// 'ReadyToExecute(incarnation + 1)'. The transaction at the commit
/// frontier moves from 'Executed' to 'Committed' once its validation
/// covers the required wave.
#[derive(Debug, PartialEq)]
enum ExecutionStatus {
    ReadyToExecute(Incarnation),
    Executing(Incarnation),
    Executed(Incarnation),
    Committed(Incarnation),
    Aborting(Incarnation),
}

struct ValidationStatus {
    /// Maximum wave that was triggered at the transaction index
    /// corresponding to the status.
    max_triggered_wave: Wave,

    /// The maximum wave among successful validations of the corresponding
    /// transaction.
    max_validated_wave: Option<Wave>,

    /// Additional lower bound on the wave that must be successfully
    /// validated in order for the transaction to be committed, required to
    /// handle the optimization in finish_execution when only the
    /// transaction itself is validated (if the last incarnation didn't
    /// write outside of the previous write-set).
    required_wave: Wave,
}

impl ValidationStatus {
    fn new() -> Self {
        ValidationStatus {
            max_triggered_wave: 0,
            max_validated_wave: None,
            required_wave: 0,
        }
    }
}

pub struct Scheduler {
    /// Number of txns to execute, immutable.
    num_txns: usize,

    /// A shared index that tracks the minimum of all transaction indices
    /// that require execution. The threads increment the index and attempt
    /// to create an execution task for the corresponding transaction, if
    /// the status of the txn is 'ReadyToExecute'. It is reduced as
    /// necessary when transactions become ready to be executed again, in
    /// particular after aborts and dependency resolutions.
    execution_idx: AtomicU32,
    /// The first 32 bits identify a validation wave while the last 32 bits
    /// contain an index that tracks the minimum of all transaction indices
    /// that require validation. Each wave represents a sequence of
    /// validations that must happen due to the fixed serialization order of
    /// transactions. The index is reduced as necessary after aborts and
    /// after executions that write outside of the previous write-set, which
    /// starts a new wave.
    validation_idx: AtomicU64,
    /// Next transaction to commit, and the sweeping lower bound on the wave
    /// of a validation that must be successful in order to commit it.
    commit_state: Mutex<(TxnIndex, Wave)>,
    /// Mirror of the commit frontier readable without the commit lock:
    /// every transaction below it has committed.
    commit_watermark: AtomicU32,

    /// Shared marker that is set when a thread detects that all txns can
    /// be committed.
    done_marker: AtomicBool,

    /// When false, a transaction may only start executing once every direct
    /// predecessor from the dependency graph has committed.
    eager: bool,
    /// Direct predecessor transactions per transaction, from the graph.
    predecessors: Vec<Vec<TxnIndex>>,
    /// Inverse of `predecessors`: transactions to nudge back into the
    /// execution window when this one commits (gated mode only).
    dependents: Vec<Vec<TxnIndex>>,

    /// An index i maps to indices of other transactions that got blocked on
    /// an estimate of transaction i and must be requeued once transaction
    /// i's next incarnation finishes.
    txn_dependency: Vec<CachePadded<Mutex<Vec<TxnIndex>>>>,
    /// An index i maps to the most up-to-date status of transaction i.
    txn_status: Vec<CachePadded<(Mutex<ExecutionStatus>, Mutex<ValidationStatus>)>>,
}

/// Public interfaces for the Scheduler.
impl Scheduler {
    pub fn new(
        num_txns: usize,
        predecessors: Vec<Vec<TxnIndex>>,
        dependents: Vec<Vec<TxnIndex>>,
        eager: bool,
    ) -> Self {
        debug_assert_eq!(predecessors.len(), num_txns);
        debug_assert_eq!(dependents.len(), num_txns);
        Self {
            num_txns,
            execution_idx: AtomicU32::new(0),
            validation_idx: AtomicU64::new(0),
            commit_state: Mutex::new((0, 0)),
            commit_watermark: AtomicU32::new(0),
            done_marker: AtomicBool::new(false),
            eager,
            predecessors,
            dependents,
            txn_dependency: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
            txn_status: (0..num_txns)
                .map(|_| {
                    CachePadded::new((
                        Mutex::new(ExecutionStatus::ReadyToExecute(0)),
                        Mutex::new(ValidationStatus::new()),
                    ))
                })
                .collect(),
        }
    }

    /// Convenience constructor for an ungated scheduler (no graph input).
    pub fn new_eager(num_txns: usize) -> Self {
        Self::new(num_txns, vec![vec![]; num_txns], vec![vec![]; num_txns], true)
    }

    /// If successful, returns Some(TxnIndex) of the committed transaction.
    /// Transactions commit strictly in batch order.
    pub fn try_commit(&self) -> Option<TxnIndex> {
        let mut commit_state = self.commit_state.lock();
        let idx = commit_state.0;
        if idx as usize == self.num_txns {
            self.done_marker.store(true, Ordering::SeqCst);
            return None;
        }

        let validation_status = self.txn_status[idx as usize].1.try_lock()?;
        let mut status = self.txn_status[idx as usize].0.try_lock()?;
        if let ExecutionStatus::Executed(incarnation) = *status {
            commit_state.1 = max(commit_state.1, validation_status.max_triggered_wave);
            if let Some(validated_wave) = validation_status.max_validated_wave {
                if validated_wave >= max(commit_state.1, validation_status.required_wave) {
                    *status = ExecutionStatus::Committed(incarnation);
                    commit_state.0 += 1;
                    self.commit_watermark.store(commit_state.0, Ordering::SeqCst);
                    drop(status);
                    drop(validation_status);

                    if !self.eager {
                        // Unblock graph dependents whose predecessors have
                        // now all committed.
                        for dep in &self.dependents[idx as usize] {
                            if self.predecessors_committed(*dep) {
                                self.execution_idx.fetch_min(*dep, Ordering::SeqCst);
                            }
                        }
                    }
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Return the number of transactions of the batch.
    pub fn num_txns(&self) -> usize {
        self.num_txns
    }

    /// Try to abort version = (txn_idx, incarnation), called upon
    /// validation failure. When the invocation manages to update the
    /// status, Executed(incarnation) => Aborting(incarnation), it returns
    /// true. Since incarnation numbers never decrease, this also ensures
    /// that the same version may not successfully abort more than once.
    pub fn try_abort(&self, txn_idx: TxnIndex, incarnation: Incarnation) -> bool {
        let mut status = self.txn_status[txn_idx as usize].0.lock();
        if *status == ExecutionStatus::Executed(incarnation) {
            *status = ExecutionStatus::Aborting(incarnation);
            true
        } else {
            false
        }
    }

    /// Return the next task for the thread.
    pub fn next_task(&self) -> SchedulerTask {
        loop {
            if self.done() {
                return SchedulerTask::Done;
            }

            let (idx_to_validate, _) =
                Self::unpack_validation_idx(self.validation_idx.load(Ordering::Acquire));
            let idx_to_execute = self.execution_idx.load(Ordering::Acquire);

            if idx_to_execute as usize >= self.num_txns
                && idx_to_validate as usize >= self.num_txns
            {
                return SchedulerTask::NoTask;
            }

            if idx_to_validate < idx_to_execute {
                if let Some((version_to_validate, wave)) = self.try_validate_next_version() {
                    return SchedulerTask::ValidationTask(version_to_validate, wave);
                }
            } else if let Some(version_to_execute) = self.try_execute_next_version() {
                return SchedulerTask::ExecutionTask(version_to_execute);
            }
        }
    }

    /// When a transaction's speculative run observed an estimate of
    /// `dep_txn_idx`, its current incarnation is discarded on the spot and
    /// the transaction returns to the ready state with a bumped
    /// incarnation. It is registered in the blocking transaction's
    /// dependency list so that it gets requeued once that transaction
    /// finishes; if the dependency has resolved in the meantime, it is
    /// requeued immediately instead.
    pub fn finish_execution_with_dependency(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        dep_txn_idx: TxnIndex,
    ) {
        {
            let mut status = self.txn_status[txn_idx as usize].0.lock();
            debug_assert_eq!(*status, ExecutionStatus::Executing(incarnation));
            *status = ExecutionStatus::ReadyToExecute(incarnation + 1);
        }
        if !self.register_dependency(txn_idx, dep_txn_idx) {
            self.execution_idx.fetch_min(txn_idx, Ordering::SeqCst);
        }
    }

    pub fn finish_validation(&self, txn_idx: TxnIndex, wave: Wave) {
        let mut validation_status = self.txn_status[txn_idx as usize].1.lock();
        let max_wave = match validation_status.max_validated_wave {
            Some(prev_wave) => max(prev_wave, wave),
            None => wave,
        };
        validation_status.max_validated_wave = Some(max_wave);
    }

    /// After txn is executed, requeue the transactions that got blocked on
    /// its estimates. If revalidate_suffix is true, decrease validation_idx
    /// to schedule all higher transactions for (re-)validation. Otherwise,
    /// in some cases (if validation_idx is not already lower), return a
    /// validation task of the transaction to the caller.
    pub fn finish_execution(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        revalidate_suffix: bool,
    ) -> SchedulerTask {
        let mut validation_status = self.txn_status[txn_idx as usize].1.lock();
        self.set_executed_status(txn_idx, incarnation);

        let txn_deps: Vec<TxnIndex> = {
            let mut stored_deps = self.txn_dependency[txn_idx as usize].lock();
            std::mem::take(&mut stored_deps)
        };

        // Blocked transactions are already ReadyToExecute; re-open the
        // execution window down to the smallest of them.
        if let Some(execution_target_idx) = txn_deps.into_iter().min() {
            self.execution_idx
                .fetch_min(execution_target_idx, Ordering::SeqCst);
        }

        let (cur_val_idx, cur_wave) =
            Self::unpack_validation_idx(self.validation_idx.load(Ordering::Acquire));

        // If validation_idx is already lower than txn_idx, all required
        // transactions will be considered for validation, and there is
        // nothing to do.
        if cur_val_idx > txn_idx {
            if revalidate_suffix {
                // The transaction execution wrote to a new path w.r.t. its
                // previous completed incarnation, so higher transactions
                // must be revalidated, not only itself.
                if let Some(wave) = self.decrease_validation_idx(txn_idx) {
                    // Under lock, current wave is monotonically increasing,
                    // can simply write.
                    validation_status.max_triggered_wave = wave;
                }
            } else {
                // Only transaction txn_idx requires validation. Return the
                // validation task back to the caller.
                validation_status.required_wave = cur_wave;
                return SchedulerTask::ValidationTask((txn_idx, incarnation), cur_wave);
            }
        }

        SchedulerTask::NoTask
    }

    /// Finalize a validation abort of version (txn_idx, incarnation). When
    /// validation attributed the failure to a specific earlier transaction
    /// that has not finished re-executing, the requeue is deferred until it
    /// does, avoiding an immediately doomed re-execution. Otherwise, a
    /// re-execution task may be returned to the caller.
    pub fn finish_abort(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        blocking_hint: Option<TxnIndex>,
    ) -> SchedulerTask {
        {
            let mut validation_status = self.txn_status[txn_idx as usize].1.lock();
            self.set_aborted_status(txn_idx, incarnation);

            // Schedule higher txns for validation, and couple the wave
            // bump with the locked validation status: no commit may sneak
            // in before the status reflects the new wave.
            if let Some(wave) = self.decrease_validation_idx(txn_idx) {
                validation_status.max_triggered_wave = wave;
            }
        }

        if let Some(hint) = blocking_hint {
            if hint < txn_idx && self.register_dependency(txn_idx, hint) {
                // Requeued by finish_execution of the blocking transaction.
                return SchedulerTask::NoTask;
            }
        }

        if self.execution_idx.load(Ordering::Acquire) > txn_idx {
            // Optimization: execution_idx is higher than txn_idx, but
            // decreasing it may lead to wasted work for all indices between
            // txn_idx and execution_idx. Instead, attempt to create a new
            // incarnation and return the corresponding re-execution task
            // back to the caller.
            if let Some(new_incarnation) = self.try_incarnate(txn_idx) {
                return SchedulerTask::ExecutionTask((txn_idx, new_incarnation));
            }
        }

        SchedulerTask::NoTask
    }
}

/// Private functions of the Scheduler.
impl Scheduler {
    fn unpack_validation_idx(validation_idx: u64) -> (TxnIndex, Wave) {
        (
            (validation_idx & TXN_IDX_MASK) as TxnIndex,
            (validation_idx >> 32) as Wave,
        )
    }

    /// Whether every direct graph predecessor of `txn_idx` has committed.
    /// Commits are strictly in order, so comparing against the commit
    /// watermark suffices.
    fn predecessors_committed(&self, txn_idx: TxnIndex) -> bool {
        let watermark = self.commit_watermark.load(Ordering::SeqCst);
        self.predecessors[txn_idx as usize]
            .iter()
            .all(|pred| *pred < watermark)
    }

    /// When a txn is blocked on another txn's estimate, adds it to the
    /// dependency list of the other txn. Returns false if the dependency
    /// has resolved in the meantime, in which case the caller requeues the
    /// blocked transaction itself.
    fn register_dependency(&self, txn_idx: TxnIndex, dep_txn_idx: TxnIndex) -> bool {
        let mut stored_deps = self.txn_dependency[dep_txn_idx as usize].lock();

        if self.is_executed(dep_txn_idx, true).is_some() {
            // The current status of dep_txn_idx is already executed, so the
            // dependency got resolved. To avoid a zombie dependency (and
            // losing liveness) must not add a (stale) entry.
            //
            // Note: acquires a (different, status) mutex while holding the
            // (dependency) mutex. The only place where a thread may hold
            // more than one mutex, and such acquisitions always happen in
            // the same order here, so they may not deadlock.
            return false;
        }

        // Safe to add the dependency here (still holding the lock):
        // finish_execution of dep_txn_idx is guaranteed to acquire the same
        // lock later and requeue everything it finds.
        stored_deps.push(txn_idx);
        true
    }

    /// Decreases the validation index, adjusting the wave and validation
    /// status as needed.
    fn decrease_validation_idx(&self, target_idx: TxnIndex) -> Option<Wave> {
        if let Ok(prev_val_idx) =
            self.validation_idx
                .fetch_update(Ordering::Acquire, Ordering::SeqCst, |val_idx| {
                    let (txn_idx, wave) = Self::unpack_validation_idx(val_idx);
                    if txn_idx > target_idx {
                        // Pack into validation index.
                        Some((target_idx as u64) | ((wave as u64 + 1) << 32))
                    } else {
                        None
                    }
                })
        {
            let (_, wave) = Self::unpack_validation_idx(prev_val_idx);
            Some(wave + 1)
        } else {
            None
        }
    }

    /// Try to incarnate a transaction. Only possible when the status is
    /// ReadyToExecute(incarnation) and, in gated mode, when every direct
    /// predecessor has committed; the status is then atomically updated to
    /// Executing(incarnation). Since incarnation numbers never decrease,
    /// incarnate may not succeed more than once per version.
    fn try_incarnate(&self, txn_idx: TxnIndex) -> Option<Incarnation> {
        if txn_idx as usize >= self.txn_status.len() {
            return None;
        }
        if !self.eager && !self.predecessors_committed(txn_idx) {
            // Skipped for now; the commit of the last predecessor nudges
            // execution_idx back down to this transaction.
            return None;
        }

        let mut status = self.txn_status[txn_idx as usize].0.lock();
        if let ExecutionStatus::ReadyToExecute(incarnation) = *status {
            let ret = incarnation;
            *status = ExecutionStatus::Executing(incarnation);
            Some(ret)
        } else {
            None
        }
    }

    /// If the status of transaction is Executed(incarnation), returns
    /// Some(incarnation). Useful to determine when a transaction can be
    /// validated, and to avoid a race in dependency registration (where
    /// committed transactions count as executed).
    fn is_executed(&self, txn_idx: TxnIndex, include_committed: bool) -> Option<Incarnation> {
        if txn_idx as usize >= self.txn_status.len() {
            return None;
        }

        let status = self.txn_status[txn_idx as usize].0.lock();
        match *status {
            ExecutionStatus::Executed(incarnation) => Some(incarnation),
            ExecutionStatus::Committed(incarnation) if include_committed => Some(incarnation),
            _ => None,
        }
    }

    /// Grab an index to try and validate next (by fetch-and-incrementing
    /// validation_idx). If the transaction is ready for validation
    /// (Executed state), return the version and observed wave to the
    /// caller, otherwise None.
    fn try_validate_next_version(&self) -> Option<(Version, Wave)> {
        let (idx_to_validate, wave) =
            Self::unpack_validation_idx(self.validation_idx.fetch_add(1, Ordering::SeqCst));

        self.is_executed(idx_to_validate, false)
            .map(|incarnation| ((idx_to_validate, incarnation), wave))
    }

    /// Grab an index to try and execute next (by fetch-and-incrementing
    /// execution_idx). If the transaction can be incarnated, return the
    /// version to the caller for the corresponding ExecutionTask.
    fn try_execute_next_version(&self) -> Option<Version> {
        let idx_to_execute = self.execution_idx.fetch_add(1, Ordering::SeqCst);

        self.try_incarnate(idx_to_execute)
            .map(|incarnation| (idx_to_execute, incarnation))
    }

    /// Set status of the transaction to Executed(incarnation).
    fn set_executed_status(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        let mut status = self.txn_status[txn_idx as usize].0.lock();

        // Only makes sense when the current status is 'Executing'.
        debug_assert_eq!(*status, ExecutionStatus::Executing(incarnation));

        *status = ExecutionStatus::Executed(incarnation);
    }

    /// After a successful abort, mark the transaction as ready for
    /// re-execution with an incremented incarnation number.
    fn set_aborted_status(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        let mut status = self.txn_status[txn_idx as usize].0.lock();

        // Only makes sense when the current status is 'Aborting'.
        debug_assert_eq!(*status, ExecutionStatus::Aborting(incarnation));

        *status = ExecutionStatus::ReadyToExecute(incarnation + 1);
    }

    /// Checks whether the done marker is set. The marker is only set by
    /// 'try_commit' when the commit frontier reaches the batch size.
    fn done(&self) -> bool {
        self.done_marker.load(Ordering::Acquire)
    }
}
