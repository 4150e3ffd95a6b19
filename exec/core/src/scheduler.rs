// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command scheduler worker.
//!
//! One long-lived thread advances every command in the process: it drains
//! the pending list into its own command queue, resolves buffer dependencies
//! into chains, and walks each command through the state machine. Producers
//! (submissions, the ISR, the device-side poller) only touch the pending
//! list and the wake flags; slot and CU bitmaps, the submitted-slot table,
//! and the command queue itself have a single writer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use accl_exec_interface::{ExecError, ExecResult};
use accl_exec_types::*;
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use tracing::instrument;

use crate::client::ClientCtx;
use crate::cmd::{CmdBuffer, ExecBuf, ExecCmd};
use crate::exec::{ExecCore, ExecState};
use crate::ops::QueryResult;
use crate::{masks, pool};

lazy_static! {
    pub(crate) static ref GLOBAL_SCHEDULER: Scheduler = Scheduler::new();
}

/// Scheduler for command objects, one worker thread process-wide
pub(crate) struct Scheduler {
    wait_mutex: Mutex<()>,
    wait_cond: Condvar,

    /// Pending interrupt, shared with the ISR
    pub(crate) intc: AtomicBool,

    /// Number of running commands that need polled completion
    pub(crate) poll: AtomicUsize,

    pub(crate) stop: AtomicBool,
    pub(crate) error: AtomicBool,

    /// Command queue; locked only by the worker while it runs
    queue: Mutex<CmdTable>,

    thread: Mutex<SchedThread>,
}

struct SchedThread {
    use_count: usize,
    handle: Option<JoinHandle<()>>,
}

/// Commands owned by the scheduler, in admission order
#[derive(Default)]
pub(crate) struct CmdTable {
    order: VecDeque<CmdId>,
    cmds: HashMap<CmdId, ExecCmd>,
}

/// Record a scheduler assertion
///
/// A true condition marks the scheduler broken; the worker exits at the next
/// loop and recovery requires a restart or a device reset.
pub(crate) fn sched_error_on(sched: &Scheduler, cond: bool, msg: &str) -> bool {
    if cond {
        tracing::error!("scheduler assertion: {msg}");
        sched.error.store(true, Ordering::Release);
    }
    cond
}

impl Scheduler {
    fn new() -> Self {
        Self {
            wait_mutex: Mutex::new(()),
            wait_cond: Condvar::new(),
            intc: AtomicBool::new(false),
            poll: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            error: AtomicBool::new(false),
            queue: Mutex::new(CmdTable::default()),
            thread: Mutex::new(SchedThread {
                use_count: 0,
                handle: None,
            }),
        }
    }

    /// Wake the worker thread
    pub(crate) fn wake(&self) {
        let _guard = self.wait_mutex.lock();
        self.wait_cond.notify_all();
    }

    /// Check the wake conditions, consuming the interrupt flag
    fn wait_condition(&self) -> bool {
        if self.stop.load(Ordering::Acquire) || self.error.load(Ordering::Acquire) {
            return true;
        }
        if pool::num_pending() > 0 {
            tracing::debug!("scheduler wakes to copy new pending commands");
            return true;
        }
        if self.intc.swap(false, Ordering::AcqRel) {
            tracing::debug!("scheduler wakes on interrupt");
            return true;
        }
        if self.poll.load(Ordering::Acquire) > 0 {
            tracing::debug!("scheduler wakes to poll");
            return true;
        }
        false
    }

    fn wait(&self) {
        let mut guard = self.wait_mutex.lock();
        while !self.wait_condition() {
            self.wait_cond.wait(&mut guard);
        }
    }

    /// Worker thread routine
    fn worker(&self) {
        tracing::debug!("scheduler thread started");
        let mut loop_cnt = 0u32;
        loop {
            self.wait();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.error.load(Ordering::Acquire) {
                tracing::info!("scheduler encountered unexpected error and exits");
                break;
            }

            {
                let mut table = self.queue.lock();
                self.queue_cmds(&mut table);
                self.iterate_cmds(&mut table);
            }

            loop_cnt += 1;
            if loop_cnt >= MAX_SCHED_LOOP {
                loop_cnt = 0;
                std::thread::yield_now();
            }
        }
        tracing::info!(
            error = self.error.load(Ordering::Acquire),
            "scheduler thread exits"
        );
    }

    /// Queue any pending commands
    ///
    /// Commands move from the pending list into the scheduler command queue
    /// and become Queued, with their buffer dependencies resolved to chains.
    /// From here on the buffer object names this command as its active one.
    fn queue_cmds(&self, table: &mut CmdTable) {
        for mut cmd in pool::take_pending() {
            tracing::debug!(id = cmd.id, "queueing cmd");

            if cmd.wait_count > 0 && self.chain_dependencies(table, &mut cmd).is_err() {
                cmd.set_state(CmdState::Error);
            } else {
                cmd.set_int_state(CmdState::Queued);
            }

            if let Some(bo) = cmd.buffer.bo() {
                bo.set_active(Some(cmd.id));
            }

            table.order.push_back(cmd.id);
            table.cmds.insert(cmd.id, cmd);
        }
    }

    /// Chain a command to the active commands behind its dependencies
    ///
    /// The wait count drops for each dependency whose buffer no longer names
    /// an active command; those completed some time before admission and are
    /// deliberately not re-checked.
    fn chain_dependencies(&self, table: &mut CmdTable, cmd: &mut ExecCmd) -> Result<(), ()> {
        tracing::debug!(id = cmd.id, wait_count = cmd.wait_count, "chain_dependencies");
        for dep in cmd.take_deps() {
            let Some(chain_id) = dep.active() else {
                cmd.wait_count -= 1;
                continue;
            };
            let Some(chain_to) = table.cmds.get_mut(&chain_id) else {
                // the active command retired without clearing the buffer
                cmd.wait_count -= 1;
                continue;
            };
            if chain_to.chain_push(cmd.id).is_err() {
                tracing::info!(id = cmd.id, predecessor = chain_id, "chain count exceeded");
                return Err(());
            }
            tracing::debug!(predecessor = chain_id, waiter = cmd.id, "chained");
        }
        Ok(())
    }

    /// Iterate all commands in the scheduler command queue
    fn iterate_cmds(&self, table: &mut CmdTable) {
        let rounds = table.order.len();
        for _ in 0..rounds {
            let Some(id) = table.order.pop_front() else {
                break;
            };
            let Some(mut cmd) = table.cmds.remove(&id) else {
                continue;
            };

            self.update_cmd_state(&mut cmd);
            tracing::debug!(id = cmd.id, state = ?cmd.state, "processing cmd");

            let core = cmd.exec.clone();
            {
                let mut st = core.state.lock();
                if cmd.state == CmdState::Queued {
                    self.try_start(&core, &mut st, &mut cmd);
                }
                if cmd.state == CmdState::Running {
                    self.running_to_complete(&core, &mut st, table, &mut cmd);
                }
            }

            match cmd.state {
                CmdState::Completed => self.complete_to_free(cmd),
                CmdState::Error => self.error_to_free(cmd),
                CmdState::Abort => self.abort_to_free(cmd),
                _ => {
                    table.order.push_back(id);
                    table.cmds.insert(id, cmd);
                }
            }
        }
    }

    /// Short-circuit commands of aborting clients; running commands drain
    fn update_cmd_state(&self, cmd: &mut ExecCmd) {
        if cmd.state == CmdState::Running {
            return;
        }
        if let Some(client) = &cmd.client {
            if client.abort.load(Ordering::Acquire) {
                cmd.set_state(CmdState::Abort);
            }
        }
    }

    /// Move a command from queued to running state if possible
    ///
    /// Configure and register-write commands execute inline first; everything
    /// else is the back-end's business. On success the command holds a slot
    /// and is tracked in the submitted-slot table.
    fn try_start(&self, core: &Arc<ExecCore>, st: &mut ExecState, cmd: &mut ExecCmd) -> bool {
        if cmd.wait_count > 0 {
            return false;
        }

        let opcode = cmd.opcode();
        tracing::debug!(id = cmd.id, ?opcode, "queued_to_running");

        if opcode == Some(Opcode::Configure) {
            if let Err(err) = crate::exec::configure(self, core, st, cmd) {
                tracing::error!(id = cmd.id, %err, "configure failed");
                cmd.set_state(CmdState::Error);
                return false;
            }
        }

        if opcode == Some(Opcode::Write) {
            if let Err(err) = crate::exec::exec_write(core, cmd) {
                tracing::error!(id = cmd.id, %err, "write command failed");
                cmd.set_state(CmdState::Error);
                return false;
            }
        }

        if st.ops.dispatch().submit(self, core, st, cmd) {
            cmd.set_int_state(CmdState::Running);
            if st.polling_mode || core.device_side() {
                self.poll.fetch_add(1, Ordering::AcqRel);
            }
            if let Some(slot) = cmd.slot_idx {
                st.submitted_cmds[slot as usize] = Some(cmd.id);
            }
            return true;
        }

        false
    }

    /// Check status of a running command
    fn running_to_complete(
        &self,
        core: &Arc<ExecCore>,
        st: &mut ExecState,
        table: &mut CmdTable,
        cmd: &mut ExecCmd,
    ) {
        match st.ops.dispatch().query(self, core, st, cmd) {
            QueryResult::Pending => {}
            QueryResult::Done => self.mark_cmd_complete(core, st, table, cmd),
            QueryResult::MaskDone { mask, mask_idx } => {
                self.mark_mask_complete(core, st, table, cmd, mask, mask_idx)
            }
        }
    }

    /// Move a command to complete state
    ///
    /// The slot is released for new submissions, the host is notified, the
    /// buffer stops naming this command, and all chained waiters get their
    /// wait count dropped, starting synchronously at zero.
    fn mark_cmd_complete(
        &self,
        core: &Arc<ExecCore>,
        st: &mut ExecState,
        table: &mut CmdTable,
        cmd: &mut ExecCmd,
    ) {
        let Some(slot) = cmd.slot_idx else {
            sched_error_on(self, true, "completed command without a slot");
            return;
        };
        tracing::debug!(id = cmd.id, slot, "mark_cmd_complete");

        st.submitted_cmds[slot as usize] = None;
        cmd.set_state(CmdState::Completed);
        if st.polling_mode || core.device_side() {
            self.poll.fetch_sub(1, Ordering::AcqRel);
        }
        st.release_slot(slot);
        self.notify_host(core, cmd);

        cmd.cu_idx = None;
        cmd.slot_idx = None;
        if let Some(bo) = cmd.buffer.bo() {
            bo.set_active(None);
        }
        self.trigger_chain(st, table, cmd);
    }

    /// Move all commands flagged in a status mask to complete state
    fn mark_mask_complete(
        &self,
        core: &Arc<ExecCore>,
        st: &mut ExecState,
        table: &mut CmdTable,
        cmd: &mut ExecCmd,
        mask: u32,
        mask_idx: u32,
    ) {
        tracing::debug!("mark_mask_complete 0x{mask:x} word {mask_idx}");
        if mask == 0 {
            return;
        }
        for bit in 0..32u32 {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let slot = masks::idx_from_mask(bit, mask_idx);
            let Some(submitted_id) = st.submitted_cmds[slot as usize] else {
                sched_error_on(self, true, "no submitted cmd for completed slot");
                continue;
            };
            if submitted_id == cmd.id {
                self.mark_cmd_complete(core, st, table, cmd);
            } else {
                let Some(mut other) = table.cmds.remove(&submitted_id) else {
                    sched_error_on(self, true, "completed cmd not in scheduler queue");
                    continue;
                };
                self.mark_cmd_complete(core, st, table, &mut other);
                table.cmds.insert(submitted_id, other);
            }
        }
    }

    /// Trigger the execution of commands chained to a completed command
    fn trigger_chain(&self, st: &mut ExecState, table: &mut CmdTable, cmd: &mut ExecCmd) {
        for waiter_id in cmd.take_chain().into_iter().rev() {
            let Some(mut waiter) = table.cmds.remove(&waiter_id) else {
                tracing::debug!(waiter = waiter_id, "chained waiter already retired");
                continue;
            };
            tracing::debug!(
                id = cmd.id,
                waiter = waiter_id,
                wait_count = waiter.wait_count,
                "trigger_chain"
            );
            if sched_error_on(self, waiter.wait_count == 0, "expected positive wait count") {
                table.cmds.insert(waiter_id, waiter);
                continue;
            }
            waiter.wait_count -= 1;
            if waiter.wait_count == 0 && waiter.state == CmdState::Queued {
                let wexec = waiter.exec.clone();
                if Arc::ptr_eq(&wexec, &cmd.exec) {
                    self.try_start(&wexec, st, &mut waiter);
                } else {
                    let mut wst = wexec.state.lock();
                    self.try_start(&wexec, &mut wst, &mut waiter);
                }
            }
            table.cmds.insert(waiter_id, waiter);
        }
    }

    /// Notify the submitting side that a command completed
    ///
    /// Host-side cores bump every client's trigger counter and wake the poll
    /// waiters; a device-side core instead raises the slot bit in the
    /// host-facing status register.
    fn notify_host(&self, core: &ExecCore, cmd: &ExecCmd) {
        tracing::debug!(id = cmd.id, "notify_host");
        if let (Some(region), Some(cq_slot)) = (&core.ert_region, cmd.cq_slot_idx) {
            let csr_offset = ert_hw::HOST_STATUS_REG + (masks::mask_idx(cq_slot) << 2);
            region.hw.write32(csr_offset, 1 << masks::idx_in_mask(cq_slot));
            return;
        }
        for client in core.clients.lock().iter() {
            client.trigger.fetch_add(1, Ordering::AcqRel);
        }
        let _guard = core.completion_mutex.lock();
        core.completion_cond.notify_all();
    }

    fn complete_to_free(&self, cmd: ExecCmd) {
        tracing::debug!(id = cmd.id, "complete_to_free");
        self.cleanup_exec(cmd);
    }

    fn error_to_free(&self, cmd: ExecCmd) {
        tracing::debug!(id = cmd.id, "error_to_free");
        self.notify_host(&cmd.exec, &cmd);
        self.cleanup_exec(cmd);
    }

    fn abort_to_free(&self, cmd: ExecCmd) {
        tracing::debug!(id = cmd.id, "abort_to_free");
        self.cleanup_exec(cmd);
    }

    /// Drop the command's accounting and recycle the object
    fn cleanup_exec(&self, cmd: ExecCmd) {
        cmd.exec.outstanding_execs.fetch_sub(1, Ordering::AcqRel);
        if let Some(client) = &cmd.client {
            client.outstanding_execs.fetch_sub(1, Ordering::AcqRel);
        }
        pool::recycle_cmd(cmd);
    }
}

/// Initialize the scheduler thread if necessary
///
/// Calls nest; the thread starts on the first call and stops when the last
/// user calls [`stop_scheduler`].
pub fn start_scheduler() {
    let sched = &*GLOBAL_SCHEDULER;
    let mut th = sched.thread.lock();
    th.use_count += 1;
    tracing::debug!(use_count = th.use_count, "init scheduler thread");
    if th.use_count > 1 {
        return;
    }

    sched.stop.store(false, Ordering::Release);
    sched.error.store(false, Ordering::Release);
    sched.intc.store(false, Ordering::Release);
    sched.poll.store(0, Ordering::Release);

    #[allow(
        clippy::expect_used,
        reason = "thread creation failing at startup is not recoverable"
    )]
    let handle = std::thread::Builder::new()
        .name("accl-scheduler-thread0".into())
        .spawn(|| GLOBAL_SCHEDULER.worker())
        .expect("failed to spawn scheduler thread");
    th.handle = Some(handle);
}

/// Finalize the scheduler thread if unused
///
/// The last user joins the worker, force-recycles anything still pending or
/// queued, and reclaims the command freelist.
pub fn stop_scheduler() {
    let sched = &*GLOBAL_SCHEDULER;
    let mut th = sched.thread.lock();
    if th.use_count == 0 {
        return;
    }
    th.use_count -= 1;
    tracing::debug!(use_count = th.use_count, "fini scheduler thread");
    if th.use_count > 0 {
        return;
    }

    sched.stop.store(true, Ordering::Release);
    sched.wake();
    if let Some(handle) = th.handle.take() {
        let _ = handle.join();
    }

    reset_all(sched);
    pool::delete_cmd_list();
}

/// Whether the scheduler recorded an internal error
pub fn scheduler_error() -> bool {
    GLOBAL_SCHEDULER.error.load(Ordering::Acquire)
}

/// Force-recycle every pending and queued command
fn reset_all(sched: &Scheduler) {
    for cmd in pool::take_pending() {
        tracing::info!(id = cmd.id, "deleting stale pending cmd");
        sched.cleanup_exec(cmd);
    }
    let mut table = sched.queue.lock();
    table.order.clear();
    let cmds: Vec<ExecCmd> = table.cmds.drain().map(|(_, cmd)| cmd).collect();
    drop(table);
    for cmd in cmds {
        tracing::info!(id = cmd.id, "deleting stale scheduler cmd");
        sched.cleanup_exec(cmd);
    }
}

/// Force-recycle stale commands belonging to one device
///
/// Part of resetting an exec core; safe to call while the worker runs, the
/// queue lock serializes against iteration.
pub(crate) fn purge_exec_cmds(core: &Arc<ExecCore>) {
    let sched = &*GLOBAL_SCHEDULER;
    for cmd in pool::take_pending_for(core) {
        tracing::info!(id = cmd.id, "deleting stale pending cmd");
        sched.cleanup_exec(cmd);
    }

    let mut table = sched.queue.lock();
    let stale: Vec<CmdId> = table
        .cmds
        .iter()
        .filter(|(_, cmd)| Arc::ptr_eq(&cmd.exec, core))
        .map(|(id, _)| *id)
        .collect();
    let mut removed = Vec::with_capacity(stale.len());
    for id in stale {
        if let Some(cmd) = table.cmds.remove(&id) {
            removed.push(cmd);
        }
    }
    let CmdTable { order, cmds } = &mut *table;
    order.retain(|id| cmds.contains_key(id));
    drop(table);

    for cmd in removed {
        tracing::info!(id = cmd.id, "deleting stale scheduler cmd");
        sched.cleanup_exec(cmd);
    }
}

/// Entry point for exec buffer submission
///
/// Wraps the buffer in a command object and adds it to the pending list of
/// commands; the worker picks it up from there.
///
/// # Arguments
/// * `exec`   - Target device
/// * `client` - Submitting client context
/// * `bo`     - Buffer object holding the command packet
/// * `deps`   - Buffer objects this command must wait on, at most
///   [`MAX_DEPS`]
///
/// # Error
/// * `ExecError` - Too many dependencies
#[instrument(skip_all, fields(client = client.id()))]
pub fn add_exec_buffer(
    exec: &Arc<ExecCore>,
    client: &Arc<ClientCtx>,
    bo: &ExecBuf,
    deps: &[ExecBuf],
) -> ExecResult<()> {
    if deps.len() > MAX_DEPS {
        return Err(ExecError::BadPacket("too many dependencies"));
    }
    if !bo.with_packet(|p| p.well_formed()) {
        return Err(ExecError::BadPacket("truncated command packet"));
    }

    let cmd = pool::get_free_cmd(
        exec.clone(),
        Some(client.clone()),
        CmdBuffer::Bo(bo.clone()),
        deps.to_vec(),
    );
    pool::add_cmd(cmd);
    GLOBAL_SCHEDULER.wake();
    Ok(())
}
