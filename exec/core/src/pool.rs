// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide command pool and pending queue.
//!
//! Command objects are recycled through a freelist and only dropped when the
//! scheduler shuts down. Newly submitted commands sit in the pending list
//! until the worker copies them into its own queue; `NUM_PENDING` mirrors the
//! list length so the wait predicate never takes the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use accl_exec_types::CmdState;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::client::ClientCtx;
use crate::cmd::{CmdBuffer, ExecBuf, ExecCmd};
use crate::exec::ExecCore;

lazy_static! {
    static ref FREE_CMDS: Mutex<Vec<ExecCmd>> = Mutex::new(Vec::new());
    static ref PENDING_CMDS: Mutex<VecDeque<ExecCmd>> = Mutex::new(VecDeque::new());
}

static NUM_PENDING: AtomicUsize = AtomicUsize::new(0);
static NEXT_CMD_ID: AtomicU64 = AtomicU64::new(0);

/// Number of commands waiting for admission
pub(crate) fn num_pending() -> usize {
    NUM_PENDING.load(Ordering::Acquire)
}

/// Get a command object from the freelist, or allocate one
pub(crate) fn get_free_cmd(
    exec: Arc<ExecCore>,
    client: Option<Arc<ClientCtx>>,
    buffer: CmdBuffer,
    deps: Vec<ExecBuf>,
) -> ExecCmd {
    let id = NEXT_CMD_ID.fetch_add(1, Ordering::Relaxed);
    let recycled = FREE_CMDS.lock().pop();
    match recycled {
        Some(mut cmd) => {
            cmd.reinit(id, exec, client, buffer, deps);
            cmd
        }
        None => ExecCmd::new(id, exec, client, buffer, deps),
    }
}

/// Attach a filled command to the pending list and account for it
///
/// The caller wakes the scheduler afterwards; admission happens on the
/// worker thread.
pub(crate) fn add_cmd(mut cmd: ExecCmd) {
    cmd.set_state(CmdState::New);

    if let Some(client) = &cmd.client {
        client.outstanding_execs.fetch_add(1, Ordering::AcqRel);
    }
    cmd.exec.outstanding_execs.fetch_add(1, Ordering::AcqRel);
    cmd.exec.total_execs.fetch_add(1, Ordering::Relaxed);

    tracing::debug!(id = cmd.id, opcode = ?cmd.opcode(), kind = ?cmd.kind(), "add_cmd");

    PENDING_CMDS.lock().push_back(cmd);
    NUM_PENDING.fetch_add(1, Ordering::AcqRel);
}

/// Move every pending command over to the caller
pub(crate) fn take_pending() -> Vec<ExecCmd> {
    let mut pending = PENDING_CMDS.lock();
    let drained: Vec<ExecCmd> = pending.drain(..).collect();
    NUM_PENDING.fetch_sub(drained.len(), Ordering::AcqRel);
    drained
}

/// Remove pending commands belonging to `exec`, for stale-command cleanup
pub(crate) fn take_pending_for(exec: &Arc<ExecCore>) -> Vec<ExecCmd> {
    let mut pending = PENDING_CMDS.lock();
    let mut taken = Vec::new();
    let mut keep = VecDeque::with_capacity(pending.len());
    for cmd in pending.drain(..) {
        if Arc::ptr_eq(&cmd.exec, exec) {
            taken.push(cmd);
        } else {
            keep.push_back(cmd);
        }
    }
    *pending = keep;
    NUM_PENDING.fetch_sub(taken.len(), Ordering::AcqRel);
    taken
}

/// Return a command object to the freelist
///
/// The packet storage is released here; the recycled object keeps nothing
/// that pins client or buffer lifetime.
pub(crate) fn recycle_cmd(mut cmd: ExecCmd) {
    tracing::debug!(id = cmd.id, "recycle_cmd");
    cmd.buffer = CmdBuffer::Raw(Vec::new());
    cmd.links = crate::cmd::CmdLinks::Chain(Vec::new());
    cmd.client = None;
    FREE_CMDS.lock().push(cmd);
}

/// Reclaim every recycled command object
pub(crate) fn delete_cmd_list() {
    FREE_CMDS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use accl_exec_interface::DevCaps;

    fn test_exec() -> Arc<ExecCore> {
        ExecCore::new(
            Arc::new(crate::exec::tests::NullRegIo),
            DevCaps::default(),
            None,
        )
    }

    #[test]
    fn test_freelist_recycles_objects() {
        let exec = test_exec();
        let cmd = get_free_cmd(
            exec.clone(),
            None,
            CmdBuffer::Raw(vec![0]),
            Vec::new(),
        );
        let first_id = cmd.id;
        recycle_cmd(cmd);

        let cmd = get_free_cmd(exec, None, CmdBuffer::Raw(vec![0]), Vec::new());
        // ids keep counting even when the object is reused
        assert!(cmd.id > first_id);
        assert_eq!(cmd.state, CmdState::New);
        assert_eq!(cmd.wait_count, 0);
        recycle_cmd(cmd);
        delete_cmd_list();
    }
}
