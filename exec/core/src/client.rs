// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-client scheduler state.
//!
//! Every open handle on a device gets a client context. Completions bump its
//! trigger counter for poll readiness; teardown flips the abort flag and
//! waits for the device to drain before the context is unlinked.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use accl_exec_interface::{ExecError, ExecResult};
use parking_lot::Mutex;
use tracing::instrument;

use crate::exec::{reset_exec, ExecCore};
use crate::scheduler::GLOBAL_SCHEDULER;

/// Teardown polls outstanding commands at this interval
pub const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive no-progress observations before the device counts as stuck
pub const TEARDOWN_TIMEOUT_LOOPS: u32 = 20;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Client (user process) context attached to a device
pub struct ClientCtx {
    id: u64,
    pid: u32,

    /// Queued commands of this client short-circuit to Abort when set
    pub(crate) abort: AtomicBool,

    /// Poll readiness counter, one increment per completion notification
    pub(crate) trigger: AtomicUsize,

    pub(crate) outstanding_execs: AtomicUsize,

    /// Serializes poll calls from threads sharing this handle
    poll_lock: Mutex<()>,
}

impl ClientCtx {
    /// Unique id of this client context
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process id recorded at creation
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Number of commands this client has in flight
    pub fn outstanding_execs(&self) -> usize {
        self.outstanding_execs.load(Ordering::Acquire)
    }
}

/// Create a client context on a device
///
/// The first client of a device resets the exec core so the scheduler state
/// matches a freshly probed device.
pub fn create_client(exec: &Arc<ExecCore>) -> Arc<ClientCtx> {
    let client = Arc::new(ClientCtx {
        id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
        pid: std::process::id(),
        abort: AtomicBool::new(false),
        trigger: AtomicUsize::new(0),
        outstanding_execs: AtomicUsize::new(0),
        poll_lock: Mutex::new(()),
    });

    let first = {
        let mut clients = exec.clients.lock();
        let first = clients.is_empty();
        clients.push(client.clone());
        first
    };
    if first {
        reset_exec(exec);
    }

    tracing::info!(pid = client.pid, client = client.id, "scheduler client created");
    client
}

/// Tear down a client context
///
/// Aborts the client's queued commands and waits for running ones to drain.
/// A device that shows no progress for [`TEARDOWN_TIMEOUT_LOOPS`] intervals
/// is flagged as needing a reset and the wait is abandoned.
///
/// # Error
/// * `ExecError::DeviceStuck` - Outstanding commands never drained
#[instrument(skip_all, fields(client = client.id))]
pub fn destroy_client(exec: &Arc<ExecCore>, client: &Arc<ClientCtx>) -> ExecResult<()> {
    destroy_client_with_timing(exec, client, TEARDOWN_POLL_INTERVAL, TEARDOWN_TIMEOUT_LOOPS)
}

pub(crate) fn destroy_client_with_timing(
    exec: &Arc<ExecCore>,
    client: &Arc<ClientCtx>,
    interval: Duration,
    timeout_loops: u32,
) -> ExecResult<()> {
    // force the scheduler to abort execs for this client
    client.abort.store(true, Ordering::Release);
    GLOBAL_SCHEDULER.wake();

    let mut result = Ok(());
    let mut outstanding = client.outstanding_execs.load(Ordering::Acquire);
    let mut loops = 0u32;
    while outstanding != 0 {
        tracing::info!(outstanding, "waiting for outstanding execs to finish");
        std::thread::sleep(interval);
        let new = client.outstanding_execs.load(Ordering::Acquire);
        loops = if new == outstanding { loops + 1 } else { 0 };
        if loops == timeout_loops {
            tracing::error!(
                outstanding = new,
                "giving up on outstanding execs, device needs reset"
            );
            exec.needs_reset.store(true, Ordering::Release);
            result = Err(ExecError::DeviceStuck(new));
            break;
        }
        outstanding = new;
    }

    tracing::info!(pid = client.pid, client = client.id, "client exits");

    exec.clients
        .lock()
        .retain(|entry| !Arc::ptr_eq(entry, client));

    result
}

/// Wait for a completion notification addressed to this client
///
/// # Arguments
/// * `exec`    - Device the client is attached to
/// * `client`  - Client context
/// * `timeout` - Upper bound on the wait
///
/// # Returns
/// * `bool` - Whether a completion was consumed
pub fn poll_client(exec: &ExecCore, client: &ClientCtx, timeout: Duration) -> bool {
    // one poll at a time per handle; the trigger counter may be incremented
    // concurrently by the worker
    let _serialize = client.poll_lock.lock();

    let deadline = Instant::now() + timeout;
    let mut guard = exec.completion_mutex.lock();
    loop {
        if client.trigger.load(Ordering::Acquire) > 0 {
            client.trigger.fetch_sub(1, Ordering::AcqRel);
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        let _ = exec.completion_cond.wait_until(&mut guard, deadline);
    }
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
    fn test_first_client_resets_exec() {
        let exec = test_exec();
        {
            let mut st = exec.state.lock();
            st.configured = true;
            st.num_slots = 64;
        }
        let client = create_client(&exec);
        let snap = exec.snapshot();
        assert!(!snap.configured);
        assert_eq!(snap.num_slots, 16);
        destroy_client(&exec, &client).unwrap();
        assert!(exec.clients.lock().is_empty());
    }

    #[test]
    fn test_second_client_does_not_reset() {
        let exec = test_exec();
        let first = create_client(&exec);
        {
            let mut st = exec.state.lock();
            st.configured = true;
        }
        let second = create_client(&exec);
        assert!(exec.snapshot().configured);
        destroy_client(&exec, &second).unwrap();
        destroy_client(&exec, &first).unwrap();
    }

    #[test]
    fn test_stuck_teardown_flags_reset() {
        let exec = test_exec();
        let client = create_client(&exec);
        client.outstanding_execs.store(1, Ordering::Release);

        let err = destroy_client_with_timing(&exec, &client, Duration::from_millis(1), 3);
        assert_eq!(err, Err(ExecError::DeviceStuck(1)));
        assert!(exec.needs_reset());
        // the context is unlinked even when the device is stuck
        assert!(exec.clients.lock().is_empty());
    }

    #[test]
    fn test_poll_times_out_without_completions() {
        let exec = test_exec();
        let client = create_client(&exec);
        assert!(!poll_client(&exec, &client, Duration::from_millis(5)));

        client.trigger.store(2, Ordering::Release);
        assert!(poll_client(&exec, &client, Duration::from_millis(5)));
        assert!(poll_client(&exec, &client, Duration::from_millis(5)));
        assert!(!poll_client(&exec, &client, Duration::from_millis(5)));
        destroy_client(&exec, &client).unwrap();
    }
}
