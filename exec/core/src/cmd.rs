// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command objects and the buffer-object contract.
//!
//! A command wraps one packet for its whole life: created on submit, moved
//! through the scheduler states by the worker, recycled on a terminal state.
//! The packet lives either in a caller-owned buffer object or in a private
//! copy lifted out of CQ BRAM by the device-side poller.

use std::sync::Arc;

use accl_exec_types::*;
use parking_lot::Mutex;

use crate::client::ClientCtx;
use crate::exec::ExecCore;

/// Shared buffer object holding a command packet.
///
/// The memory subsystem that produces these is outside this crate; the
/// scheduler relies only on the word storage and on the `active` metadata
/// slot, which names the outstanding command created from this buffer so
/// later submissions can chain onto it. `active` is written only by the
/// scheduler worker.
#[derive(Clone)]
pub struct ExecBuf {
    inner: Arc<BufInner>,
}

struct BufInner {
    words: Mutex<Vec<u32>>,
    active: Mutex<Option<CmdId>>,
}

impl ExecBuf {
    /// Wrap a packet in a new buffer object
    pub fn new(words: Vec<u32>) -> Self {
        debug_assert!(!words.is_empty());
        Self {
            inner: Arc::new(BufInner {
                words: Mutex::new(words),
                active: Mutex::new(None),
            }),
        }
    }

    /// Run `f` against the packet view
    pub fn with_packet<R>(&self, f: impl FnOnce(Packet<'_>) -> R) -> R {
        let words = self.inner.words.lock();
        f(Packet::new(&words))
    }

    /// Run `f` against the raw packet words
    pub fn with_words_mut<R>(&self, f: impl FnOnce(&mut Vec<u32>) -> R) -> R {
        f(&mut self.inner.words.lock())
    }

    /// Command state recorded in the packet header
    pub fn state(&self) -> Option<CmdState> {
        self.with_packet(|p| p.state())
    }

    pub(crate) fn active(&self) -> Option<CmdId> {
        *self.inner.active.lock()
    }

    pub(crate) fn set_active(&self, id: Option<CmdId>) {
        *self.inner.active.lock() = id;
    }
}

/// Packet storage of a command
pub(crate) enum CmdBuffer {
    /// Caller-owned buffer object, host submission path
    Bo(ExecBuf),

    /// Private copy lifted out of CQ BRAM, device-poller path
    Raw(Vec<u32>),
}

impl CmdBuffer {
    pub(crate) fn bo(&self) -> Option<&ExecBuf> {
        match self {
            CmdBuffer::Bo(bo) => Some(bo),
            CmdBuffer::Raw(_) => None,
        }
    }

    pub(crate) fn with_packet<R>(&self, f: impl FnOnce(Packet<'_>) -> R) -> R {
        match self {
            CmdBuffer::Bo(bo) => bo.with_packet(f),
            CmdBuffer::Raw(words) => f(Packet::new(words)),
        }
    }

    pub(crate) fn with_words_mut<R>(&mut self, f: impl FnOnce(&mut Vec<u32>) -> R) -> R {
        match self {
            CmdBuffer::Bo(bo) => bo.with_words_mut(f),
            CmdBuffer::Raw(words) => f(words),
        }
    }

    fn set_header_state(&mut self, state: CmdState) {
        match self {
            CmdBuffer::Bo(bo) => bo.with_words_mut(|words| {
                words[0] = PacketHeader::from(words[0]).with_state(state as u8).into();
            }),
            CmdBuffer::Raw(words) => {
                words[0] = PacketHeader::from(words[0]).with_state(state as u8).into();
            }
        }
    }
}

/// Dependency storage of a command.
///
/// Before queue admission the same slot holds the buffer objects this command
/// waits on; admission resolves them and the slot becomes the list of
/// commands waiting on this one.
pub(crate) enum CmdLinks {
    /// Unresolved buffer dependencies, at most [`MAX_DEPS`]
    Deps(Vec<ExecBuf>),

    /// Commands to trigger on completion, at most [`MAX_CHAIN`]
    Chain(Vec<CmdId>),
}

/// Unit of work tracked by the scheduler
pub(crate) struct ExecCmd {
    pub(crate) id: CmdId,
    pub(crate) state: CmdState,
    pub(crate) exec: Arc<ExecCore>,
    pub(crate) client: Option<Arc<ClientCtx>>,

    /// Command queue slot occupied while Running
    pub(crate) slot_idx: Option<u32>,

    /// CU executing this command, software mode only
    pub(crate) cu_idx: Option<u32>,

    /// BRAM slot this packet arrived in, device-poller path only
    pub(crate) cq_slot_idx: Option<u32>,

    /// Unresolved dependencies remaining before this command may start
    pub(crate) wait_count: u32,

    pub(crate) links: CmdLinks,
    pub(crate) buffer: CmdBuffer,
}

impl ExecCmd {
    pub(crate) fn new(
        id: CmdId,
        exec: Arc<ExecCore>,
        client: Option<Arc<ClientCtx>>,
        buffer: CmdBuffer,
        deps: Vec<ExecBuf>,
    ) -> Self {
        let wait_count = deps.len() as u32;
        Self {
            id,
            state: CmdState::New,
            exec,
            client,
            slot_idx: None,
            cu_idx: None,
            cq_slot_idx: None,
            wait_count,
            links: CmdLinks::Deps(deps),
            buffer,
        }
    }

    /// Reuse a recycled command object for a new submission
    pub(crate) fn reinit(
        &mut self,
        id: CmdId,
        exec: Arc<ExecCore>,
        client: Option<Arc<ClientCtx>>,
        buffer: CmdBuffer,
        deps: Vec<ExecBuf>,
    ) {
        self.id = id;
        self.state = CmdState::New;
        self.exec = exec;
        self.client = client;
        self.slot_idx = None;
        self.cu_idx = None;
        self.cq_slot_idx = None;
        self.wait_count = deps.len() as u32;
        self.links = CmdLinks::Deps(deps);
        self.buffer = buffer;
    }

    pub(crate) fn opcode(&self) -> Option<Opcode> {
        self.buffer.with_packet(|p| p.opcode())
    }

    pub(crate) fn kind(&self) -> CmdKind {
        self.buffer.with_packet(|p| p.kind())
    }

    /// Set internal state only, scheduler bookkeeping states
    pub(crate) fn set_int_state(&mut self, state: CmdState) {
        tracing::debug!(id = self.id, ?state, "set_int_state");
        self.state = state;
    }

    /// Set internal state and reflect it into the packet header so the
    /// submitting process observes it
    pub(crate) fn set_state(&mut self, state: CmdState) {
        tracing::debug!(id = self.id, ?state, "set_state");
        self.state = state;
        self.buffer.set_header_state(state);
    }

    /// Resolve the dependency storage, switching links over to chain mode
    pub(crate) fn take_deps(&mut self) -> Vec<ExecBuf> {
        match std::mem::replace(&mut self.links, CmdLinks::Chain(Vec::new())) {
            CmdLinks::Deps(deps) => deps,
            CmdLinks::Chain(chain) => {
                // already resolved, keep what was there
                self.links = CmdLinks::Chain(chain);
                Vec::new()
            }
        }
    }

    /// Append a waiter to this command's chain
    ///
    /// # Returns
    /// * `Err(())` - Chain is full or the command has not been admitted yet
    pub(crate) fn chain_push(&mut self, waiter: CmdId) -> Result<(), ()> {
        match &mut self.links {
            CmdLinks::Chain(chain) if chain.len() < MAX_CHAIN => {
                chain.push(waiter);
                Ok(())
            }
            _ => Err(()),
        }
    }

    /// Drain the chain for triggering, newest waiter first
    pub(crate) fn take_chain(&mut self) -> Vec<CmdId> {
        match &mut self.links {
            CmdLinks::Chain(chain) => std::mem::take(chain),
            CmdLinks::Deps(_) => Vec::new(),
        }
    }
}
