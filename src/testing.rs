//! Test doubles and fixtures shared by the engine's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::Settings;
use crate::enqueue::EnqueueInfo;
use crate::error::{Error, Result};
use crate::export::Export;
use crate::import::Import;
use crate::lock::{CallbackSet, Lock, LockMode, LockType, LvbType, PolicyData};
use crate::namespace::{ConnectCaps, Namespace};
use crate::resource::ResourceId;
use crate::transport::{InterpretFn, Request, RpcCode, SendState, Transport};
use crate::wire::{DlmReply, LockDesc, Opcode, PortalPair};

/// One scripted RPC outcome. A `None` reply with an `Ok` code makes
/// the mock echo the request as an immediate grant.
pub(crate) struct Scripted {
    pub code: RpcCode,
    pub reply: Option<DlmReply>,
}

/// Snapshot of a request at the moment it hit the wire.
#[derive(Debug, Clone)]
pub(crate) struct SentRequest {
    pub opcode: Opcode,
    pub portals: PortalPair,
    pub flags: u64,
    pub lock_count: u32,
    pub handles: Vec<u64>,
    pub send_state: SendState,
    pub replay_done: bool,
    pub reply_size: usize,
    pub async_dispatch: bool,
}

/// Scriptable in-memory transport: replies come from a FIFO script,
/// defaulting to an immediate grant that echoes the request.
pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    pub sent: Mutex<Vec<SentRequest>>,
    pub failed_imports: Mutex<Vec<u32>>,
    pub connects: AtomicUsize,
    pub advances: AtomicUsize,
    next_remote: AtomicU64,
    alloc_fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<MockTransport> {
        Arc::new(MockTransport {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            failed_imports: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            advances: AtomicUsize::new(0),
            next_remote: AtomicU64::new(0x1000),
            alloc_fail: AtomicBool::new(false),
        })
    }

    pub fn push_script(&self, code: RpcCode, reply: Option<DlmReply>) {
        self.script.lock().push_back(Scripted { code, reply });
    }

    /// Makes the next allocation fail.
    pub fn fail_next_alloc(&self) {
        self.alloc_fail.store(true, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn echo_grant(&self, req: &Request) -> DlmReply {
        DlmReply {
            flags: 0,
            handle: self.next_remote.fetch_add(1, Ordering::Relaxed),
            desc: req.body.desc.clone(),
            lvb: None,
        }
    }

    fn record(&self, req: &Request, async_dispatch: bool) {
        self.sent.lock().push(SentRequest {
            opcode: req.opcode,
            portals: req.portals,
            flags: req.body.flags,
            lock_count: req.body.lock_count,
            handles: req.body.handles.clone(),
            send_state: req.send_state,
            replay_done: req.replay_done,
            reply_size: req.reply_size,
            async_dispatch,
        });
    }

    fn next_outcome(&self, req: &Request) -> (RpcCode, Option<DlmReply>) {
        match self.script.lock().pop_front() {
            Some(Scripted { code, reply }) => {
                let reply = reply.or_else(|| code.is_ok().then(|| self.echo_grant(req)));
                (code, reply)
            }
            None => (RpcCode::Ok, Some(self.echo_grant(req))),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn new_request(
        &self,
        import: &Arc<Import>,
        opcode: Opcode,
        desc: LockDesc,
    ) -> Result<Request> {
        if self.alloc_fail.swap(false, Ordering::SeqCst) {
            return Err(Error::NoMem);
        }
        Ok(Request::new(import, opcode, desc))
    }

    async fn queue_wait(&self, req: &mut Request) -> RpcCode {
        self.record(req, false);
        let (code, reply) = self.next_outcome(req);
        req.reply = reply;
        code
    }

    fn dispatch(&self, mut req: Request, interpret: Option<InterpretFn>) {
        self.record(&req, true);
        let (code, reply) = self.next_outcome(&req);
        req.reply = reply;
        if let Some(interpret) = interpret {
            interpret(&mut req, code);
        }
    }

    fn fail_import(&self, _import: &Arc<Import>, conn_cnt: u32) {
        self.failed_imports.lock().push(conn_cnt);
    }

    fn connect_import(&self, _import: &Arc<Import>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn recovery_advance(&self, _import: &Arc<Import>) {
        self.advances.fetch_add(1, Ordering::SeqCst);
    }
}

/// Settings with a short completion floor so timeout paths stay fast.
pub(crate) fn test_settings() -> Settings {
    Settings { enqueue_min: 1, obd_timeout: 1, ..Settings::default() }
}

pub(crate) fn full_caps() -> ConnectCaps {
    ConnectCaps { cancelset: true, lru_resize: true, ibits: true }
}

/// Namespace, import and export wired together for one mock server.
pub(crate) fn test_env(caps: ConnectCaps) -> (Arc<Namespace>, Arc<Import>, Arc<Export>) {
    let ns = Namespace::new("test-target", caps, &test_settings());
    let imp = Import::new(&ns);
    let exp = Export::new(&imp);
    (ns, imp, exp)
}

pub(crate) fn res_id(n: u64) -> ResourceId {
    ResourceId([n, 0, 0, 0])
}

pub(crate) fn plain_einfo(mode: LockMode) -> EnqueueInfo {
    EnqueueInfo {
        lock_type: LockType::Plain,
        mode,
        callbacks: CallbackSet::default(),
        // Present so granted-after-wait paths feed the estimator.
        ast_data: Some(Arc::new(())),
    }
}

/// Builds a granted, unused lock parked on the namespace LRU, the way
/// a completed-and-released enqueue leaves it.
pub(crate) fn granted_unused_lock(
    ns: &Arc<Namespace>,
    exp: &Arc<Export>,
    n: u64,
    lock_type: LockType,
) -> Arc<Lock> {
    let lock = Lock::create(
        ns,
        res_id(n),
        lock_type,
        LockMode::Pr,
        CallbackSet::default(),
        None,
        0,
        LvbType::None,
    );
    lock.set_conn_export(exp.clone());
    lock.addref_internal(LockMode::Pr);
    if lock_type == LockType::Ibits {
        lock.state().policy = PolicyData::Ibits { bits: 0xff };
    }
    lock.install_from_reply(crate::lock::LockFlags::empty());
    lock.state().remote_handle = 0x8000 + n;
    lock.decref(LockMode::Pr);
    lock
}
