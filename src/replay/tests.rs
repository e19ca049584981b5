use std::sync::Arc;

use super::*;
use crate::lock::{CallbackSet, Lock, LockMode, LockType, LvbType};
use crate::namespace::ConnectCaps;
use crate::testing::{granted_unused_lock, res_id, test_env, test_settings, MockTransport};
use crate::wire::Opcode;

fn setup() -> (
    Arc<MockTransport>,
    Arc<dyn Transport>,
    Arc<crate::namespace::Namespace>,
    Arc<Import>,
    Arc<crate::export::Export>,
) {
    let mock = MockTransport::new();
    let transport: Arc<dyn Transport> = mock.clone();
    let (ns, imp, exp) = test_env(ConnectCaps { cancelset: true, lru_resize: true, ibits: true });
    (mock, transport, ns, imp, exp)
}

/// A lock still waiting for its grant when the connection dropped.
fn waiting_lock(
    ns: &Arc<crate::namespace::Namespace>,
    exp: &Arc<crate::export::Export>,
    n: u64,
) -> Arc<Lock> {
    let lock = Lock::create(
        ns,
        res_id(n),
        LockType::Plain,
        LockMode::Cw,
        CallbackSet::default(),
        None,
        0,
        LvbType::None,
    );
    lock.set_conn_export(exp.clone());
    lock.addref_internal(LockMode::Cw);
    lock.install_from_reply(LockFlags::BLOCK_WAIT);
    lock
}

#[tokio::test]
async fn replay_classifies_dispositions() {
    let (mock, transport, ns, imp, exp) = setup();

    let granted = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    granted.addref(LockMode::Pr).unwrap();
    let waiting = waiting_lock(&ns, &exp, 2);

    replay_locks(&transport, &imp).await.expect("replay succeeds");

    let sent = mock.sent.lock();
    assert_eq!(sent.len(), 2);
    for s in sent.iter() {
        assert_eq!(s.opcode, Opcode::Enqueue);
        assert_eq!(s.send_state, SendState::ReplayLocks);
        assert!(s.replay_done);
        assert!(s.async_dispatch);
        assert_eq!(s.reply_size, 0, "reply buffer sized to the LVB length");
    }

    let flags_of = |cookie: u64| {
        sent.iter()
            .find(|s| s.handles[0] == cookie)
            .map(|s| LockFlags::from_wire(s.flags))
            .expect("replayed")
    };
    assert_eq!(
        flags_of(granted.cookie()),
        LockFlags::REPLAY | LockFlags::BLOCK_GRANTED
    );
    assert_eq!(
        flags_of(waiting.cookie()),
        LockFlags::REPLAY | LockFlags::BLOCK_WAIT
    );
    drop(sent);

    // Both interpret callbacks ran inline: the counter is back to
    // zero and recovery advanced twice.
    assert_eq!(imp.replay_inflight(), 0);
    assert_eq!(mock.advances.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn replay_updates_remote_handles() {
    let (mock, transport, ns, imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    let old_remote = lock.remote_handle();

    replay_locks(&transport, &imp).await.unwrap();

    assert_ne!(lock.remote_handle(), old_remote);
    assert!(exp.lock_by_remote(lock.remote_handle()).is_some());
    assert!(exp.lock_by_remote(old_remote).is_none());
    assert_eq!(mock.sent_count(), 1);
}

#[tokio::test]
async fn converting_lock_replays_as_conversion() {
    let (mock, transport, ns, imp, exp) = setup();
    let lock = waiting_lock(&ns, &exp, 1);
    {
        let mut st = lock.state();
        st.granted_mode = Some(LockMode::Nl);
        st.req_mode = LockMode::Cw;
    }
    let _ = ns;

    replay_locks(&transport, &imp).await.unwrap();

    let sent = mock.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        LockFlags::from_wire(sent[0].flags),
        LockFlags::REPLAY | LockFlags::BLOCK_CONV
    );
}

#[tokio::test]
async fn bl_done_locks_are_not_replayed() {
    let (mock, transport, ns, imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    lock.state().flags |= LockFlags::BL_DONE;

    replay_locks(&transport, &imp).await.unwrap();
    assert_eq!(mock.sent_count(), 0);
    let _ = ns;
    let _ = lock;
}

#[tokio::test]
async fn reply_less_locks_are_cancelled_instead() {
    let (mock, transport, ns, imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    lock.state().flags |= LockFlags::CANCEL_ON_BLOCK;

    replay_locks(&transport, &imp).await.unwrap();

    assert_eq!(mock.sent_count(), 0);
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert!(ns.lock_by_handle(lock.handle()).is_none());
}

#[tokio::test]
async fn failed_recovery_skips_replay() {
    let (mock, transport, ns, imp, exp) = setup();
    granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    imp.set_vbr_failed(true);

    replay_locks(&transport, &imp).await.unwrap();
    assert_eq!(mock.sent_count(), 0);
    assert_eq!(imp.replay_inflight(), 0);
}

#[tokio::test]
async fn unused_locks_are_shed_before_replay() {
    let mock = MockTransport::new();
    let transport: Arc<dyn Transport> = mock.clone();
    let ns = crate::namespace::Namespace::with_evict_check(
        "replay-target",
        ConnectCaps { cancelset: true, lru_resize: true, ibits: true },
        &test_settings(),
        Some(Box::new(|_| true)),
    );
    let imp = Import::new(&ns);
    let exp = crate::export::Export::new(&imp);

    let idle = granted_unused_lock(&ns, &exp, 1, LockType::Extent);
    let held = granted_unused_lock(&ns, &exp, 2, LockType::Extent);
    held.addref(LockMode::Pr).unwrap();
    crate::timing::advance_clock(1);

    replay_locks(&transport, &imp).await.unwrap();

    // The idle lock was dropped locally, without any RPC; only the
    // held one was re-asserted.
    assert!(idle.flags().contains(LockFlags::DESTROYED));
    let sent = mock.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].handles[0], held.cookie());
}

#[tokio::test]
async fn failed_replay_reconnects_the_import() {
    let (mock, transport, ns, imp, exp) = setup();
    granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    mock.push_script(RpcCode::Failed, None);

    replay_locks(&transport, &imp).await.unwrap();

    assert_eq!(imp.replay_inflight(), 0);
    assert_eq!(mock.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    let _ = ns;
}
