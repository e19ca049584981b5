use std::sync::Arc;

use super::*;
use crate::fault::FaultSite;
use crate::lock::LockType;
use crate::testing::{full_caps, granted_unused_lock, res_id, test_env, MockTransport};
use crate::wire::CANCEL_PORTALS;

fn setup() -> (
    Arc<MockTransport>,
    Arc<dyn Transport>,
    Arc<Namespace>,
    Arc<crate::import::Import>,
    Arc<crate::export::Export>,
) {
    let mock = MockTransport::new();
    let transport: Arc<dyn Transport> = mock.clone();
    let (ns, imp, exp) = test_env(full_caps());
    (mock, transport, ns, imp, exp)
}

#[tokio::test]
async fn cancel_sends_one_rpc_and_destroys_lock() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    let remote = lock.remote_handle();

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty())
        .await
        .expect("cancel succeeds");

    assert!(lock.flags().contains(LockFlags::CANCELING | LockFlags::CBPENDING));
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert!(ns.lock_by_handle(lock.handle()).is_none());
    assert!(!lock.state().on_bl_list);

    let sent = mock.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].opcode, Opcode::Cancel);
    assert_eq!(sent[0].portals, CANCEL_PORTALS);
    assert_eq!(sent[0].lock_count, 1);
    assert_eq!(sent[0].handles[0], remote);
}

#[tokio::test]
async fn second_cancel_of_same_handle_is_a_noop() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    let handle = lock.handle();

    cli_cancel(&transport, &ns, handle, CancelFlags::empty()).await.unwrap();
    assert_eq!(mock.sent_count(), 1);

    cli_cancel(&transport, &ns, handle, CancelFlags::empty()).await.unwrap();
    assert_eq!(mock.sent_count(), 1, "no side effects the second time");
}

#[tokio::test]
async fn local_flag_skips_the_server() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::LOCAL).await.unwrap();
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert_eq!(mock.sent_count(), 0);
}

#[tokio::test]
async fn local_only_lock_never_produces_an_rpc() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    lock.state().flags |= LockFlags::LOCAL_ONLY;

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty()).await.unwrap();
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert_eq!(mock.sent_count(), 0);
}

#[tokio::test]
async fn invalid_import_pretends_success() {
    let (mock, transport, ns, imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    imp.set_invalid(true);

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty()).await.unwrap();
    // Local bookkeeping drained without talking to the dead server.
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert_eq!(mock.sent_count(), 0);
}

#[tokio::test]
async fn stale_reply_is_benign() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    mock.push_script(RpcCode::Stale, None);

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty()).await.unwrap();
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert_eq!(mock.sent_count(), 1);
}

#[tokio::test]
async fn timeout_at_same_generation_retries_the_cancel() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    mock.push_script(RpcCode::Timeout, None);
    mock.push_script(RpcCode::Ok, None);

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty()).await.unwrap();
    assert_eq!(mock.sent_count(), 2, "same request asked again");
}

#[tokio::test]
async fn shutdown_failure_still_drains_bookkeeping() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    mock.push_script(RpcCode::Shutdown, None);

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty()).await.unwrap();
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert!(!lock.state().on_bl_list);
    assert_eq!(mock.sent_count(), 1);
}

#[tokio::test]
async fn oversized_batch_splits_into_covering_rpcs() {
    let (mock, transport, ns, _imp, exp) = setup();
    let capacity = format_handles_avail(Opcode::Cancel, 0);
    let total = capacity + 3;

    let mut cancels = Vec::new();
    for i in 0..total {
        let lock = granted_unused_lock(&ns, &exp, i as u64 + 1, LockType::Plain);
        lock.state().flags |= LockFlags::CBPENDING | LockFlags::CANCELING;
        lock.state().on_bl_list = true;
        ns.lru_remove(&lock);
        cancels.push(lock);
    }

    cancel_list(&transport, &mut cancels, total, None, CancelFlags::empty()).await;

    let sent = mock.sent.lock();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].lock_count as usize, capacity);
    assert_eq!(sent[1].lock_count as usize, 3);

    // Every handle went out exactly once.
    let mut seen: Vec<u64> = sent
        .iter()
        .flat_map(|s| s.handles[..s.lock_count as usize].iter().copied())
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), total);
}

#[tokio::test]
async fn bl_ast_cancels_travel_separately() {
    let (mock, transport, ns, _imp, exp) = setup();
    let plain = granted_unused_lock(&ns, &exp, 1, LockType::Plain);
    let from_bl = granted_unused_lock(&ns, &exp, 2, LockType::Plain);
    from_bl.state().flags |= LockFlags::BL_AST;

    let mut cancels = Vec::new();
    for lock in [&plain, &from_bl] {
        lock.state().flags |= LockFlags::CBPENDING | LockFlags::CANCELING;
        lock.state().on_bl_list = true;
        ns.lru_remove(lock);
        cancels.push(lock.clone());
    }

    let remaining = cancel_list_local(&transport, &mut cancels, 2, CancelFlags::empty()).await;

    // The blocking-AST cancel already went out on its own.
    assert_eq!(remaining, 1);
    assert_eq!(mock.sent_count(), 1);
    assert_eq!(mock.sent.lock()[0].handles[0], from_bl.remote_handle());

    cancel_list(&transport, &mut cancels, remaining, None, CancelFlags::empty()).await;
    assert_eq!(mock.sent_count(), 2);
    assert_eq!(mock.sent.lock()[1].handles[0], plain.remote_handle());
}

#[tokio::test]
async fn async_flag_dispatches_without_waiting() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);

    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::ASYNC).await.unwrap();
    let sent = mock.sent.lock();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].async_dispatch);
}

#[tokio::test]
async fn cancel_race_site_short_circuits_the_rpc() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);

    ns.faults().arm(FaultSite::CancelRace);
    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty()).await.unwrap();

    // The cancel is treated as sent but nothing hit the wire.
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert_eq!(mock.sent_count(), 0);
}

#[tokio::test]
async fn pause_site_delays_but_completes() {
    let (mock, transport, ns, _imp, exp) = setup();
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);

    ns.faults().arm_pause(5);
    cli_cancel(&transport, &ns, lock.handle(), CancelFlags::empty()).await.unwrap();
    assert_eq!(mock.sent_count(), 1);
}

#[tokio::test]
async fn cancel_unused_sweeps_namespace_once() {
    let (mock, transport, ns, _imp, exp) = setup();
    for i in 0..4 {
        granted_unused_lock(&ns, &exp, i + 1, LockType::Plain);
    }
    assert_eq!(ns.nr_unused(), 4);

    cancel_unused(&transport, &ns, None, CancelFlags::empty()).await.unwrap();
    assert_eq!(ns.nr_unused(), 0);
    let first_round = mock.sent_count();
    assert!(first_round > 0);

    // Nothing left: the second sweep produces an empty batch.
    cancel_unused(&transport, &ns, None, CancelFlags::empty()).await.unwrap();
    assert_eq!(mock.sent_count(), first_round);
}

#[tokio::test]
async fn cancel_unused_resource_honors_mode_compatibility() {
    let (_mock, transport, ns, _imp, exp) = setup();
    // A PR lock is compatible with a PR request and stays.
    let lock = granted_unused_lock(&ns, &exp, 1, LockType::Plain);

    cancel_unused_resource(&transport, &ns, res_id(1), Some(LockMode::Pr), CancelFlags::empty())
        .await
        .unwrap();
    assert!(!lock.flags().contains(LockFlags::DESTROYED));

    cancel_unused_resource(&transport, &ns, res_id(1), Some(LockMode::Ex), CancelFlags::empty())
        .await
        .unwrap();
    assert!(lock.flags().contains(LockFlags::DESTROYED));
}
