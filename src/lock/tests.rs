use std::sync::Arc;

use super::{LockFlags, LockMode};
use crate::lock::{CallbackSet, Lock, LvbType};
use crate::testing::{full_caps, granted_unused_lock, res_id, test_env};

#[test]
fn flag_wire_translation_strips_local_bits() {
    let flags = LockFlags::BLOCK_WAIT
        | LockFlags::CANCEL_ON_BLOCK
        | LockFlags::CBPENDING
        | LockFlags::CANCELING;
    let wire = flags.to_wire();
    let back = LockFlags::from_wire(wire);
    assert!(back.contains(LockFlags::BLOCK_WAIT));
    assert!(back.contains(LockFlags::CANCEL_ON_BLOCK));
    assert!(!back.contains(LockFlags::CBPENDING));
    assert!(!back.contains(LockFlags::CANCELING));
}

#[test]
fn blocked_mask_members() {
    assert!(LockFlags::BLOCK_GRANTED.is_blocked());
    assert!(LockFlags::BLOCK_CONV.is_blocked());
    assert!(LockFlags::BLOCK_WAIT.is_blocked());
    assert!(!LockFlags::AST_SENT.is_blocked());
}

#[test]
fn inherit_mask_is_wire_visible() {
    let inherited = LockFlags::from_wire(LockFlags::INHERIT_MASK.bits());
    assert_eq!(inherited, LockFlags::INHERIT_MASK);
}

#[test]
fn mode_compatibility_table() {
    use LockMode::*;
    assert!(Ex.compatible(Nl));
    assert!(!Ex.compatible(Pr));
    assert!(Pr.compatible(Pr));
    assert!(Pr.compatible(Cr));
    assert!(!Pr.compatible(Pw));
    assert!(Pw.compatible(Cr));
    assert!(!Pw.compatible(Pr));
    assert!(Cw.compatible(Cw));
    assert!(Cw.compatible(Cr));
    assert!(!Cw.compatible(Pr));
    assert!(Group.compatible(Group));
    assert!(Group.compatible(Nl));
    assert!(!Group.compatible(Cr));
    assert!(Nl.compatible(Group));
}

#[test]
fn mode_compatibility_is_symmetric() {
    use LockMode::*;
    let modes = [Nl, Cr, Cw, Pr, Pw, Ex, Group];
    for a in modes {
        for b in modes {
            assert_eq!(a.compatible(b), b.compatible(a), "{a:?} vs {b:?}");
        }
    }
}

#[test]
fn create_registers_handle() {
    let (ns, _imp, _exp) = test_env(full_caps());
    let lock = Lock::create(
        &ns,
        res_id(1),
        super::LockType::Plain,
        LockMode::Pr,
        CallbackSet::default(),
        None,
        0,
        LvbType::None,
    );
    let found = ns.lock_by_handle(lock.handle()).expect("handle resolves");
    assert!(Arc::ptr_eq(&found, &lock));
}

#[test]
fn destroy_makes_handle_unresolvable() {
    let (ns, _imp, exp) = test_env(full_caps());
    let lock = granted_unused_lock(&ns, &exp, 1, super::LockType::Plain);
    lock.destroy();
    assert!(ns.lock_by_handle(lock.handle()).is_none());
    assert!(!lock.is_in_lru());
}

#[test]
fn unused_lock_parks_on_lru_and_use_removes_it() {
    let (ns, _imp, exp) = test_env(full_caps());
    let lock = granted_unused_lock(&ns, &exp, 1, super::LockType::Plain);

    // readers + writers == 0 implies LRU membership here.
    assert!(lock.is_in_lru());
    assert_eq!(ns.nr_unused(), 1);

    lock.addref(LockMode::Pr).expect("no cancel pending");
    assert!(!lock.is_in_lru());
    assert_eq!(ns.nr_unused(), 0);
    assert_eq!(lock.readers(), 1);

    lock.decref(LockMode::Pr);
    assert!(lock.is_in_lru());
    assert_eq!(ns.nr_unused(), 1);
}

#[test]
fn cbpending_refuses_new_references() {
    let (ns, _imp, exp) = test_env(full_caps());
    let lock = granted_unused_lock(&ns, &exp, 1, super::LockType::Plain);
    lock.state().flags |= LockFlags::CBPENDING;
    assert!(lock.addref(LockMode::Pr).is_err());
    assert_eq!(lock.readers(), 0);
}

#[test]
fn no_lru_flag_keeps_lock_off_the_list() {
    let (ns, _imp, exp) = test_env(full_caps());
    let lock = Lock::create(
        &ns,
        res_id(2),
        super::LockType::Plain,
        LockMode::Pw,
        CallbackSet::default(),
        None,
        0,
        LvbType::None,
    );
    lock.set_conn_export(exp.clone());
    lock.state().flags |= LockFlags::NO_LRU;
    lock.addref_internal(LockMode::Pw);
    lock.install_from_reply(LockFlags::empty());
    lock.decref(LockMode::Pw);
    assert!(!lock.is_in_lru());
    assert_eq!(ns.nr_unused(), 0);
}

#[test]
fn grant_moves_lock_to_granted_list() {
    let (ns, _imp, exp) = test_env(full_caps());
    let lock = Lock::create(
        &ns,
        res_id(3),
        super::LockType::Plain,
        LockMode::Ex,
        CallbackSet::default(),
        None,
        8,
        LvbType::Extent,
    );
    lock.set_conn_export(exp.clone());
    lock.addref_internal(LockMode::Ex);
    lock.install_from_reply(LockFlags::BLOCK_WAIT);

    let res = lock.resource();
    assert_eq!(res.waiting().len(), 1);
    assert!(lock.granted_mode().is_none());

    lock.grant(Some(b"12345678"));
    assert_eq!(res.waiting().len(), 0);
    assert_eq!(res.granted().len(), 1);
    assert_eq!(lock.granted_mode(), Some(LockMode::Ex));
    assert!(lock.flags().contains(LockFlags::LVB_READY));
    assert_eq!(lock.lvb(), b"12345678".to_vec());
}

#[test]
fn last_reference_with_cbpending_runs_local_teardown() {
    let (ns, _imp, exp) = test_env(full_caps());
    let lock = granted_unused_lock(&ns, &exp, 4, super::LockType::Plain);
    lock.addref(LockMode::Pr).unwrap();
    {
        let mut st = lock.state();
        st.flags |= LockFlags::CBPENDING | LockFlags::LOCAL_ONLY;
    }
    lock.decref(LockMode::Pr);

    // LOCAL_ONLY teardown happens in the caller's context.
    assert!(lock.flags().contains(LockFlags::DESTROYED));
    assert!(ns.lock_by_handle(lock.handle()).is_none());
}
