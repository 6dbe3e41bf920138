// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-node scenarios over the in-memory mesh: subscription and update
//! propagation, remote triggers, poison fan-out, distributed barrier
//! arrivals with timestamps and reductions, and out-of-order trigger
//! absorption.

mod common;

use std::time::Duration;

use common::{inline_mesh, ManualMesh, TestWaiter, SUM64};
use magnetar::{Barrier, Event, Message, Runtime};
use tokio::time::timeout;

fn result_of(rt: &Runtime, barrier: Barrier) -> Option<u64> {
    let mut buf = [0u8; 8];
    rt.barriers()
        .get_result(barrier, &mut buf)
        .unwrap()
        .then(|| u64::from_le_bytes(buf))
}

#[test]
fn remote_waiter_wakes_on_owner_trigger() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let e = owner.events().create_event().unwrap();
    assert!(!remote.events().has_triggered(e).unwrap());

    let waiter = TestWaiter::new();
    remote.events().add_waiter(e, waiter.clone()).unwrap();
    assert_eq!(waiter.count(), 0);

    owner.events().trigger(e, false).unwrap();

    assert_eq!(waiter.last(), Some((e, false)));
    assert!(remote.events().has_triggered(e).unwrap());
}

#[test]
fn subscription_after_trigger_gets_immediate_update() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let e = owner.events().create_event().unwrap();
    owner.events().trigger(e, false).unwrap();

    let waiter = TestWaiter::new();
    remote.events().add_waiter(e, waiter.clone()).unwrap();
    assert_eq!(waiter.last(), Some((e, false)));
}

#[test]
fn remote_trigger_advances_the_owner() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let e = owner.events().create_event().unwrap();
    remote.events().trigger(e, false).unwrap();

    assert!(owner.events().has_triggered(e).unwrap());
    assert!(remote.events().has_triggered(e).unwrap());
}

#[test]
fn poison_fans_out_to_remote_waiters() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let user = owner.events().create_user_event().unwrap();
    let e = user.event();

    let waiter = TestWaiter::new();
    remote.events().add_waiter(e, waiter.clone()).unwrap();

    owner.events().cancel_user_event(user).unwrap();

    assert_eq!(waiter.last(), Some((e, true)));
    assert_eq!(
        remote.events().has_triggered_faultaware(e).unwrap(),
        (true, true)
    );
}

#[test]
fn update_carries_the_whole_poison_history() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    // three generations of the same slot: poisoned, clean, poisoned
    let e1 = owner.events().create_event().unwrap();
    owner.events().trigger(e1, true).unwrap();
    let e2 = owner.events().create_event().unwrap();
    owner.events().trigger(e2, false).unwrap();
    let e3 = owner.events().create_event().unwrap();
    assert_eq!(e3.id, e1.id);

    let waiter = TestWaiter::new();
    remote.events().add_waiter(e3, waiter.clone()).unwrap();
    // the subscription answer already advanced the cached view to gen 2
    assert_eq!(
        remote.events().has_triggered_faultaware(e1).unwrap(),
        (true, true)
    );
    assert_eq!(
        remote.events().has_triggered_faultaware(e2).unwrap(),
        (true, false)
    );

    owner.events().trigger(e3, true).unwrap();
    assert_eq!(waiter.last(), Some((e3, true)));
    assert_eq!(
        remote.events().has_triggered_faultaware(e3).unwrap(),
        (true, true)
    );
}

#[test]
fn future_waiters_promote_as_updates_arrive() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let e1 = owner.events().create_event().unwrap();
    owner.events().trigger(e1, false).unwrap();
    let e2 = owner.events().create_event().unwrap();
    owner.events().trigger(e2, false).unwrap();
    let e3 = owner.events().create_event().unwrap();

    // the remote's cached view is still at generation 0; a waiter for
    // generation 3 lands in the future list and subscribes
    let waiter = TestWaiter::new();
    remote.events().add_waiter(e3, waiter.clone()).unwrap();
    assert_eq!(waiter.count(), 0);
    assert!(remote.events().has_triggered(e2).unwrap());

    owner.events().trigger(e3, false).unwrap();
    assert_eq!(waiter.last(), Some((e3, false)));
}

#[test]
fn local_trigger_is_visible_before_the_owner_confirms() {
    let mesh = ManualMesh::new(2);
    let (owner, remote) = (mesh.node(0).clone(), mesh.node(1).clone());

    let e1 = owner.events().create_event().unwrap();
    owner.events().trigger(e1, false).unwrap();
    let e2 = owner.events().create_event().unwrap();

    // the remote triggers generation 2 while its cached view is at 0;
    // only the provisional local-trigger record can answer queries
    remote.events().trigger(e2, true).unwrap();
    assert_eq!(
        remote.events().has_triggered_faultaware(e2).unwrap(),
        (true, true)
    );
    assert!(!owner.events().has_triggered_faultaware(e2).unwrap().0);

    mesh.deliver_all();
    assert_eq!(
        owner.events().has_triggered_faultaware(e2).unwrap(),
        (true, true)
    );
    assert_eq!(
        remote.events().has_triggered_faultaware(e2).unwrap(),
        (true, true)
    );
}

#[tokio::test]
async fn cooperative_wait_across_nodes() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (mesh[0].clone(), mesh[1].clone());

    let e = owner.events().create_event().unwrap();

    let waiter = {
        let remote = remote.clone();
        tokio::spawn(async move { remote.events().wait_faultaware(e).await })
    };
    tokio::task::yield_now().await;

    owner.events().trigger(e, false).unwrap();

    let poisoned = timeout(Duration::from_millis(500), waiter)
        .await
        .expect("waiter timed out")
        .expect("join")
        .expect("remote wait should succeed");
    assert!(!poisoned);
}

#[test]
fn merge_spans_nodes() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let theirs = owner.events().create_event().unwrap();
    let ours = remote.events().create_event().unwrap();

    let merged = remote.events().merge_events(&[theirs, ours]).unwrap();
    assert!(!remote.events().has_triggered(merged).unwrap());

    owner.events().trigger(theirs, false).unwrap();
    assert!(!remote.events().has_triggered(merged).unwrap());

    remote.events().trigger(ours, false).unwrap();
    assert_eq!(
        remote.events().has_triggered_faultaware(merged).unwrap(),
        (true, false)
    );
}

#[test]
fn barrier_gathers_arrivals_from_three_nodes() {
    let mesh = inline_mesh(3);
    let owner = &mesh[0];

    let b = owner
        .barriers()
        .create_barrier(3, SUM64, Some(&0u64.to_le_bytes()))
        .unwrap();

    // node 1 subscribes and parks a waiter before anything arrives
    assert!(!mesh[1].barriers().has_triggered(b).unwrap());
    let waiter = TestWaiter::new();
    mesh[1].barriers().add_waiter(b, waiter.clone()).unwrap();

    for (node, value) in [(0usize, 1u64), (1, 2), (2, 3)] {
        mesh[node]
            .barriers()
            .arrive(b, 1, Event::NO_EVENT, Some(&value.to_le_bytes()))
            .unwrap();
    }

    assert!(owner.barriers().has_triggered(b).unwrap());
    assert_eq!(waiter.count(), 1);
    assert!(mesh[1].barriers().has_triggered(b).unwrap());
    assert_eq!(result_of(&mesh[1], b), Some(6));

    // node 2 never subscribed; its first query subscribes and the owner's
    // immediate trigger lands before a second query
    assert!(!mesh[2].barriers().has_triggered(b).unwrap());
    assert!(mesh[2].barriers().has_triggered(b).unwrap());
    assert_eq!(result_of(&mesh[2], b), Some(6));
}

#[test]
fn altered_arrival_count_orders_across_nodes() {
    let mesh = ManualMesh::new(3);
    let owner = mesh.node(0).clone();

    let b = owner.barriers().create_barrier(2, 0, None).unwrap();
    let waiter = TestWaiter::new();
    owner.barriers().add_waiter(b, waiter.clone()).unwrap();

    // node 1 raises the expected count; the positive adjustment is in
    // flight while arrivals citing its timestamp race ahead
    let with_ts = mesh.node(1).barriers().alter_arrival_count(b, 1).unwrap();
    assert_ne!(with_ts.timestamp, 0);

    mesh.node(2)
        .barriers()
        .arrive(b, 1, Event::NO_EVENT, None)
        .unwrap();

    // the owner's own arrival cites the timestamp minted on node 1; the
    // matching positive has not been observed, so it must be held
    owner
        .barriers()
        .arrive(with_ts, 1, Event::NO_EVENT, None)
        .unwrap();

    mesh.deliver_from(2);
    assert!(!owner.barriers().has_triggered(b).unwrap());
    assert_eq!(waiter.count(), 0);

    mesh.deliver_from(1);
    // positive applied and the held arrival flushed: one arrival short
    assert!(!owner.barriers().has_triggered(b).unwrap());

    mesh.node(1)
        .barriers()
        .arrive(with_ts, 1, Event::NO_EVENT, None)
        .unwrap();
    mesh.deliver_all();
    assert_eq!(mesh.pending(), 0);

    assert!(owner.barriers().has_triggered(b).unwrap());
    assert_eq!(waiter.count(), 1);
}

#[test]
fn out_of_order_barrier_triggers_collapse() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let b = owner.barriers().create_barrier(1, 0, None).unwrap();

    let waiters: Vec<_> = (2..=4)
        .map(|gen| {
            let waiter = TestWaiter::new();
            let phase = Barrier {
                id: b.id,
                gen,
                timestamp: 0,
            };
            remote.barriers().add_waiter(phase, waiter.clone()).unwrap();
            waiter
        })
        .collect();

    let trigger = |previous_gen, trigger_gen| {
        remote
            .handle_message(
                0,
                Message::BarrierTrigger {
                    barrier_id: b.id,
                    trigger_gen,
                    previous_gen,
                    first_generation: 0,
                    redop_id: 0,
                    reduce_data: Vec::new(),
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
    };

    trigger(0, 1);
    // generations 3->4 arrive before 1->3; the message is parked
    trigger(3, 4);
    for waiter in &waiters {
        assert_eq!(waiter.count(), 0);
    }

    trigger(1, 3);
    for waiter in &waiters {
        assert_eq!(waiter.count(), 1);
    }
    let gen4 = Barrier {
        id: b.id,
        gen: 4,
        timestamp: 0,
    };
    assert!(remote.barriers().has_triggered(gen4).unwrap());
}

#[test]
fn barrier_trigger_permutations_converge() {
    // any permutation of a contiguous trigger range must land on the same
    // final generation
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);
    let b = owner.barriers().create_barrier(1, 0, None).unwrap();

    let trigger = |previous_gen, trigger_gen| {
        remote
            .handle_message(
                0,
                Message::BarrierTrigger {
                    barrier_id: b.id,
                    trigger_gen,
                    previous_gen,
                    first_generation: 0,
                    redop_id: 0,
                    reduce_data: Vec::new(),
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
    };

    trigger(1, 3);
    trigger(3, 4);
    trigger(0, 1);

    let gen4 = Barrier {
        id: b.id,
        gen: 4,
        timestamp: 0,
    };
    assert!(remote.barriers().has_triggered(gen4).unwrap());
}

#[test]
fn deferred_remote_arrival_forwards_to_the_owner() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let b = owner.barriers().create_barrier(1, 0, None).unwrap();
    let gate = owner.events().create_event().unwrap();

    // the remote's arrival is gated on an event it does not own; the
    // deferral happens on the owner
    remote.barriers().arrive(b, 1, gate, None).unwrap();
    assert!(!owner.barriers().has_triggered(b).unwrap());

    owner.events().trigger(gate, false).unwrap();
    assert!(owner.barriers().has_triggered(b).unwrap());
}

#[test]
fn barrier_results_follow_late_subscribers() {
    let mesh = inline_mesh(2);
    let (owner, remote) = (&mesh[0], &mesh[1]);

    let b = owner
        .barriers()
        .create_barrier(1, SUM64, Some(&10u64.to_le_bytes()))
        .unwrap();

    // two generations complete before the remote ever looks
    owner
        .barriers()
        .arrive(b, 1, Event::NO_EVENT, Some(&7u64.to_le_bytes()))
        .unwrap();
    let gen2 = b.advance();
    owner
        .barriers()
        .arrive(gen2, 1, Event::NO_EVENT, Some(&1u64.to_le_bytes()))
        .unwrap();

    // the subscription answer carries both generations' results
    assert!(!remote.barriers().has_triggered(gen2).unwrap());
    assert!(remote.barriers().has_triggered(gen2).unwrap());
    assert_eq!(result_of(remote, b), Some(17));
    assert_eq!(result_of(remote, gen2), Some(11));
}
