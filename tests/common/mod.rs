// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory cluster harness: full-mesh messengers standing in for the
//! network, plus a shared reduction operator and a recording waiter.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;

use magnetar::{
    Event, EventWaiter, NodeId, NodeMessenger, ReductionOp, ReductionOpId, Runtime, RuntimeConfig,
};

pub const SUM64: ReductionOpId = 1;

pub struct Sum64;

impl ReductionOp for Sum64 {
    fn sizeof_lhs(&self) -> usize {
        8
    }

    fn sizeof_rhs(&self) -> usize {
        8
    }

    fn apply(&self, lhs: &mut [u8], rhs: &[u8], count: usize, _exclusive: bool) {
        for i in 0..count {
            let l = u64::from_le_bytes(lhs[i * 8..i * 8 + 8].try_into().unwrap());
            let r = u64::from_le_bytes(rhs[i * 8..i * 8 + 8].try_into().unwrap());
            lhs[i * 8..i * 8 + 8].copy_from_slice(&(l + r).to_le_bytes());
        }
    }
}

fn new_runtime(node: NodeId) -> Arc<Runtime> {
    let rt = Runtime::new(node, RuntimeConfig::default());
    rt.reductions().register(SUM64, Arc::new(Sum64)).unwrap();
    rt
}

/// Messenger that hands payloads straight to the target runtime, on the
/// sending thread. Delivery order per pair follows send order, as the
/// transport contract requires.
struct InlineMessenger {
    origin: NodeId,
    table: Arc<HashMap<NodeId, Arc<Runtime>>>,
}

impl NodeMessenger for InlineMessenger {
    fn send(&self, target: NodeId, payload: Bytes) -> Result<()> {
        let rt = self
            .table
            .get(&target)
            .ok_or_else(|| anyhow!("unknown node {target}"))?;
        rt.handle_message(self.origin, payload)
    }
}

/// Build a cluster of `n` runtimes with synchronous in-line delivery.
pub fn inline_mesh(n: NodeId) -> Vec<Arc<Runtime>> {
    let runtimes: Vec<Arc<Runtime>> = (0..n).map(new_runtime).collect();
    let table: Arc<HashMap<NodeId, Arc<Runtime>>> = Arc::new(
        runtimes
            .iter()
            .map(|rt| (rt.node_id(), rt.clone()))
            .collect(),
    );
    for rt in &runtimes {
        rt.set_messenger(Arc::new(InlineMessenger {
            origin: rt.node_id(),
            table: table.clone(),
        }));
    }
    runtimes
}

type Delivery = (NodeId, NodeId, Bytes);

struct QueueMessenger {
    origin: NodeId,
    queue: Arc<Mutex<VecDeque<Delivery>>>,
}

impl NodeMessenger for QueueMessenger {
    fn send(&self, target: NodeId, payload: Bytes) -> Result<()> {
        self.queue.lock().push_back((self.origin, target, payload));
        Ok(())
    }
}

/// Cluster whose messages queue until the test pumps them, so delivery
/// order and interleavings can be controlled.
pub struct ManualMesh {
    runtimes: Vec<Arc<Runtime>>,
    queue: Arc<Mutex<VecDeque<Delivery>>>,
}

impl ManualMesh {
    pub fn new(n: NodeId) -> Self {
        let runtimes: Vec<Arc<Runtime>> = (0..n).map(new_runtime).collect();
        let queue: Arc<Mutex<VecDeque<Delivery>>> = Arc::new(Mutex::new(VecDeque::new()));
        for rt in &runtimes {
            rt.set_messenger(Arc::new(QueueMessenger {
                origin: rt.node_id(),
                queue: queue.clone(),
            }));
        }
        Self { runtimes, queue }
    }

    pub fn node(&self, node: NodeId) -> &Arc<Runtime> {
        &self.runtimes[node as usize]
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn deliver_next(&self) -> bool {
        let entry = self.queue.lock().pop_front();
        match entry {
            Some((from, to, payload)) => {
                self.node(to).handle_message(from, payload).unwrap();
                true
            }
            None => false,
        }
    }

    pub fn deliver_all(&self) {
        while self.deliver_next() {}
    }

    /// Deliver every currently-queued message sent by `from`, preserving
    /// relative order; later sends stay queued.
    pub fn deliver_from(&self, from: NodeId) {
        let batch: Vec<Delivery> = {
            let mut queue = self.queue.lock();
            let mut batch = Vec::new();
            let mut rest = VecDeque::new();
            while let Some(entry) = queue.pop_front() {
                if entry.0 == from {
                    batch.push(entry);
                } else {
                    rest.push_back(entry);
                }
            }
            *queue = rest;
            batch
        };
        for (from, to, payload) in batch {
            self.node(to).handle_message(from, payload).unwrap();
        }
    }
}

/// Waiter that records every invocation.
pub struct TestWaiter {
    fired: Mutex<Vec<(Event, bool)>>,
}

impl TestWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.fired.lock().len()
    }

    pub fn last(&self) -> Option<(Event, bool)> {
        self.fired.lock().last().copied()
    }
}

impl EventWaiter for TestWaiter {
    fn on_triggered(&self, event: Event, poisoned: bool) -> bool {
        self.fired.lock().push((event, poisoned));
        true
    }

    fn describe(&self) -> String {
        "test waiter".to_string()
    }
}
