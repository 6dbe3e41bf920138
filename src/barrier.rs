// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-generation reduction barriers.
//!
//! A barrier triggers a generation when the signed arrival deltas for it
//! sum to the negated base count. Positive adjustments (raising the
//! expected count) carry a process-wide timestamp whose high bits name the
//! submitting node; a negative arrival citing timestamp T is held until the
//! positive adjustment that produced T has been observed, which is what
//! keeps a raised count from triggering prematurely. Alongside arrival
//! accounting, each generation can fold arrival payloads into a reduction
//! value delivered to subscribers with the trigger.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::am::{Message, NodeMessenger};
use crate::event::EventPool;
use crate::id::{Barrier, Event, EventId, Generation, IdKind, NodeId, MAX_SLOT_INDEX};
use crate::redop::{ReductionOp, ReductionOpId, ReductionRegistry};
use crate::runtime::{PoisonPolicy, RuntimeConfig};
use crate::waiter::{wake_all, AsyncCondition, EventWaiter, WaiterList};

/// Adjustment timestamps carry the submitting node in their high bits.
const TIMESTAMP_NODE_SHIFT: u32 = 48;

pub(crate) struct BarrierSlot {
    me: EventId,
    owner: NodeId,
    generation: AtomicU32,
    inner: Mutex<BarrierInner>,
}

struct BarrierInner {
    /// Newest generation subscribed to upstream (non-owner only).
    gen_subscribed: Generation,
    /// Arrivals needed per generation; constant over the slot's lifetime.
    base_arrival_count: u32,
    /// Generation at which this incarnation was created; reduction result
    /// indexing is relative to it.
    first_generation: Generation,
    /// Generation past which the slot may be reclaimed.
    free_generation: Generation,
    /// Open generations with arrival state and waiters.
    generations: BTreeMap<Generation, BarrierGeneration>,
    /// Per subscriber, the newest generation it wants delivered (owner
    /// only; entries are removed once fulfilled).
    remote_subscribe_gens: BTreeMap<NodeId, Generation>,
    /// Per subscriber, the newest generation already delivered (owner only).
    remote_trigger_gens: BTreeMap<NodeId, Generation>,
    /// Out-of-order trigger messages parked as previous-gen to trigger-gen
    /// ranges (non-owner only).
    held_triggers: BTreeMap<Generation, Generation>,
    redop_id: ReductionOpId,
    redop: Option<Arc<dyn ReductionOp>>,
    initial_value: Vec<u8>,
    /// One left-hand-side per generation, relative to `first_generation`.
    final_values: Vec<u8>,
    value_capacity: usize,
}

impl Default for BarrierInner {
    fn default() -> Self {
        Self {
            gen_subscribed: 0,
            base_arrival_count: 0,
            first_generation: 0,
            free_generation: Generation::MAX,
            generations: BTreeMap::new(),
            remote_subscribe_gens: BTreeMap::new(),
            remote_trigger_gens: BTreeMap::new(),
            held_triggers: BTreeMap::new(),
            redop_id: 0,
            redop: None,
            initial_value: Vec::new(),
            final_values: Vec::new(),
            value_capacity: 0,
        }
    }
}

impl BarrierInner {
    /// Grow the reduction storage to `needed` generations, seeding new
    /// entries with the initial value.
    fn ensure_seeded_capacity(&mut self, needed: usize) {
        while self.value_capacity < needed {
            self.final_values.extend_from_slice(&self.initial_value);
            self.value_capacity += 1;
        }
    }
}

#[derive(Default)]
struct BarrierGeneration {
    /// Net of all applied deltas for this generation.
    unguarded_delta: i64,
    local_waiters: WaiterList,
    pernode: BTreeMap<NodeId, PerNodeUpdates>,
}

#[derive(Default)]
struct PerNodeUpdates {
    last_ts: u64,
    pending: BTreeMap<u64, i64>,
}

impl BarrierGeneration {
    /// Apply one signed adjustment under the timestamp discipline: a
    /// positive delta lands immediately and releases any held negatives at
    /// or before its timestamp; a negative delta citing a timestamp newer
    /// than the last positive from that node is held.
    fn handle_adjustment(&mut self, timestamp: u64, delta: i64) {
        if timestamp == 0 {
            self.unguarded_delta += delta;
            return;
        }
        let node = (timestamp >> TIMESTAMP_NODE_SHIFT) as NodeId;
        let pernode = self.pernode.entry(node).or_default();
        if delta > 0 {
            self.unguarded_delta += delta;
            pernode.last_ts = timestamp;
            while let Some((&ts, &pending_delta)) = pernode.pending.first_key_value() {
                if ts > pernode.last_ts {
                    break;
                }
                debug!("applying pending barrier delta: ts={ts:#x} delta={pending_delta}");
                self.unguarded_delta += pending_delta;
                pernode.pending.pop_first();
            }
        } else if timestamp <= pernode.last_ts {
            debug!("barrier adjustment applied immediately: ts={timestamp:#x} delta={delta}");
            self.unguarded_delta += delta;
        } else {
            debug!("barrier adjustment deferred: ts={timestamp:#x} delta={delta}");
            *pernode.pending.entry(timestamp).or_insert(0) += delta;
        }
    }
}

impl BarrierSlot {
    fn new(me: EventId, owner: NodeId) -> Self {
        Self {
            me,
            owner,
            generation: AtomicU32::new(0),
            inner: Mutex::new(BarrierInner::default()),
        }
    }

    fn current_barrier(&self) -> Barrier {
        Barrier {
            id: self.me,
            gen: self.generation.load(Ordering::Acquire) + 1,
            timestamp: 0,
        }
    }
}

struct RemoteNotification {
    node: NodeId,
    trigger_gen: Generation,
    previous_gen: Generation,
}

/// Deferred arrival: re-submits its adjustment once the gating event
/// triggers. Barriers carry no poison channel, so a poisoned gate is
/// resolved by the pool's poison policy.
struct DeferredBarrierArrival {
    pool: Weak<BarrierPool>,
    barrier: Barrier,
    delta: i64,
    reduce_value: Vec<u8>,
}

impl EventWaiter for DeferredBarrierArrival {
    fn on_triggered(&self, _event: Event, poisoned: bool) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return true;
        };
        if poisoned {
            match pool.policy {
                PoisonPolicy::Fatal => {
                    panic!(
                        "poisoned prerequisite for barrier arrival: barrier={}",
                        self.barrier
                    )
                }
                PoisonPolicy::Surface => {
                    warn!(
                        "dropping barrier arrival with poisoned prerequisite: barrier={}",
                        self.barrier
                    );
                    return true;
                }
            }
        }
        info!(
            "deferred barrier arrival: barrier={} delta={}",
            self.barrier, self.delta
        );
        let reduce = (!self.reduce_value.is_empty()).then_some(self.reduce_value.as_slice());
        if let Err(err) = pool.adjust_arrival(self.barrier, self.delta, Event::NO_EVENT, reduce) {
            warn!(
                "deferred barrier arrival failed: barrier={}: {err}",
                self.barrier
            );
        }
        true
    }

    fn describe(&self) -> String {
        format!(
            "deferred arrival: barrier={} delta={}",
            self.barrier, self.delta
        )
    }
}

/// Per-node table of barrier slots plus the process-wide adjustment
/// timestamp counter.
pub struct BarrierPool {
    node: NodeId,
    policy: PoisonPolicy,
    events: Arc<EventPool>,
    redops: Arc<ReductionRegistry>,
    slots: DashMap<EventId, Arc<BarrierSlot>>,
    free: Mutex<VecDeque<Arc<BarrierSlot>>>,
    next_index: AtomicU64,
    messenger: RwLock<Option<Arc<dyn NodeMessenger>>>,
    adjustment_timestamp: AtomicU64,
}

impl BarrierPool {
    pub(crate) fn new(
        node: NodeId,
        config: &RuntimeConfig,
        events: Arc<EventPool>,
        redops: Arc<ReductionRegistry>,
    ) -> Self {
        Self {
            node,
            policy: config.poison_policy,
            events,
            redops,
            slots: DashMap::with_capacity(config.initial_slot_capacity),
            free: Mutex::new(VecDeque::new()),
            next_index: AtomicU64::new(0),
            messenger: RwLock::new(None),
            // sequence numbers start at 1 so node 0 never mints the
            // reserved "no timestamp" value
            adjustment_timestamp: AtomicU64::new(((node as u64) << TIMESTAMP_NODE_SHIFT) | 1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub(crate) fn set_messenger(&self, messenger: Arc<dyn NodeMessenger>) {
        *self.messenger.write() = Some(messenger);
    }

    fn messenger(&self) -> Result<Arc<dyn NodeMessenger>> {
        self.messenger
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("node messenger not initialized"))
    }

    fn send(&self, target: NodeId, message: &Message) -> Result<()> {
        self.messenger()?.send(target, message.encode()?)
    }

    fn lookup(&self, id: EventId) -> Result<Arc<BarrierSlot>> {
        if !id.is_barrier() {
            bail!("id {id} does not name a barrier");
        }
        if id.owner_node() == self.node {
            self.slots
                .get(&id)
                .map(|slot| slot.clone())
                .ok_or_else(|| anyhow!("unknown local barrier {id}"))
        } else {
            Ok(self
                .slots
                .entry(id)
                .or_insert_with(|| Arc::new(BarrierSlot::new(id, id.owner_node())))
                .clone())
        }
    }

    /// Allocate a barrier expecting `expected_arrivals` per generation.
    /// With a non-zero `redop_id`, every generation folds arrival payloads
    /// into a copy of `initial_value`.
    pub fn create_barrier(
        &self,
        expected_arrivals: u32,
        redop_id: ReductionOpId,
        initial_value: Option<&[u8]>,
    ) -> Result<Barrier> {
        if expected_arrivals == 0 {
            bail!("a barrier needs at least one expected arrival");
        }
        let slot = match self.free.lock().pop_front() {
            Some(slot) => slot,
            None => self.allocate_slot()?,
        };
        {
            let mut inner = slot.inner.lock();
            inner.base_arrival_count = expected_arrivals;
            inner.first_generation = slot.generation.load(Ordering::Relaxed);
            inner.free_generation = Generation::MAX;
            inner.final_values.clear();
            inner.value_capacity = 0;
            if redop_id != 0 {
                let redop = self
                    .redops
                    .lookup(redop_id)
                    .ok_or_else(|| anyhow!("unknown reduction operator {redop_id}"))?;
                let initial = initial_value
                    .ok_or_else(|| anyhow!("reduction barrier requires an initial value"))?;
                if initial.len() != redop.sizeof_lhs() {
                    bail!(
                        "initial value size {} does not match reduction lhs size {}",
                        initial.len(),
                        redop.sizeof_lhs()
                    );
                }
                inner.initial_value = initial.to_vec();
                inner.redop_id = redop_id;
                inner.redop = Some(redop);
            } else {
                if initial_value.is_some() {
                    bail!("initial value supplied without a reduction operator");
                }
                inner.initial_value.clear();
                inner.redop_id = 0;
                inner.redop = None;
            }
        }
        let barrier = slot.current_barrier();
        info!("barrier created: barrier={barrier} base_count={expected_arrivals} redop={redop_id}");
        Ok(barrier)
    }

    fn allocate_slot(&self) -> Result<Arc<BarrierSlot>> {
        let index = self
            .next_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current <= MAX_SLOT_INDEX).then_some(current + 1)
            })
            .map_err(|_| anyhow!("barrier slot index space exhausted on node {}", self.node))?;
        let id = EventId::new(IdKind::Barrier, self.node, index)?;
        let slot = Arc::new(BarrierSlot::new(id, self.node));
        self.slots.insert(id, slot.clone());
        Ok(slot)
    }

    /// Raise the expected arrival count by `delta`. The returned handle
    /// carries the adjustment timestamp, which a later matching negative
    /// arrival must cite.
    pub fn alter_arrival_count(self: &Arc<Self>, barrier: Barrier, delta: i64) -> Result<Barrier> {
        if delta <= 0 {
            bail!("arrival count delta must be positive");
        }
        let timestamp = self.adjustment_timestamp.fetch_add(1, Ordering::SeqCst);
        self.adjust_arrival(
            Barrier {
                timestamp,
                ..barrier
            },
            delta,
            Event::NO_EVENT,
            None,
        )?;
        Ok(Barrier {
            id: barrier.id,
            gen: barrier.gen,
            timestamp,
        })
    }

    /// Submit `count` arrivals for `barrier.gen`, citing the timestamp in
    /// the handle. A pending `wait_on` defers the arrival; a reduce value
    /// is folded into the generation's reduction slot.
    pub fn arrive(
        self: &Arc<Self>,
        barrier: Barrier,
        count: u32,
        wait_on: Event,
        reduce_value: Option<&[u8]>,
    ) -> Result<()> {
        if count == 0 {
            bail!("barrier arrival count must be non-zero");
        }
        self.adjust_arrival(barrier, -(count as i64), wait_on, reduce_value)
    }

    fn adjust_arrival(
        self: &Arc<Self>,
        barrier: Barrier,
        delta: i64,
        wait_on: Event,
        reduce_value: Option<&[u8]>,
    ) -> Result<()> {
        let slot = self.lookup(barrier.id)?;
        if wait_on.exists() {
            let (done, poisoned) = self.events.has_triggered_faultaware(wait_on)?;
            if !done {
                if slot.owner != self.node {
                    // defer on the owner: if wait_on triggers there the
                    // round trip is saved
                    info!(
                        "forwarding deferred barrier arrival: barrier={barrier} delta={delta} wait_on={wait_on}"
                    );
                    return self.send(
                        slot.owner,
                        &Message::BarrierAdjust {
                            barrier,
                            delta,
                            wait_on,
                            reduce_value: reduce_value.map(<[u8]>::to_vec).unwrap_or_default(),
                        },
                    );
                }
                info!("deferring barrier arrival: barrier={barrier} delta={delta} wait_on={wait_on}");
                return self.events.add_waiter(
                    wait_on,
                    Arc::new(DeferredBarrierArrival {
                        pool: Arc::downgrade(self),
                        barrier,
                        delta,
                        reduce_value: reduce_value.map(<[u8]>::to_vec).unwrap_or_default(),
                    }),
                );
            }
            if poisoned {
                match self.policy {
                    PoisonPolicy::Fatal => {
                        panic!("poisoned prerequisite for barrier arrival: barrier={barrier}")
                    }
                    PoisonPolicy::Surface => {
                        warn!(
                            "dropping barrier arrival with poisoned prerequisite: barrier={barrier}"
                        );
                        return Ok(());
                    }
                }
            }
        }
        if slot.owner != self.node {
            return self.send(
                slot.owner,
                &Message::BarrierAdjust {
                    barrier,
                    delta,
                    wait_on: Event::NO_EVENT,
                    reduce_value: reduce_value.map(<[u8]>::to_vec).unwrap_or_default(),
                },
            );
        }
        self.adjust_local(&slot, barrier.gen, delta, barrier.timestamp, reduce_value)
    }

    /// Owner-side adjustment: account the delta, cascade any triggers over
    /// contiguous zero-count generations, fold in reduction data, and
    /// notify subscribers with coalesced `(previous_gen, trigger_gen)`
    /// ranges.
    fn adjust_local(
        &self,
        slot: &Arc<BarrierSlot>,
        barrier_gen: Generation,
        delta: i64,
        timestamp: u64,
        reduce_value: Option<&[u8]>,
    ) -> Result<()> {
        debug!(
            "barrier adjustment: barrier={}/{barrier_gen} delta={delta} ts={timestamp:#x}",
            slot.me
        );
        let mut trigger_gen = 0;
        let mut local_notifications = WaiterList::new();
        let mut remote_notifications: Vec<RemoteNotification> = Vec::new();
        let mut oldest_previous = 0;
        let mut values_copy: Option<(Vec<u8>, usize)> = None;
        let first_generation;
        let redop_id;
        {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if current >= inner.free_generation {
                bail!("adjustment on reclaimed barrier {}", slot.me);
            }
            if inner.base_arrival_count == 0 {
                bail!("adjustment on uninitialized barrier {}", slot.me);
            }
            if barrier_gen <= current {
                bail!(
                    "barrier {} adjustment for triggered generation {barrier_gen} (current {current})",
                    slot.me
                );
            }
            inner
                .generations
                .entry(barrier_gen)
                .or_default()
                .handle_adjustment(timestamp, delta);

            if barrier_gen == current + 1 {
                let mut generation = current;
                while let Some((gen, record)) = inner.generations.pop_first() {
                    if gen == generation + 1
                        && inner.base_arrival_count as i64 + record.unguarded_delta == 0
                    {
                        local_notifications.extend(record.local_waiters);
                        generation = gen;
                        trigger_gen = gen;
                    } else {
                        inner.generations.insert(gen, record);
                        break;
                    }
                }
                if generation > current {
                    slot.generation.store(generation, Ordering::Release);
                    // figure out which subscribers need a notification and
                    // what range each already knows about
                    let mut targets: Vec<(NodeId, Generation)> = Vec::new();
                    let mut fulfilled: Vec<NodeId> = Vec::new();
                    for (&node, &sub_gen) in &inner.remote_subscribe_gens {
                        if sub_gen <= generation {
                            fulfilled.push(node);
                            targets.push((node, sub_gen));
                        } else {
                            targets.push((node, generation));
                        }
                    }
                    for node in fulfilled {
                        inner.remote_subscribe_gens.remove(&node);
                    }
                    for (node, notify_gen) in targets {
                        let previous_gen = match inner.remote_trigger_gens.get_mut(&node) {
                            Some(known) => {
                                let previous = *known;
                                *known = notify_gen;
                                previous
                            }
                            None => {
                                inner.remote_trigger_gens.insert(node, notify_gen);
                                inner.first_generation
                            }
                        };
                        if remote_notifications.is_empty() || previous_gen < oldest_previous {
                            oldest_previous = previous_gen;
                        }
                        remote_notifications.push(RemoteNotification {
                            node,
                            trigger_gen: notify_gen,
                            previous_gen,
                        });
                    }
                }
            }

            // reduction data lands even while the arrival itself is held;
            // there is no reason to keep raw values around
            if let Some(rhs) = reduce_value {
                let redop = inner
                    .redop
                    .clone()
                    .ok_or_else(|| anyhow!("barrier {} has no reduction operator", slot.me))?;
                if rhs.len() != redop.sizeof_rhs() {
                    bail!(
                        "reduction value size {} does not match rhs size {}",
                        rhs.len(),
                        redop.sizeof_rhs()
                    );
                }
                let rel_gen = (barrier_gen - inner.first_generation) as usize;
                inner.ensure_seeded_capacity(rel_gen);
                let lhs_size = redop.sizeof_lhs();
                let offset = (rel_gen - 1) * lhs_size;
                redop.apply(
                    &mut inner.final_values[offset..offset + lhs_size],
                    rhs,
                    1,
                    true,
                );
            }

            if trigger_gen > 0 && !remote_notifications.is_empty() {
                if let Some(redop) = inner.redop.clone() {
                    let lhs_size = redop.sizeof_lhs();
                    let needed = (trigger_gen - inner.first_generation) as usize;
                    inner.ensure_seeded_capacity(needed);
                    let start = (oldest_previous - inner.first_generation) as usize * lhs_size;
                    let count = (trigger_gen - oldest_previous) as usize;
                    values_copy = Some((
                        inner.final_values[start..start + count * lhs_size].to_vec(),
                        lhs_size,
                    ));
                }
            }
            first_generation = inner.first_generation;
            redop_id = inner.redop_id;
        }

        if trigger_gen > 0 {
            debug!("barrier trigger: barrier={}/{trigger_gen}", slot.me);
            let event = Event {
                id: slot.me,
                gen: trigger_gen,
            };
            wake_all(local_notifications, event, false);
            for notification in remote_notifications {
                info!(
                    "sending barrier trigger notification: barrier={}/{} -> {} dest={}",
                    slot.me,
                    notification.previous_gen,
                    notification.trigger_gen,
                    notification.node
                );
                let reduce_data = values_copy
                    .as_ref()
                    .map(|(bytes, lhs_size)| {
                        let start = (notification.previous_gen - oldest_previous) as usize * lhs_size;
                        let len =
                            (notification.trigger_gen - notification.previous_gen) as usize * lhs_size;
                        bytes[start..start + len].to_vec()
                    })
                    .unwrap_or_default();
                self.send(
                    notification.node,
                    &Message::BarrierTrigger {
                        barrier_id: slot.me,
                        trigger_gen: notification.trigger_gen,
                        previous_gen: notification.previous_gen,
                        first_generation,
                        redop_id,
                        reduce_data,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Lock-free generation check. On a non-owner the query doubles as the
    /// subscription point: asking about an untriggered generation sends a
    /// `BarrierSubscribe` upstream (once per generation).
    pub fn has_triggered(&self, barrier: Barrier) -> Result<bool> {
        let slot = self.lookup(barrier.id)?;
        if barrier.gen <= slot.generation.load(Ordering::Acquire) {
            return Ok(true);
        }
        if slot.owner != self.node {
            let previous = {
                let mut inner = slot.inner.lock();
                let previous = inner.gen_subscribed;
                if previous < barrier.gen {
                    inner.gen_subscribed = barrier.gen;
                }
                previous
            };
            if previous < barrier.gen {
                info!("subscribing to barrier: barrier={barrier}");
                self.send(
                    slot.owner,
                    &Message::BarrierSubscribe {
                        barrier_id: barrier.id,
                        subscribe_gen: barrier.gen,
                    },
                )?;
            }
        }
        Ok(false)
    }

    /// Register a waiter for `barrier.gen`; fires inline when the
    /// generation has already triggered. Barrier triggers never carry
    /// poison.
    pub fn add_waiter(&self, barrier: Barrier, waiter: Arc<dyn EventWaiter>) -> Result<()> {
        let slot = self.lookup(barrier.id)?;
        let mut fire = false;
        let mut subscribe = false;
        {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if barrier.gen > current {
                trace!(
                    "barrier waiter registered: barrier={barrier} (current {current})"
                );
                inner
                    .generations
                    .entry(barrier.gen)
                    .or_default()
                    .local_waiters
                    .push(waiter.clone());
                if slot.owner != self.node && inner.gen_subscribed < barrier.gen {
                    inner.gen_subscribed = barrier.gen;
                    subscribe = true;
                }
            } else {
                fire = true;
            }
        }
        if subscribe {
            self.send(
                slot.owner,
                &Message::BarrierSubscribe {
                    barrier_id: barrier.id,
                    subscribe_gen: barrier.gen,
                },
            )?;
        }
        if fire {
            waiter.on_triggered(
                Event {
                    id: barrier.id,
                    gen: barrier.gen,
                },
                false,
            );
        }
        Ok(())
    }

    /// Suspend the calling task until the generation triggers.
    pub async fn wait(&self, barrier: Barrier) -> Result<()> {
        if self.has_triggered(barrier)? {
            return Ok(());
        }
        let cond = AsyncCondition::new();
        self.add_waiter(barrier, cond.clone())?;
        cond.wait().await;
        Ok(())
    }

    /// Barriers have no external (non-runtime-thread) wait path.
    pub fn external_wait(&self, barrier: Barrier) -> Result<()> {
        bail!("external wait on barriers is not supported (barrier {barrier})")
    }

    /// Copy out the reduction result for a triggered generation. Returns
    /// `Ok(false)` while the generation is still pending. A triggered
    /// generation that never saw a reduce value yields the initial value.
    pub fn get_result(&self, barrier: Barrier, value: &mut [u8]) -> Result<bool> {
        let slot = self.lookup(barrier.id)?;
        let inner = slot.inner.lock();
        if barrier.gen > slot.generation.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let redop = inner
            .redop
            .clone()
            .ok_or_else(|| anyhow!("barrier {} has no reduction operator", slot.me))?;
        let lhs_size = redop.sizeof_lhs();
        if value.len() != lhs_size {
            bail!(
                "result buffer size {} does not match reduction lhs size {lhs_size}",
                value.len()
            );
        }
        if barrier.gen <= inner.first_generation {
            bail!(
                "result request predates barrier lifetime: barrier={barrier} first={}",
                inner.first_generation
            );
        }
        let rel_gen = (barrier.gen - inner.first_generation) as usize;
        if rel_gen > inner.value_capacity {
            if inner.initial_value.len() != lhs_size {
                bail!("reduction result for {barrier} was never delivered to this node");
            }
            value.copy_from_slice(&inner.initial_value);
        } else {
            let offset = (rel_gen - 1) * lhs_size;
            value.copy_from_slice(&inner.final_values[offset..offset + lhs_size]);
        }
        Ok(true)
    }

    /// Deallocation is best-effort and currently advisory only.
    pub fn destroy_barrier(&self, barrier: Barrier) {
        info!("barrier destruction request: barrier={barrier}");
    }

    /// Owner-side handler for `BarrierAdjust`.
    pub(crate) fn handle_adjust(
        self: &Arc<Self>,
        barrier: Barrier,
        delta: i64,
        wait_on: Event,
        reduce_value: Vec<u8>,
    ) -> Result<()> {
        info!(
            "received barrier arrival: barrier={barrier} delta={delta} wait_on={wait_on}"
        );
        let reduce = (!reduce_value.is_empty()).then_some(reduce_value.as_slice());
        self.adjust_arrival(barrier, delta, wait_on, reduce)
    }

    /// Owner-side handler for `BarrierSubscribe`: record the subscriber
    /// and, if generations it has not seen already triggered, synthesize an
    /// immediate `BarrierTrigger` with the reduction slice.
    pub(crate) fn handle_subscribe(
        &self,
        sender: NodeId,
        barrier_id: EventId,
        subscribe_gen: Generation,
    ) -> Result<()> {
        let slot = self.lookup(barrier_id)?;
        if slot.owner != self.node {
            bail!("subscription for non-owned barrier {barrier_id}");
        }
        let mut trigger_gen = 0;
        let mut previous_gen = 0;
        let mut payload: Vec<u8> = Vec::new();
        let first_generation;
        let redop_id;
        {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if subscribe_gen <= inner.first_generation {
                bail!(
                    "stale barrier subscription: barrier={barrier_id} gen={subscribe_gen} first={}",
                    inner.first_generation
                );
            }
            let mut already_subscribed = false;
            match inner.remote_subscribe_gens.get_mut(&sender) {
                Some(existing) => {
                    if *existing >= subscribe_gen {
                        already_subscribed = true;
                    } else {
                        *existing = subscribe_gen;
                    }
                }
                None => {
                    // recorded subscriptions only cover generations that
                    // have not triggered yet
                    if subscribe_gen > current {
                        inner.remote_subscribe_gens.insert(sender, subscribe_gen);
                    }
                }
            }
            if !already_subscribed && current > inner.first_generation {
                let known = inner.remote_trigger_gens.get(&sender).copied();
                if known.map_or(true, |gen| gen < current) {
                    previous_gen = known.unwrap_or(inner.first_generation);
                    trigger_gen = current;
                    inner.remote_trigger_gens.insert(sender, current);
                    if let Some(redop) = inner.redop.clone() {
                        let lhs_size = redop.sizeof_lhs();
                        let needed = (current - inner.first_generation) as usize;
                        inner.ensure_seeded_capacity(needed);
                        let start = (previous_gen - inner.first_generation) as usize * lhs_size;
                        let len = (trigger_gen - previous_gen) as usize * lhs_size;
                        payload = inner.final_values[start..start + len].to_vec();
                    }
                }
            }
            first_generation = inner.first_generation;
            redop_id = inner.redop_id;
        }
        if trigger_gen > 0 {
            info!(
                "sending immediate barrier trigger: barrier={barrier_id}/{previous_gen} -> {trigger_gen} dest={sender}"
            );
            self.send(
                sender,
                &Message::BarrierTrigger {
                    barrier_id,
                    trigger_gen,
                    previous_gen,
                    first_generation,
                    redop_id,
                    reduce_data: payload,
                },
            )?;
        }
        Ok(())
    }

    /// Non-owner handler for `BarrierTrigger`. Trigger messages may arrive
    /// out of order; a message whose `previous_gen` is ahead of the local
    /// generation is parked and absorbed later, collapsing contiguous
    /// ranges as they connect.
    pub(crate) fn handle_trigger(
        &self,
        sender: NodeId,
        barrier_id: EventId,
        trigger_gen: Generation,
        previous_gen: Generation,
        first_generation: Generation,
        redop_id: ReductionOpId,
        reduce_data: Vec<u8>,
    ) -> Result<()> {
        info!(
            "received remote barrier trigger: barrier={barrier_id}/{previous_gen} -> {trigger_gen} from={sender}"
        );
        let slot = self.lookup(barrier_id)?;
        if slot.owner == self.node {
            bail!("barrier trigger for owned barrier {barrier_id}");
        }
        let mut woken_gen = trigger_gen;
        let mut to_wake = WaiterList::new();
        {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if previous_gen == current {
                while let Some((&held_previous, &held_trigger)) = inner.held_triggers.first_key_value()
                {
                    if held_previous != woken_gen {
                        break;
                    }
                    info!(
                        "collapsing future barrier trigger: barrier={barrier_id} {held_previous} -> {held_trigger}"
                    );
                    inner.held_triggers.pop_first();
                    woken_gen = held_trigger;
                }
                slot.generation.store(woken_gen, Ordering::Release);
                while let Some((gen, record)) = inner.generations.pop_first() {
                    if gen > woken_gen {
                        inner.generations.insert(gen, record);
                        break;
                    }
                    to_wake.extend(record.local_waiters);
                }
            } else {
                info!(
                    "holding future barrier trigger: barrier={barrier_id} at {current} ({previous_gen} -> {trigger_gen})"
                );
                inner.held_triggers.insert(previous_gen, trigger_gen);
            }

            if !reduce_data.is_empty() {
                if redop_id == 0 {
                    bail!("barrier reduction payload without an operator id");
                }
                let redop = self
                    .redops
                    .lookup(redop_id)
                    .ok_or_else(|| anyhow!("unknown reduction operator {redop_id}"))?;
                let lhs_size = redop.sizeof_lhs();
                // the payload covers exactly the range the message names
                if reduce_data.len() != lhs_size * (trigger_gen - previous_gen) as usize {
                    bail!(
                        "barrier reduction payload size mismatch: got {} expected {}",
                        reduce_data.len(),
                        lhs_size * (trigger_gen - previous_gen) as usize
                    );
                }
                inner.redop_id = redop_id;
                inner.redop = Some(redop);
                inner.first_generation = first_generation;
                let needed = (trigger_gen - first_generation) as usize;
                if inner.value_capacity < needed {
                    // entries are overwritten by this or later deliveries
                    inner.final_values.resize(needed * lhs_size, 0);
                    inner.value_capacity = needed;
                }
                let start = (previous_gen - first_generation) as usize * lhs_size;
                inner.final_values[start..start + reduce_data.len()].copy_from_slice(&reduce_data);
            }
        }
        wake_all(
            to_wake,
            Event {
                id: barrier_id,
                gen: woken_gen,
            },
            false,
        );
        Ok(())
    }
}
