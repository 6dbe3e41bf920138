// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generational event pool.
//!
//! One [`GenEvent`] slot per id, recycled across successive generations
//! through a free list. The owner node holds authoritative state; other
//! nodes materialize a cached slot on demand whose view is conservatively
//! behind the owner's. The dominant query, [`EventPool::has_triggered`],
//! never takes the slot lock: `generation` is published with release
//! ordering *after* the poisoned-generation array, so an acquire load of
//! the generation licenses a lock-free scan of the poison list.

mod merger;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::am::{Message, NodeMessenger};
use crate::id::{Event, EventId, Generation, IdKind, NodeId, MAX_SLOT_INDEX};
use crate::runtime::{PoisonPolicy, RuntimeConfig};
use crate::waiter::{wake_all, AsyncCondition, EventWaiter, ExternalCondition, WaiterList};

/// A slot stops being recycled once this many of its generations have been
/// poisoned; the poison list must stay resident for as long as the id can
/// be queried.
pub(crate) const POISONED_GENERATION_LIMIT: usize = 16;

// Stop recycling just short of wrapping the generation counter.
const RETIRE_GENERATION: Generation = Generation::MAX - 1;

/// Per-id slot. Atomics carry the lock-free fast path; everything list-like
/// lives under the mutex.
pub(crate) struct GenEvent {
    me: EventId,
    owner: NodeId,
    generation: AtomicU32,
    num_poisoned: AtomicU32,
    poisoned: [AtomicU32; POISONED_GENERATION_LIMIT],
    has_local_triggers: AtomicBool,
    inner: Mutex<GenEventInner>,
}

#[derive(Default)]
struct GenEventInner {
    /// Newest generation we have subscribed to upstream (non-owner only).
    gen_subscribed: Generation,
    /// Waiters for `generation + 1`.
    current_waiters: WaiterList,
    /// Waiters for generations beyond the next (non-owner only).
    future_waiters: BTreeMap<Generation, WaiterList>,
    /// Nodes subscribed to `generation + 1` (owner only).
    remote_waiters: BTreeSet<NodeId>,
    /// Generations we triggered locally whose official poison status from
    /// the owner is still pending (non-owner only).
    local_triggers: BTreeMap<Generation, bool>,
}

impl GenEvent {
    fn new(me: EventId, owner: NodeId) -> Self {
        Self {
            me,
            owner,
            generation: AtomicU32::new(0),
            num_poisoned: AtomicU32::new(0),
            poisoned: std::array::from_fn(|_| AtomicU32::new(0)),
            has_local_triggers: AtomicBool::new(false),
            inner: Mutex::new(GenEventInner::default()),
        }
    }

    /// Handle for the next untriggered generation of this slot.
    fn current_event(&self) -> Event {
        Event {
            id: self.me,
            gen: self.generation.load(Ordering::Acquire) + 1,
        }
    }

    /// Safe without the lock once the caller has observed a `generation`
    /// at or past the queried one (the poison list is published first).
    fn is_generation_poisoned(&self, gen: Generation) -> bool {
        let count = self.num_poisoned.load(Ordering::Acquire) as usize;
        if count == 0 {
            return false;
        }
        self.poisoned[..count.min(POISONED_GENERATION_LIMIT)]
            .iter()
            .any(|slot| slot.load(Ordering::Relaxed) == gen)
    }

    fn poisoned_snapshot(&self) -> Vec<Generation> {
        let count = self.num_poisoned.load(Ordering::Acquire) as usize;
        self.poisoned[..count.min(POISONED_GENERATION_LIMIT)]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }
}

/// Per-node table of event slots, free-list backed on the owner side.
pub struct EventPool {
    node: NodeId,
    policy: PoisonPolicy,
    slots: DashMap<EventId, Arc<GenEvent>>,
    free: Mutex<VecDeque<Arc<GenEvent>>>,
    next_index: AtomicU64,
    messenger: RwLock<Option<Arc<dyn NodeMessenger>>>,
}

impl EventPool {
    pub(crate) fn new(node: NodeId, config: &RuntimeConfig) -> Self {
        Self {
            node,
            policy: config.poison_policy,
            slots: DashMap::with_capacity(config.initial_slot_capacity),
            free: Mutex::new(VecDeque::new()),
            next_index: AtomicU64::new(0),
            messenger: RwLock::new(None),
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

    fn broadcast(&self, targets: &[NodeId], message: &Message) -> Result<()> {
        self.messenger()?.broadcast(targets, message.encode()?)
    }

    fn lookup(&self, id: EventId) -> Result<Arc<GenEvent>> {
        if !id.is_event() {
            bail!("id {id} does not name an event");
        }
        if id.owner_node() == self.node {
            self.slots
                .get(&id)
                .map(|slot| slot.clone())
                .ok_or_else(|| anyhow!("unknown local event {id}"))
        } else {
            Ok(self
                .slots
                .entry(id)
                .or_insert_with(|| Arc::new(GenEvent::new(id, id.owner_node())))
                .clone())
        }
    }

    /// Allocate a fresh event from this node's pool. The returned handle
    /// names the next untriggered generation of the slot.
    pub fn create_event(&self) -> Result<Event> {
        let slot = match self.free.lock().pop_front() {
            Some(slot) => slot,
            None => self.allocate_slot()?,
        };
        let event = slot.current_event();
        trace!("event created: event={event}");
        Ok(event)
    }

    fn allocate_slot(&self) -> Result<Arc<GenEvent>> {
        let index = self
            .next_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current <= MAX_SLOT_INDEX).then_some(current + 1)
            })
            .map_err(|_| anyhow!("event slot index space exhausted on node {}", self.node))?;
        let id = EventId::new(IdKind::Event, self.node, index)?;
        let slot = Arc::new(GenEvent::new(id, self.node));
        self.slots.insert(id, slot.clone());
        Ok(slot)
    }

    /// Lock-free in the common case: one acquire load of the generation,
    /// then the poison array. The slot lock is taken only when this node
    /// has provisional local triggers to consult.
    pub fn has_triggered_faultaware(&self, e: Event) -> Result<(bool, bool)> {
        if !e.exists() {
            return Ok((true, false));
        }
        let slot = self.lookup(e.id)?;
        if e.gen <= slot.generation.load(Ordering::Acquire) {
            return Ok((true, slot.is_generation_poisoned(e.gen)));
        }
        if !slot.has_local_triggers.load(Ordering::Acquire) {
            return Ok((false, false));
        }
        let inner = slot.inner.lock();
        Ok(match inner.local_triggers.get(&e.gen) {
            Some(&poisoned) => (true, poisoned),
            None => (false, false),
        })
    }

    /// Fault-unaware query; observing poison here is governed by the pool's
    /// [`PoisonPolicy`].
    pub fn has_triggered(&self, e: Event) -> Result<bool> {
        let (done, poisoned) = self.has_triggered_faultaware(e)?;
        if done && poisoned {
            self.unexpected_poison(e, "has_triggered")?;
        }
        Ok(done)
    }

    fn unexpected_poison(&self, e: Event, what: &str) -> Result<()> {
        match self.policy {
            PoisonPolicy::Fatal => {
                panic!("poisoned generation observed by fault-unaware {what}: event={e}")
            }
            PoisonPolicy::Surface => bail!("event {e} is poisoned"),
        }
    }

    /// Register a waiter for `e.gen`. Already-triggered generations invoke
    /// the waiter inline; otherwise it is queued, and a non-owner emits a
    /// subscription upstream if this generation is newer than any it has
    /// asked about before.
    pub fn add_waiter(&self, e: Event, waiter: Arc<dyn EventWaiter>) -> Result<()> {
        if !e.exists() {
            waiter.on_triggered(e, false);
            return Ok(());
        }
        let slot = self.lookup(e.id)?;
        let mut fire: Option<bool> = None;
        let mut subscribe: Option<Generation> = None;
        {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if e.gen <= current {
                fire = Some(slot.is_generation_poisoned(e.gen));
            } else if let Some(&poisoned) = inner.local_triggers.get(&e.gen) {
                fire = Some(poisoned);
            } else {
                debug!(
                    "event not ready: event={e} owner={} gen={current} subscribed={}",
                    slot.owner, inner.gen_subscribed
                );
                if e.gen == current + 1 {
                    inner.current_waiters.push(waiter.clone());
                } else {
                    // only the owner advances the generation, so future
                    // waiters are meaningful on non-owners alone
                    if slot.owner == self.node {
                        bail!("waiter for future generation on owned event {e}");
                    }
                    inner
                        .future_waiters
                        .entry(e.gen)
                        .or_default()
                        .push(waiter.clone());
                }
                if slot.owner != self.node && inner.gen_subscribed < e.gen {
                    subscribe = Some(inner.gen_subscribed);
                    inner.gen_subscribed = e.gen;
                }
            }
        }
        if let Some(previous_subscribe_gen) = subscribe {
            self.send(
                slot.owner,
                &Message::EventSubscribe {
                    event: e,
                    previous_subscribe_gen,
                },
            )?;
        }
        if let Some(poisoned) = fire {
            waiter.on_triggered(e, poisoned);
        }
        Ok(())
    }

    /// Suspend the calling task until `e` triggers; poison resolution is
    /// governed by the pool's [`PoisonPolicy`].
    pub async fn wait(&self, e: Event) -> Result<()> {
        let poisoned = self.wait_faultaware(e).await?;
        if poisoned {
            self.unexpected_poison(e, "wait")?;
        }
        Ok(())
    }

    /// Suspend until `e` triggers; returns the poison flag.
    pub async fn wait_faultaware(&self, e: Event) -> Result<bool> {
        if !e.exists() {
            return Ok(false);
        }
        let (done, poisoned) = self.has_triggered_faultaware(e)?;
        if done {
            return Ok(poisoned);
        }
        debug!("task blocked: event={e}");
        let cond = AsyncCondition::new();
        self.add_waiter(e, cond.clone())?;
        let poisoned = cond.wait().await;
        debug!("task resumed: event={e} poisoned={poisoned}");
        Ok(poisoned)
    }

    /// Blocking wait for threads not managed by the async runtime.
    pub fn external_wait(&self, e: Event) -> Result<()> {
        let poisoned = self.external_wait_faultaware(e)?;
        if poisoned {
            self.unexpected_poison(e, "external_wait")?;
        }
        Ok(())
    }

    pub fn external_wait_faultaware(&self, e: Event) -> Result<bool> {
        if !e.exists() {
            return Ok(false);
        }
        let (done, poisoned) = self.has_triggered_faultaware(e)?;
        if done {
            return Ok(poisoned);
        }
        debug!("external thread blocked: event={e}");
        let cond = ExternalCondition::new();
        self.add_waiter(e, cond.clone())?;
        let poisoned = cond.wait();
        debug!("external thread resumed: event={e}");
        Ok(poisoned)
    }

    /// Trigger generation `e.gen`. On the owner this is the authoritative
    /// transition; on any other node the owner is told first and the local
    /// cached view updated provisionally.
    pub fn trigger(&self, e: Event, poisoned: bool) -> Result<()> {
        if !e.exists() {
            bail!("cannot trigger the null event");
        }
        let slot = self.lookup(e.id)?;
        if slot.owner == self.node {
            self.trigger_owned(&slot, e.gen, self.node, poisoned)
        } else {
            self.trigger_remote_copy(&slot, e.gen, poisoned)
        }
    }

    /// Operation cancellation is not part of this core; the only way to
    /// fail a dependent is to poison-trigger a prerequisite.
    pub fn cancel_operation(&self, e: Event) -> Result<()> {
        bail!("operation cancellation is not supported (event {e})")
    }

    fn trigger_owned(
        &self,
        slot: &Arc<GenEvent>,
        gen: Generation,
        trigger_node: NodeId,
        poisoned: bool,
    ) -> Result<()> {
        let event = Event { id: slot.me, gen };
        debug!("event triggered: event={event} node={trigger_node} poisoned={poisoned}");
        let (to_wake, to_update, free_slot) = {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if gen != current + 1 {
                bail!("event {event} trigger is not for the next generation (current {current})");
            }
            if !inner.future_waiters.is_empty() {
                bail!("owner slot for event {event} holds future waiters");
            }
            if poisoned {
                let count = slot.num_poisoned.load(Ordering::Relaxed) as usize;
                if count >= POISONED_GENERATION_LIMIT {
                    bail!("event {event} exceeded the poisoned generation limit");
                }
                slot.poisoned[count].store(gen, Ordering::Relaxed);
                slot.num_poisoned.store(count as u32 + 1, Ordering::Release);
            }
            // poison list first, generation second: readers of the
            // generation may then scan the list without the lock
            slot.generation.store(gen, Ordering::Release);
            let pinned =
                slot.num_poisoned.load(Ordering::Relaxed) as usize >= POISONED_GENERATION_LIMIT;
            (
                std::mem::take(&mut inner.current_waiters),
                std::mem::take(&mut inner.remote_waiters),
                !pinned && gen < RETIRE_GENERATION,
            )
        };
        if !to_update.is_empty() {
            let update = Message::EventUpdate {
                event,
                poisoned_generations: slot.poisoned_snapshot(),
            };
            let targets: Vec<NodeId> = to_update.into_iter().collect();
            if let Err(err) = self.broadcast(&targets, &update) {
                warn!("failed to broadcast update for {event}: {err}");
            }
        }
        if free_slot {
            self.free.lock().push_back(slot.clone());
        } else {
            debug!("event slot pinned: event={event}");
        }
        wake_all(to_wake, event, poisoned);
        Ok(())
    }

    fn trigger_remote_copy(
        &self,
        slot: &Arc<GenEvent>,
        gen: Generation,
        poisoned: bool,
    ) -> Result<()> {
        let event = Event { id: slot.me, gen };
        debug!("remote event triggered locally: event={event} poisoned={poisoned}");
        // the owner learns first; our cached view is updated provisionally
        self.send(slot.owner, &Message::EventTrigger { event, poisoned })?;
        let mut to_wake = WaiterList::new();
        let mut subscribe: Option<Generation> = None;
        {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if gen <= current {
                // the owner's update overtook us; nothing left to do
            } else if gen == current + 1 {
                to_wake.append(&mut inner.current_waiters);
                if let Some(list) = inner.future_waiters.remove(&gen) {
                    to_wake.extend(list);
                }
                if let Some(list) = inner.future_waiters.remove(&(gen + 1)) {
                    inner.current_waiters = list;
                }
                // the official poison list is owner-maintained; remember
                // the flag locally until the update message confirms it
                if poisoned {
                    inner.local_triggers.insert(gen, true);
                    slot.has_local_triggers.store(true, Ordering::Release);
                }
                slot.generation.store(gen, Ordering::Release);
            } else {
                // generations in between have triggered somewhere but their
                // poison status is unknown here; only the future waiters
                // for exactly this generation can be woken
                if let Some(list) = inner.future_waiters.remove(&gen) {
                    to_wake = list;
                }
                inner.local_triggers.insert(gen, poisoned);
                slot.has_local_triggers.store(true, Ordering::Release);
                if inner.gen_subscribed < gen {
                    subscribe = Some(inner.gen_subscribed);
                    inner.gen_subscribed = gen;
                }
            }
        }
        if let Some(previous_subscribe_gen) = subscribe {
            self.send(
                slot.owner,
                &Message::EventSubscribe {
                    event,
                    previous_subscribe_gen,
                },
            )?;
        }
        wake_all(to_wake, event, poisoned);
        Ok(())
    }

    /// Owner-side handler for `EventSubscribe`.
    pub(crate) fn handle_subscribe(
        &self,
        sender: NodeId,
        event: Event,
        previous_subscribe_gen: Generation,
    ) -> Result<()> {
        let slot = self.lookup(event.id)?;
        if slot.owner != self.node {
            bail!("subscription for non-owned event {event}");
        }
        debug!("event subscription: node={sender} event={event}");
        let mut trigger_gen = 0;
        // stale-generation fast path: no lock needed to answer an old ask
        let stale = slot.generation.load(Ordering::Acquire);
        if stale >= event.gen {
            trigger_gen = stale;
        } else {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            if current > previous_subscribe_gen {
                trigger_gen = current;
            }
            if event.gen == current + 1 {
                inner.remote_waiters.insert(sender);
                debug!("event subscription recorded: node={sender} event={event}");
            } else if event.gen > current + 1 {
                // a handle for that generation cannot exist yet
                bail!("subscription for untriggerable generation: event={event}");
            }
        }
        if trigger_gen > 0 {
            self.send(
                sender,
                &Message::EventUpdate {
                    event: Event {
                        id: event.id,
                        gen: trigger_gen,
                    },
                    poisoned_generations: slot.poisoned_snapshot(),
                },
            )?;
        }
        Ok(())
    }

    /// Owner-side handler for `EventTrigger`.
    pub(crate) fn handle_trigger(&self, sender: NodeId, event: Event, poisoned: bool) -> Result<()> {
        let slot = self.lookup(event.id)?;
        if slot.owner != self.node {
            bail!("remote trigger for non-owned event {event}");
        }
        self.trigger_owned(&slot, event.gen, sender, poisoned)
    }

    /// Non-owner handler for `EventUpdate`: absorb the authoritative poison
    /// list, advance the cached generation, and wake everything at or
    /// before it.
    pub(crate) fn handle_update(
        &self,
        event: Event,
        new_poisoned: &[Generation],
    ) -> Result<()> {
        let slot = self.lookup(event.id)?;
        if slot.owner == self.node {
            bail!("update message for owned event {event}");
        }
        debug!(
            "event update: event={event} poisoned={:?}",
            new_poisoned
        );
        let mut to_wake: BTreeMap<Generation, WaiterList> = BTreeMap::new();
        {
            let mut inner = slot.inner.lock();
            let current = slot.generation.load(Ordering::Relaxed);
            // old news if we subscribed and then triggered it ourselves
            if event.gen <= current {
                return Ok(());
            }
            if new_poisoned.len() > POISONED_GENERATION_LIMIT {
                bail!("oversized poison list in update for {event}");
            }
            let known = slot.num_poisoned.load(Ordering::Relaxed) as usize;
            if new_poisoned.len() > known {
                for (i, gen) in new_poisoned.iter().enumerate() {
                    slot.poisoned[i].store(*gen, Ordering::Relaxed);
                }
                slot.num_poisoned
                    .store(new_poisoned.len() as u32, Ordering::Release);
            }
            if !inner.current_waiters.is_empty() {
                let list = std::mem::take(&mut inner.current_waiters);
                to_wake.insert(current + 1, list);
            }
            while let Some((gen, list)) = inner.future_waiters.pop_first() {
                if gen <= event.gen {
                    to_wake.entry(gen).or_default().extend(list);
                } else if gen == event.gen + 1 {
                    inner.current_waiters = list;
                    break;
                } else {
                    inner.future_waiters.insert(gen, list);
                    break;
                }
            }
            if slot.has_local_triggers.load(Ordering::Relaxed) {
                inner.local_triggers.retain(|&gen, _| gen > event.gen);
                slot.has_local_triggers
                    .store(!inner.local_triggers.is_empty(), Ordering::Release);
            }
            slot.generation.store(event.gen, Ordering::Release);
        }
        for (gen, list) in to_wake {
            let woken = Event { id: slot.me, gen };
            let poisoned = slot.is_generation_poisoned(gen);
            wake_all(list, woken, poisoned);
        }
        Ok(())
    }
}
