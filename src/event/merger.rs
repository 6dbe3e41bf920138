// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Event composition: merges, deferred triggers and user events.
//!
//! A merger joins N input events into one output event without back
//! pointers: the output is named by handle only, and the merger reaches the
//! pool through a weak reference, so the slot table never ends up in a
//! reference cycle with its own waiter lists.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use crate::event::EventPool;
use crate::id::{Event, UserEvent};
use crate::waiter::EventWaiter;

/// Transient join coordinator. `count_needed` starts at 1: the extra count
/// stands for "arming not finished" and is retired by [`EventMerger::arm`],
/// so the output cannot fire while inputs are still being added. Faults are
/// always counted; whether they propagate depends on `ignore_faults`.
pub(crate) struct EventMerger {
    pool: Weak<EventPool>,
    finish_event: Event,
    ignore_faults: bool,
    count_needed: AtomicU32,
    faults_observed: AtomicU32,
}

impl EventMerger {
    fn new(pool: &Arc<EventPool>, finish_event: Event, ignore_faults: bool) -> Arc<Self> {
        Arc::new(Self {
            pool: Arc::downgrade(pool),
            finish_event,
            ignore_faults,
            count_needed: AtomicU32::new(1),
            faults_observed: AtomicU32::new(0),
        })
    }

    fn add_event(self: &Arc<Self>, pool: &Arc<EventPool>, wait_for: Event) -> Result<()> {
        let (done, poisoned) = pool.has_triggered_faultaware(wait_for)?;
        if done {
            if poisoned {
                self.observe_fault(pool);
            }
            // a finished input never joins the count
            return Ok(());
        }
        self.count_needed.fetch_add(1, Ordering::SeqCst);
        pool.add_waiter(wait_for, self.clone())
    }

    fn observe_fault(&self, pool: &EventPool) {
        let first_fault = self.faults_observed.fetch_add(1, Ordering::SeqCst) == 0;
        if first_fault && !self.ignore_faults {
            info!("event merger poisoned: after={}", self.finish_event);
            if let Err(err) = pool.trigger(self.finish_event, true) {
                warn!("failed to poison merged event {}: {err}", self.finish_event);
            }
        }
    }

    /// Retire the arming count once every input has been added; the output
    /// may fire inside this call.
    fn arm(self: &Arc<Self>) {
        self.on_triggered(Event::NO_EVENT, false);
    }
}

impl EventWaiter for EventMerger {
    fn on_triggered(&self, _event: Event, poisoned: bool) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return true;
        };
        if poisoned {
            self.observe_fault(&pool);
        }
        let count_before = self.count_needed.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "merged event countdown: event={} left={} poisoned={poisoned}",
            self.finish_event,
            count_before - 1
        );
        let last_trigger = count_before == 1;
        // fire on the last input unless poison already went out eagerly
        if last_trigger && (self.ignore_faults || self.faults_observed.load(Ordering::SeqCst) == 0)
        {
            if let Err(err) = pool.trigger(self.finish_event, false) {
                warn!("failed to trigger merged event {}: {err}", self.finish_event);
            }
        }
        last_trigger
    }

    fn describe(&self) -> String {
        format!(
            "event merger: {} left={}",
            self.finish_event,
            self.count_needed.load(Ordering::Relaxed)
        )
    }
}

/// Waiter that forwards a trigger (and its poison) to another event. Used
/// by user events whose trigger is gated on a precondition.
pub(crate) struct DeferredEventTrigger {
    pool: Weak<EventPool>,
    after_event: Event,
}

impl EventWaiter for DeferredEventTrigger {
    fn on_triggered(&self, _event: Event, poisoned: bool) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return true;
        };
        if poisoned {
            info!("poisoned deferred trigger: event={}", self.after_event);
        } else {
            info!("deferred trigger occurring: event={}", self.after_event);
        }
        if let Err(err) = pool.trigger(self.after_event, poisoned) {
            warn!(
                "failed to fire deferred trigger for {}: {err}",
                self.after_event
            );
        }
        true
    }

    fn describe(&self) -> String {
        format!("deferred trigger: after={}", self.after_event)
    }
}

impl EventPool {
    /// Returns an event that triggers once every input has triggered, and
    /// is poisoned iff any input is poisoned.
    ///
    /// An input that is already poisoned short-circuits: the poisoned input
    /// itself is returned. Zero pending inputs collapse to
    /// [`Event::NO_EVENT`], a single pending input is returned as-is.
    pub fn merge_events(self: &Arc<Self>, wait_for: &[Event]) -> Result<Event> {
        self.merge(wait_for, false)
    }

    /// As [`EventPool::merge_events`], but input poison is counted and
    /// never propagated: the result is always a clean event. A single
    /// pending input is *not* returned directly here, since it must be
    /// laundered into a non-poisoned event.
    pub fn merge_events_ignorefaults(self: &Arc<Self>, wait_for: &[Event]) -> Result<Event> {
        self.merge(wait_for, true)
    }

    fn merge(self: &Arc<Self>, wait_for: &[Event], ignore_faults: bool) -> Result<Event> {
        if wait_for.is_empty() {
            return Ok(Event::NO_EVENT);
        }
        let mut wait_count = 0usize;
        let mut first_wait = Event::NO_EVENT;
        for &ev in wait_for {
            let (done, poisoned) = self.has_triggered_faultaware(ev)?;
            if done {
                if poisoned && !ignore_faults {
                    info!("merging events: {ev} already poisoned");
                    return Ok(ev);
                }
            } else {
                if wait_count == 0 {
                    first_wait = ev;
                }
                wait_count += 1;
            }
        }
        debug!("merging events: {wait_count} not yet triggered");
        if wait_count == 0 {
            return Ok(Event::NO_EVENT);
        }
        if wait_count == 1 && !ignore_faults {
            return Ok(first_wait);
        }

        let finish_event = self.create_event()?;
        let merger = EventMerger::new(self, finish_event, ignore_faults);
        for &ev in wait_for {
            if !ev.exists() {
                continue;
            }
            trace!("event merging: event={finish_event} wait_on={ev}");
            merger.add_event(self, ev)?;
        }
        merger.arm();
        Ok(finish_event)
    }

    pub fn create_user_event(&self) -> Result<UserEvent> {
        let event = self.create_event()?;
        info!("user event created: event={event}");
        Ok(UserEvent(event))
    }

    /// Trigger a user event once `wait_on` has triggered, propagating
    /// `wait_on`'s poison. Fires immediately when `wait_on` is already
    /// done.
    pub fn trigger_user_event(self: &Arc<Self>, user: UserEvent, wait_on: Event) -> Result<()> {
        let event = user.event();
        let (done, poisoned) = self.has_triggered_faultaware(wait_on)?;
        if !done {
            info!("deferring user event trigger: event={event} wait_on={wait_on}");
            return self.add_waiter(
                wait_on,
                Arc::new(DeferredEventTrigger {
                    pool: Arc::downgrade(self),
                    after_event: event,
                }),
            );
        }
        info!("user event trigger: event={event} wait_on={wait_on}");
        self.trigger(event, poisoned)
    }

    /// Trigger a user event as poisoned, failing its dependents fast.
    pub fn cancel_user_event(&self, user: UserEvent) -> Result<()> {
        info!("user event cancelled: event={}", user.event());
        self.trigger(user.event(), true)
    }
}
