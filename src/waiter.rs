// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Waiter contract shared by everything that registers interest in a
//! trigger: deferred triggers, event mergers, deferred barrier arrivals and
//! the two condition waiters behind `wait` / `external_wait`.

use std::pin::pin;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::id::Event;

/// Callback contract for trigger notification.
///
/// `on_triggered` runs exactly once per registration, after the slot lock
/// has been released, on whichever thread performed or observed the
/// trigger. The return value reports whether the waiter has served its
/// purpose and any retained reference may be dropped.
pub trait EventWaiter: Send + Sync {
    fn on_triggered(&self, event: Event, poisoned: bool) -> bool;

    fn describe(&self) -> String;
}

pub(crate) type WaiterList = Vec<Arc<dyn EventWaiter>>;

/// Invoke a drained waiter list. Callers must not hold any slot lock.
pub(crate) fn wake_all(waiters: WaiterList, event: Event, poisoned: bool) {
    for waiter in waiters {
        waiter.on_triggered(event, poisoned);
    }
}

/// Condition waiter for threads managed by the async runtime.
pub(crate) struct AsyncCondition {
    completed: Mutex<Option<bool>>,
    notify: Notify,
}

impl AsyncCondition {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    /// Suspend until the registered generation triggers; returns the poison
    /// flag the trigger carried.
    pub(crate) async fn wait(self: Arc<Self>) -> bool {
        let mut notified = pin!(self.notify.notified());
        loop {
            // registration must precede the check, or a trigger landing in
            // between is lost
            notified.as_mut().enable();
            if let Some(poisoned) = *self.completed.lock() {
                return poisoned;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

impl EventWaiter for AsyncCondition {
    fn on_triggered(&self, _event: Event, poisoned: bool) -> bool {
        *self.completed.lock() = Some(poisoned);
        self.notify.notify_waiters();
        false
    }

    fn describe(&self) -> String {
        "cooperative condition waiter".to_string()
    }
}

/// Condition waiter for threads outside the async runtime; blocks on a
/// condition variable instead of suspending.
pub(crate) struct ExternalCondition {
    completed: Mutex<Option<bool>>,
    condvar: Condvar,
}

impl ExternalCondition {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(None),
            condvar: Condvar::new(),
        })
    }

    pub(crate) fn wait(&self) -> bool {
        let mut completed = self.completed.lock();
        while completed.is_none() {
            self.condvar.wait(&mut completed);
        }
        completed.unwrap_or(false)
    }
}

impl EventWaiter for ExternalCondition {
    fn on_triggered(&self, _event: Event, poisoned: bool) -> bool {
        *self.completed.lock() = Some(poisoned);
        self.condvar.notify_all();
        false
    }

    fn describe(&self) -> String {
        "external condition waiter".to_string()
    }
}
