// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide wiring: one event pool, one barrier pool, one reduction
//! registry and one adjustment-timestamp counter per runtime. The runtime
//! also owns the inbound dispatch seam: the transport hands every received
//! payload to [`Runtime::handle_message`].

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::am::{Message, NodeMessenger};
use crate::barrier::BarrierPool;
use crate::event::EventPool;
use crate::id::NodeId;
use crate::redop::ReductionRegistry;

/// What happens when a fault-unaware operation (`has_triggered`, `wait`, a
/// barrier arrival gate) observes a poisoned generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PoisonPolicy {
    /// Treat it as a fatal failure: the caller did not opt into fault
    /// awareness.
    #[default]
    Fatal,
    /// Surface the poison as an error / drop the gated work and keep going.
    Surface,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub poison_policy: PoisonPolicy,
    /// Initial capacity hint for the per-node slot tables.
    #[serde(default = "default_slot_capacity")]
    pub initial_slot_capacity: usize,
}

fn default_slot_capacity() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poison_policy: PoisonPolicy::default(),
            initial_slot_capacity: default_slot_capacity(),
        }
    }
}

/// One synchronization core instance, exclusively owning every event and
/// barrier created through it.
pub struct Runtime {
    node: NodeId,
    events: Arc<EventPool>,
    barriers: Arc<BarrierPool>,
    redops: Arc<ReductionRegistry>,
}

impl Runtime {
    pub fn new(node: NodeId, config: RuntimeConfig) -> Arc<Self> {
        let redops = Arc::new(ReductionRegistry::new());
        let events = Arc::new(EventPool::new(node, &config));
        let barriers = Arc::new(BarrierPool::new(
            node,
            &config,
            events.clone(),
            redops.clone(),
        ));
        Arc::new(Self {
            node,
            events,
            barriers,
            redops,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn events(&self) -> &Arc<EventPool> {
        &self.events
    }

    pub fn barriers(&self) -> &Arc<BarrierPool> {
        &self.barriers
    }

    pub fn reductions(&self) -> &Arc<ReductionRegistry> {
        &self.redops
    }

    /// Install the outbound transport. Must happen before any operation
    /// that crosses nodes; purely local use works without one.
    pub fn set_messenger(&self, messenger: Arc<dyn NodeMessenger>) {
        self.events.set_messenger(messenger.clone());
        self.barriers.set_messenger(messenger);
    }

    /// Replay one inbound payload from `sender`. The transport must call
    /// this in delivery order per sender.
    pub fn handle_message(&self, sender: NodeId, payload: Bytes) -> Result<()> {
        let message = Message::decode(&payload)?;
        trace!("inbound message: sender={sender} message={message:?}");
        match message {
            Message::EventSubscribe {
                event,
                previous_subscribe_gen,
            } => self
                .events
                .handle_subscribe(sender, event, previous_subscribe_gen),
            Message::EventTrigger { event, poisoned } => {
                self.events.handle_trigger(sender, event, poisoned)
            }
            Message::EventUpdate {
                event,
                poisoned_generations,
            } => self.events.handle_update(event, &poisoned_generations),
            Message::BarrierAdjust {
                barrier,
                delta,
                wait_on,
                reduce_value,
            } => self
                .barriers
                .handle_adjust(barrier, delta, wait_on, reduce_value),
            Message::BarrierSubscribe {
                barrier_id,
                subscribe_gen,
            } => self
                .barriers
                .handle_subscribe(sender, barrier_id, subscribe_gen),
            Message::BarrierTrigger {
                barrier_id,
                trigger_gen,
                previous_gen,
                first_generation,
                redop_id,
                reduce_data,
            } => self.barriers.handle_trigger(
                sender,
                barrier_id,
                trigger_gen,
                previous_gen,
                first_generation,
                redop_id,
                reduce_data,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.poison_policy, PoisonPolicy::Fatal);
        assert_eq!(config.initial_slot_capacity, 64);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poison_policy, PoisonPolicy::Fatal);

        let config: RuntimeConfig =
            serde_json::from_str(r#"{"poison_policy":"Surface","initial_slot_capacity":8}"#)
                .unwrap();
        assert_eq!(config.poison_policy, PoisonPolicy::Surface);
        assert_eq!(config.initial_slot_capacity, 8);
    }

    #[test]
    fn handle_message_rejects_garbage() {
        let rt = Runtime::new(0, RuntimeConfig::default());
        assert!(rt.handle_message(1, Bytes::from_static(b"junk")).is_err());
    }

    #[test]
    fn runtime_exposes_its_node() {
        let rt = Runtime::new(7, RuntimeConfig::default());
        assert_eq!(rt.node_id(), 7);
        assert_eq!(rt.events().node_id(), 7);
        assert_eq!(rt.barriers().node_id(), 7);
    }
}
