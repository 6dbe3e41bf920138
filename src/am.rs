// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-node messaging shims.
//!
//! Six message kinds travel between nodes; every handler is idempotent or
//! monotone so duplicates collapse harmlessly. Arguments are serde records
//! encoded with `serde_json` into an opaque [`Bytes`] payload; the transport
//! never looks inside. Variable-length payloads (poisoned-generation lists,
//! reduction data) ride inline in the record.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{Barrier, Event, EventId, Generation, NodeId};
use crate::redop::ReductionOpId;

/// The wire messages of the synchronization core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Non-owner asks the owner to deliver an `EventUpdate` once the named
    /// generation triggers. `previous_subscribe_gen` is the newest
    /// generation the sender has already subscribed to.
    EventSubscribe {
        event: Event,
        previous_subscribe_gen: Generation,
    },
    /// Non-owner triggered its cached copy; the owner must advance the
    /// authoritative state.
    EventTrigger { event: Event, poisoned: bool },
    /// Owner reports that `event.gen` (and everything before it) has
    /// triggered, together with the complete poisoned-generation list.
    EventUpdate {
        event: Event,
        poisoned_generations: Vec<Generation>,
    },
    /// Arrival or expected-count adjustment forwarded to the barrier owner.
    /// A non-null `wait_on` defers the adjustment on the owner.
    BarrierAdjust {
        barrier: Barrier,
        delta: i64,
        wait_on: Event,
        reduce_value: Vec<u8>,
    },
    /// Non-owner asks the barrier owner for trigger notifications up to
    /// `subscribe_gen`.
    BarrierSubscribe {
        barrier_id: EventId,
        subscribe_gen: Generation,
    },
    /// Owner reports that generations `previous_gen + 1 ..= trigger_gen`
    /// triggered; `reduce_data` carries one left-hand-side per generation
    /// in that range when the barrier reduces.
    BarrierTrigger {
        barrier_id: EventId,
        trigger_gen: Generation,
        previous_gen: Generation,
        first_generation: Generation,
        redop_id: ReductionOpId,
        reduce_data: Vec<u8>,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        serde_json::from_slice(payload).map_err(DecodeError::Malformed)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message payload")]
    Empty,

    #[error("malformed message payload: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Outbound half of the transport contract.
///
/// Delivery must be exactly-once and in-order per `(sender, target)` pair;
/// the payload is opaque bytes the receiver hands to
/// [`crate::Runtime::handle_message`].
pub trait NodeMessenger: Send + Sync {
    fn send(&self, target: NodeId, payload: Bytes) -> Result<()>;

    fn broadcast(&self, targets: &[NodeId], payload: Bytes) -> Result<()> {
        for &target in targets {
            self.send(target, payload.clone())?;
        }
        Ok(())
    }
}
