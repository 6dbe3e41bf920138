// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identifier packing and the value-type handles users hold.
//!
//! An id packs `{kind, owner node, slot index}` into a single `u64`. The
//! encoding is an observable wire contract: message handlers extract the
//! owner node from the id to route authoritative operations.

use std::fmt::{self, Display, Formatter};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Alias for event and barrier generation counters.
pub type Generation = u32;

/// Node rank within the cluster.
pub type NodeId = u16;

const INDEX_BITS: u32 = 40;
const OWNER_BITS: u32 = 16;

const OWNER_SHIFT: u32 = INDEX_BITS;
const KIND_SHIFT: u32 = INDEX_BITS + OWNER_BITS;

const INDEX_MASK: u64 = (1u64 << INDEX_BITS) - 1;
const OWNER_MASK: u64 = ((1u64 << OWNER_BITS) - 1) << OWNER_SHIFT;

pub(crate) const MAX_SLOT_INDEX: u64 = INDEX_MASK;

/// Kind tag carried in the top byte of an id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IdKind {
    Event = 1,
    Barrier = 2,
}

/// Packed `{kind, owner, index}` identifier. Id `0` is reserved and names
/// nothing (see [`Event::NO_EVENT`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    pub(crate) const NULL: EventId = EventId(0);

    pub(crate) fn new(kind: IdKind, owner: NodeId, index: u64) -> Result<Self> {
        if index > MAX_SLOT_INDEX {
            bail!("slot index {index} exceeds the id index space");
        }
        Ok(Self(
            ((kind as u64) << KIND_SHIFT) | ((owner as u64) << OWNER_SHIFT) | index,
        ))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn kind_tag(&self) -> u8 {
        (self.0 >> KIND_SHIFT) as u8
    }

    pub fn is_event(&self) -> bool {
        self.kind_tag() == IdKind::Event as u8
    }

    pub fn is_barrier(&self) -> bool {
        self.kind_tag() == IdKind::Barrier as u8
    }

    /// Node holding the authoritative state for this id.
    pub fn owner_node(&self) -> NodeId {
        ((self.0 & OWNER_MASK) >> OWNER_SHIFT) as NodeId
    }

    pub fn slot_index(&self) -> u64 {
        self.0 & INDEX_MASK
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Generational event handle: an id plus the generation of interest.
///
/// A plain value; all operations go through the pools. `gen` names the
/// generation whose trigger the holder cares about, not necessarily the
/// slot's current one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub gen: Generation,
}

impl Event {
    /// The distinguished null event: always triggered, never poisoned.
    pub const NO_EVENT: Event = Event {
        id: EventId::NULL,
        gen: 0,
    };

    pub fn exists(&self) -> bool {
        !self.id.is_null()
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.gen)
    }
}

/// A generational event whose trigger comes from user code rather than the
/// runtime (see [`crate::EventPool::trigger_user_event`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserEvent(pub Event);

impl UserEvent {
    pub fn event(&self) -> Event {
        self.0
    }
}

impl Display for UserEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Barrier handle: an id, the phase (generation) of interest, and the
/// adjustment timestamp a negative arrival may cite.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Barrier {
    pub id: EventId,
    pub gen: Generation,
    pub timestamp: u64,
}

impl Barrier {
    /// Handle for the next phase. Pure handle math, no side effects; the
    /// timestamp does not carry across phases.
    pub fn advance(&self) -> Barrier {
        Barrier {
            id: self.id,
            gen: self.gen + 1,
            timestamp: 0,
        }
    }

    /// Handle for the preceding phase.
    pub fn get_previous_phase(&self) -> Barrier {
        Barrier {
            id: self.id,
            gen: self.gen - 1,
            timestamp: self.timestamp,
        }
    }
}

impl Display for Barrier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.gen)
    }
}
