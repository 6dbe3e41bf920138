// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed generational event and barrier synchronization core.
//!
//! Every event and barrier is exclusively owned by the node that created it,
//! yet observable from any node: remote nodes hold a conservatively-behind
//! cached view of the owner's state and subscribe for updates on demand.
//! Triggers carry an optional per-generation *poison* tag that propagates
//! through every compositor (merges, deferred triggers, barrier arrivals)
//! so that failures fan out along the same edges as completions.
//!
//! The crate is transport-agnostic: outbound traffic goes through the
//! [`NodeMessenger`] contract and inbound traffic is replayed through
//! [`Runtime::handle_message`]. The transport is expected to deliver each
//! payload exactly once and in order between any pair of nodes.

mod am;
mod barrier;
mod event;
mod id;
mod redop;
mod runtime;
mod waiter;

pub use am::{DecodeError, Message, NodeMessenger};
pub use barrier::BarrierPool;
pub use event::EventPool;
pub use id::{Barrier, Event, EventId, Generation, IdKind, NodeId, UserEvent};
pub use redop::{ReductionOp, ReductionOpId, ReductionRegistry};
pub use runtime::{PoisonPolicy, Runtime, RuntimeConfig};
pub use waiter::EventWaiter;
