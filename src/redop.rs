// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reduction operator registry.
//!
//! Barriers accumulate one left-hand-side per generation by folding in the
//! right-hand-side supplied with each arrival. The operators themselves are
//! supplied by higher layers and looked up here by id; id `0` means "no
//! reduction".

use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;

/// Identifier assigned to a registered reduction operator. `0` is reserved.
pub type ReductionOpId = u32;

/// One reduction operator. `apply` folds `count` right-hand-side values
/// into `count` left-hand-side slots; `exclusive` promises the caller holds
/// the only reference to `lhs` for the duration of the call.
pub trait ReductionOp: Send + Sync {
    fn sizeof_lhs(&self) -> usize;

    fn sizeof_rhs(&self) -> usize;

    fn apply(&self, lhs: &mut [u8], rhs: &[u8], count: usize, exclusive: bool);
}

/// Process-wide operator table, one per [`crate::Runtime`].
pub struct ReductionRegistry {
    table: DashMap<ReductionOpId, Arc<dyn ReductionOp>>,
}

impl ReductionRegistry {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    pub fn register(&self, redop_id: ReductionOpId, op: Arc<dyn ReductionOp>) -> Result<()> {
        if redop_id == 0 {
            bail!("reduction operator id 0 is reserved");
        }
        if self.table.insert(redop_id, op).is_some() {
            bail!("reduction operator {redop_id} registered twice");
        }
        Ok(())
    }

    pub fn lookup(&self, redop_id: ReductionOpId) -> Option<Arc<dyn ReductionOp>> {
        self.table.get(&redop_id).map(|op| op.clone())
    }
}

impl Default for ReductionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
