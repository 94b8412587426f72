//! Client-side prediction and reconciliation.
//!
//! ```text
//!   local input ──► queue ──► Predicted World   (predicted kinds only)
//!                     │
//!   SNAPSHOT(t) ──► base World ──merge──┐
//!                     │ drop tick <= t   ▼
//!                     └──────────► rebuild predicted = base + queue
//! ```
//!
//! The base World holds only what the server told us. The Predicted World is
//! disposable: it is rebuilt from the base after every snapshot.

use crate::command::Command;
use crate::component::ComponentKind;
use crate::error::{RejectedReason, Result};
use crate::world::{Snapshot, World};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// A locally issued command the server has not yet accounted for.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    /// Local issue order
    pub sequence: u64,

    /// Tick the command was submitted for
    pub tick: u64,

    pub command: Command,
}

#[derive(Debug, Clone)]
pub struct Prediction {
    base: World,
    predicted: World,
    queue: VecDeque<PendingCommand>,
    next_sequence: u64,

    /// Kinds the policy lets the client touch locally
    predicted_kinds: Vec<ComponentKind>,
}

impl Prediction {
    /// Starts from `base`, usually an empty World bound to the session's policy.
    pub fn new(base: World) -> Self {
        let predicted_kinds = ComponentKind::all()
            .iter()
            .copied()
            .filter(|kind| base.policy().is_predicted(*kind))
            .collect();
        Self {
            predicted: base.clone(),
            base,
            queue: VecDeque::new(),
            next_sequence: 0,
            predicted_kinds,
        }
    }

    /// Last authoritative state.
    pub fn base(&self) -> &World {
        &self.base
    }

    /// What the local player should see.
    pub fn predicted(&self) -> &World {
        &self.predicted
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingCommand> {
        self.queue.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Queues a local command and applies it to the Predicted World.
    ///
    /// The command stays queued even if the local application fails: only
    /// the server decides whether it happened.
    pub fn apply_local(&mut self, tick: u64, command: Command) -> std::result::Result<(), RejectedReason> {
        let pending = PendingCommand {
            sequence: self.next_sequence,
            tick,
            command,
        };
        self.next_sequence += 1;
        let result = apply_masked(&mut self.predicted, &self.predicted_kinds, &pending);
        trace!(sequence = pending.sequence, tick, ?result, "local command predicted");
        self.queue.push_back(pending);
        result
    }

    /// Folds an authoritative snapshot in and replays what is still pending.
    ///
    /// Applying the same snapshot twice leaves the state unchanged.
    ///
    /// # Errors
    /// `Protocol` if the snapshot does not match the sync policy; nothing is
    /// modified in that case.
    pub fn reconcile(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.base.merge_snapshot(snapshot)?;

        let before = self.queue.len();
        self.queue.retain(|p| p.tick > snapshot.tick);
        debug!(
            tick = snapshot.tick,
            dropped = before - self.queue.len(),
            replayed = self.queue.len(),
            "reconciled"
        );

        self.predicted = self.base.clone();
        for pending in &self.queue {
            // Failures here are expected when the server state moved on
            let _ = apply_masked(&mut self.predicted, &self.predicted_kinds, pending);
        }
        Ok(())
    }
}

/// Applies a command but keeps only the effects on predicted kinds.
fn apply_masked(
    world: &mut World,
    kinds: &[ComponentKind],
    pending: &PendingCommand,
) -> std::result::Result<(), RejectedReason> {
    let mut scratch = world.clone();
    scratch.apply_command(pending.tick, &pending.command)?;
    world.copy_components_from(&scratch, kinds);
    Ok(())
}
