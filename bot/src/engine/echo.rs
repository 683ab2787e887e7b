//! Recognition of platform notifications caused by the bot's own mutations.
//!
//! Before an outbound mutation the expected change is pushed as a token; when
//! the matching notification arrives the token is consumed and the
//! notification is not processed again.

use std::collections::HashSet;

use parking_lot::Mutex;

use super::events::{RoleDelta, RoleId, VoiceDelta};

#[derive(Debug, Default)]
struct PendingTokens {
    mute: Vec<i8>,
    deafen: Vec<i8>,
    roles_added: Vec<RoleId>,
    roles_removed: Vec<RoleId>,
}

/// Per-user multiset of expected self-caused changes.
#[derive(Debug, Default)]
pub struct EchoSuppressor {
    pending: Mutex<PendingTokens>,
}

impl EchoSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Voice ──────────────────────────────────────────────────────

    pub fn expect_voice(&self, delta: VoiceDelta) {
        let mut pending = self.pending.lock();
        if delta.mute != 0 {
            pending.mute.push(delta.mute);
        }
        if delta.deafen != 0 {
            pending.deafen.push(delta.deafen);
        }
    }

    /// Take back tokens pushed for an outbound call that failed.
    pub fn withdraw_voice(&self, delta: VoiceDelta) {
        let mut pending = self.pending.lock();
        if delta.mute != 0 {
            take_last(&mut pending.mute, delta.mute);
        }
        if delta.deafen != 0 {
            take_last(&mut pending.deafen, delta.deafen);
        }
    }

    /// Whether an observed voice change is self-caused. Consumes the matching
    /// tokens only if every non-zero component matches.
    pub fn consume_voice(&self, delta: VoiceDelta) -> bool {
        if delta.is_empty() {
            return false;
        }

        let mut pending = self.pending.lock();
        let mute_idx = match delta.mute {
            0 => None,
            d => match pending.mute.iter().rposition(|t| *t == d) {
                Some(i) => Some(i),
                None => return false,
            },
        };
        let deafen_idx = match delta.deafen {
            0 => None,
            d => match pending.deafen.iter().rposition(|t| *t == d) {
                Some(i) => Some(i),
                None => return false,
            },
        };

        if let Some(i) = mute_idx {
            pending.mute.remove(i);
        }
        if let Some(i) = deafen_idx {
            pending.deafen.remove(i);
        }
        true
    }

    // ── Roles ──────────────────────────────────────────────────────

    pub fn expect_roles<'a>(
        &self,
        added: impl IntoIterator<Item = &'a RoleId>,
        removed: impl IntoIterator<Item = &'a RoleId>,
    ) {
        let mut pending = self.pending.lock();
        pending.roles_added.extend(added);
        pending.roles_removed.extend(removed);
    }

    pub fn withdraw_roles<'a>(
        &self,
        added: impl IntoIterator<Item = &'a RoleId>,
        removed: impl IntoIterator<Item = &'a RoleId>,
    ) {
        let mut pending = self.pending.lock();
        for role in added {
            take_last(&mut pending.roles_added, *role);
        }
        for role in removed {
            take_last(&mut pending.roles_removed, *role);
        }
    }

    /// Whether an observed role change is entirely self-caused. Nothing is
    /// consumed unless every added and removed role has a pending token.
    pub fn consume_roles(&self, delta: &RoleDelta) -> bool {
        if delta.is_empty() {
            return false;
        }

        let mut pending = self.pending.lock();
        let Some(added_idx) = match_all(&pending.roles_added, &delta.added) else {
            return false;
        };
        let Some(removed_idx) = match_all(&pending.roles_removed, &delta.removed) else {
            return false;
        };

        remove_indices(&mut pending.roles_added, added_idx);
        remove_indices(&mut pending.roles_removed, removed_idx);
        true
    }

    pub fn pending_counts(&self) -> (usize, usize, usize, usize) {
        let pending = self.pending.lock();
        (
            pending.mute.len(),
            pending.deafen.len(),
            pending.roles_added.len(),
            pending.roles_removed.len(),
        )
    }
}

fn take_last<T: PartialEq + Copy>(bag: &mut Vec<T>, token: T) -> bool {
    match bag.iter().rposition(|t| *t == token) {
        Some(i) => {
            bag.remove(i);
            true
        }
        None => false,
    }
}

/// Index of one distinct pending entry per observed id, most recent first.
fn match_all(bag: &[RoleId], observed: &HashSet<RoleId>) -> Option<Vec<usize>> {
    let mut used = Vec::with_capacity(observed.len());
    for role in observed {
        let idx = bag
            .iter()
            .enumerate()
            .rev()
            .find(|(i, r)| *r == role && !used.contains(i))
            .map(|(i, _)| i)?;
        used.push(idx);
    }
    Some(used)
}

fn remove_indices(bag: &mut Vec<RoleId>, mut indices: Vec<usize>) {
    indices.sort_unstable_by(|a, b| b.cmp(a));
    for i in indices {
        bag.remove(i);
    }
}
