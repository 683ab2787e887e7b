use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::events::{ChannelId, RoleId, UserId};
use crate::db::models::{GenericConstraintRow, RoleConstraintRow, RoleConstraintSettingsRow};

/// Which privileged operation a constraint set gates. Stored as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintIntent {
    ChannelMuteGiveTemporary,
    ChannelMuteGivePermanent,
    ChannelMuteCheck,
    ChannelMuteRemove,
    RolePersistGiveTemporary,
    RolePersistGivePermanent,
    RolePersistCheck,
    RolePersistRemove,
    JailTemporary,
    JailPermanent,
}

impl ConstraintIntent {
    pub const ALL: [ConstraintIntent; 10] = [
        Self::ChannelMuteGiveTemporary,
        Self::ChannelMuteGivePermanent,
        Self::ChannelMuteCheck,
        Self::ChannelMuteRemove,
        Self::RolePersistGiveTemporary,
        Self::RolePersistGivePermanent,
        Self::RolePersistCheck,
        Self::RolePersistRemove,
        Self::JailTemporary,
        Self::JailPermanent,
    ];

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

/// Discriminates the rows of `generic_constraints`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericConstraintKind {
    User = 0,
    Channel = 1,
}

impl GenericConstraintKind {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// An allow-list or deny-list over a single id dimension (channel or user).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericConstraint {
    whitelist: bool,
    ids: HashSet<u64>,
}

impl GenericConstraint {
    pub fn new(whitelist: bool, ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            whitelist,
            ids: ids.into_iter().collect(),
        }
    }

    pub fn matches(&self, id: u64) -> bool {
        if self.ids.contains(&id) {
            self.whitelist
        } else {
            !self.whitelist
        }
    }
}

/// Two independent halves over a set of roles. An empty half is not evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleConstraint {
    whitelist_strict: bool,
    whitelist: HashSet<RoleId>,
    blacklist_strict: bool,
    blacklist: HashSet<RoleId>,
}

impl RoleConstraint {
    pub fn new(
        whitelist_strict: bool,
        whitelist: impl IntoIterator<Item = RoleId>,
        blacklist_strict: bool,
        blacklist: impl IntoIterator<Item = RoleId>,
    ) -> Self {
        Self {
            whitelist_strict,
            whitelist: whitelist.into_iter().collect(),
            blacklist_strict,
            blacklist: blacklist.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.whitelist.is_empty() && self.blacklist.is_empty()
    }

    pub fn matches(&self, roles: &[RoleId]) -> bool {
        if !self.whitelist.is_empty() {
            let ok = if self.whitelist_strict {
                roles.iter().all(|r| self.whitelist.contains(r))
            } else {
                roles.iter().any(|r| self.whitelist.contains(r))
            };
            if !ok {
                return false;
            }
        }

        if !self.blacklist.is_empty() {
            let ok = if self.blacklist_strict {
                !roles.iter().any(|r| self.blacklist.contains(r))
            } else {
                // Only a caller whose every role is blacklisted is rejected.
                roles.is_empty() || roles.iter().any(|r| !self.blacklist.contains(r))
            };
            if !ok {
                return false;
            }
        }

        true
    }
}

/// Channel, role and user constraints for one intent. Missing parts match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CruConstraints {
    pub channel: Option<GenericConstraint>,
    pub role: Option<RoleConstraint>,
    pub user: Option<GenericConstraint>,
}

impl CruConstraints {
    /// All configured sub-constraints whose input is present must match.
    pub fn matches(
        &self,
        channel_id: Option<ChannelId>,
        role_ids: Option<&[RoleId]>,
        user_id: Option<UserId>,
    ) -> bool {
        if let (Some(constraint), Some(id)) = (&self.channel, channel_id)
            && !constraint.matches(id)
        {
            return false;
        }
        if let (Some(constraint), Some(roles)) = (&self.role, role_ids)
            && !constraint.matches(roles)
        {
            return false;
        }
        if let (Some(constraint), Some(id)) = (&self.user, user_id)
            && !constraint.matches(id)
        {
            return false;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_none() && self.role.is_none() && self.user.is_none()
    }

    /// Assemble the constraint set from its stored rows. Returns `None` when nothing is configured.
    pub fn from_rows(
        generic: &[GenericConstraintRow],
        settings: Option<&RoleConstraintSettingsRow>,
        roles: &[RoleConstraintRow],
    ) -> Option<Self> {
        let generic_for = |kind: GenericConstraintKind| {
            let rows: Vec<_> = generic
                .iter()
                .filter(|r| r.constraint_type == kind.code())
                .collect();
            // The whitelist flag is per sub-constraint; the first row carries it.
            let first = rows.first()?;
            Some(GenericConstraint::new(
                first.whitelist != 0,
                rows.iter().map(|r| r.data as u64),
            ))
        };

        let role = RoleConstraint::new(
            settings.is_some_and(|s| s.whitelist_strict != 0),
            roles
                .iter()
                .filter(|r| r.whitelist != 0)
                .map(|r| r.role_id as u64),
            settings.is_some_and(|s| s.blacklist_strict != 0),
            roles
                .iter()
                .filter(|r| r.whitelist == 0)
                .map(|r| r.role_id as u64),
        );

        let constraints = Self {
            channel: generic_for(GenericConstraintKind::Channel),
            role: (!role.is_empty()).then_some(role),
            user: generic_for(GenericConstraintKind::User),
        };

        (!constraints.is_empty()).then_some(constraints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [RoleId; 0] = [];

    #[test]
    fn test_generic_whitelist_and_blacklist_invert() {
        let allow = GenericConstraint::new(true, [1, 2]);
        let deny = GenericConstraint::new(false, [1, 2]);

        assert!(allow.matches(1));
        assert!(!allow.matches(3));
        assert!(!deny.matches(1));
        assert!(deny.matches(3));
    }

    #[test]
    fn test_role_whitelist_strict_requires_every_role() {
        let c = RoleConstraint::new(true, [1, 2], false, NONE);
        assert!(c.matches(&[1, 2]));
        assert!(!c.matches(&[1, 3]));
    }

    #[test]
    fn test_role_whitelist_any_requires_one_role() {
        let c = RoleConstraint::new(false, [1, 2], false, NONE);
        assert!(c.matches(&[2, 9]));
        assert!(!c.matches(&[8, 9]));
        assert!(!c.matches(&[]));
    }

    #[test]
    fn test_role_blacklist_strict_rejects_any_listed_role() {
        let c = RoleConstraint::new(false, NONE, true, [5]);
        assert!(c.matches(&[1, 2]));
        assert!(!c.matches(&[1, 5]));
    }

    #[test]
    fn test_role_blacklist_any_rejects_only_fully_blacklisted() {
        let c = RoleConstraint::new(false, NONE, false, [5, 6]);
        assert!(c.matches(&[5, 7]));
        assert!(!c.matches(&[5, 6]));
        assert!(c.matches(&[]));
    }

    #[test]
    fn test_role_halves_combine() {
        let c = RoleConstraint::new(false, [1], true, [2]);
        assert!(c.matches(&[1]));
        assert!(!c.matches(&[1, 2]));
        assert!(!c.matches(&[3]));
    }

    #[test]
    fn test_cru_skips_missing_parts_and_inputs() {
        let cru = CruConstraints {
            channel: Some(GenericConstraint::new(true, [10])),
            role: None,
            user: Some(GenericConstraint::new(false, [99])),
        };

        assert!(cru.matches(Some(10), Some(&[1]), Some(5)));
        assert!(!cru.matches(Some(11), None, None));
        assert!(!cru.matches(Some(10), None, Some(99)));
        // Absent channel input skips the channel check
        assert!(cru.matches(None, None, Some(5)));
        assert!(CruConstraints::default().matches(Some(1), Some(&[]), Some(1)));
    }

    #[test]
    fn test_intent_codes_are_stable() {
        assert_eq!(ConstraintIntent::ChannelMuteGiveTemporary.code(), 0);
        assert_eq!(ConstraintIntent::RolePersistGiveTemporary.code(), 4);
        assert_eq!(ConstraintIntent::JailPermanent.code(), 9);
        assert_eq!(
            ConstraintIntent::from_code(7),
            Some(ConstraintIntent::RolePersistRemove)
        );
        assert_eq!(ConstraintIntent::from_code(10), None);
        assert_eq!(ConstraintIntent::from_code(-1), None);
    }

    #[test]
    fn test_from_rows() {
        let generic = vec![
            GenericConstraintRow {
                server_id: 1,
                intent: 0,
                constraint_type: GenericConstraintKind::Channel.code(),
                whitelist: 1,
                data: 100,
            },
            GenericConstraintRow {
                server_id: 1,
                intent: 0,
                constraint_type: GenericConstraintKind::User.code(),
                whitelist: 0,
                data: 7,
            },
        ];
        let roles = vec![RoleConstraintRow {
            server_id: 1,
            intent: 0,
            role_id: 3,
            whitelist: 0,
        }];

        let cru = CruConstraints::from_rows(&generic, None, &roles).unwrap();
        assert!(cru.matches(Some(100), Some(&[3, 4]), Some(8)));
        assert!(!cru.matches(Some(101), None, None));
        assert!(!cru.matches(None, None, Some(7)));
        assert!(!cru.matches(None, Some(&[3]), None));

        assert!(CruConstraints::from_rows(&[], None, &[]).is_none());
    }
}
