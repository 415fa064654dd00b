//! Persistence (retention) rule model.
//!
//! Rules are ordered by archive type, then ascending maximum age with
//! `forever` last; rules of the same archive type partition that type's
//! entities into periods.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::types::ArchiveType;

/// A keep count: a number or unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeepLimit {
    #[default]
    Unlimited,
    Count(u32),
}

impl KeepLimit {
    pub fn limit(&self) -> Option<u32> {
        match self {
            KeepLimit::Unlimited => None,
            KeepLimit::Count(n) => Some(*n),
        }
    }
}

impl fmt::Display for KeepLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepLimit::Unlimited => write!(f, "unlimited"),
            KeepLimit::Count(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for KeepLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unlimited" | "*" => Ok(KeepLimit::Unlimited),
            number => number
                .parse()
                .map(KeepLimit::Count)
                .map_err(|_| format!("invalid keep limit '{s}'")),
        }
    }
}

/// A maximum age in days, or forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgeLimit {
    #[default]
    Forever,
    Days(u32),
}

impl AgeLimit {
    pub fn days(&self) -> Option<u32> {
        match self {
            AgeLimit::Forever => None,
            AgeLimit::Days(n) => Some(*n),
        }
    }

    /// Sort key: concrete ages ascending, forever last.
    fn order_key(&self) -> u64 {
        match self {
            AgeLimit::Days(n) => *n as u64,
            AgeLimit::Forever => u64::MAX,
        }
    }
}

impl fmt::Display for AgeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgeLimit::Forever => write!(f, "forever"),
            AgeLimit::Days(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for AgeLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "forever" | "*" => Ok(AgeLimit::Forever),
            number => number
                .parse()
                .map(AgeLimit::Days)
                .map_err(|_| format!("invalid age limit '{s}'")),
        }
    }
}

/// One retention rule owned by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceRule {
    /// Stable id within the job.
    pub id: u32,
    pub archive_type: ArchiveType,
    pub min_keep: KeepLimit,
    pub max_keep: KeepLimit,
    pub max_age: AgeLimit,
    /// Destination URI entities of this period are moved to, if any.
    pub move_to: Option<String>,
}

impl PersistenceRule {
    fn same_policy(&self, other: &PersistenceRule) -> bool {
        self.archive_type == other.archive_type
            && self.min_keep == other.min_keep
            && self.max_keep == other.max_keep
            && self.max_age == other.max_age
            && self.move_to == other.move_to
    }
}

/// The ordered rule list of one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceList {
    rules: Vec<PersistenceRule>,
    next_id: u32,
    pub last_modified: Option<DateTime<Utc>>,
}

impl PersistenceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersistenceRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&PersistenceRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Rules for one archive type, in period order.
    pub fn rules_for(&self, archive_type: ArchiveType) -> Vec<&PersistenceRule> {
        self.rules
            .iter()
            .filter(|r| r.archive_type == archive_type)
            .collect()
    }

    pub fn has_rules_for(&self, archive_type: ArchiveType) -> bool {
        self.rules.iter().any(|r| r.archive_type == archive_type)
    }

    /// Add a rule. An exact duplicate of an existing rule is a no-op
    /// returning the existing id.
    pub fn add(
        &mut self,
        archive_type: ArchiveType,
        min_keep: KeepLimit,
        max_keep: KeepLimit,
        max_age: AgeLimit,
        move_to: Option<String>,
        now: DateTime<Utc>,
    ) -> u32 {
        let candidate = PersistenceRule {
            id: 0,
            archive_type,
            min_keep,
            max_keep,
            max_age,
            move_to,
        };
        if let Some(existing) = self.rules.iter().find(|r| r.same_policy(&candidate)) {
            return existing.id;
        }

        self.next_id += 1;
        let id = self.next_id;
        self.rules.push(PersistenceRule { id, ..candidate });
        self.sort();
        self.last_modified = Some(now);
        id
    }

    /// Replace the rule with the given id. Returns false when absent.
    pub fn update(&mut self, rule: PersistenceRule, now: DateTime<Utc>) -> bool {
        let Some(slot) = self.rules.iter_mut().find(|r| r.id == rule.id) else {
            return false;
        };
        *slot = rule;
        self.sort();
        self.last_modified = Some(now);
        true
    }

    /// Remove a rule by id. Returns false when absent.
    pub fn remove(&mut self, id: u32, now: DateTime<Utc>) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        let removed = self.rules.len() != before;
        if removed {
            self.last_modified = Some(now);
        }
        removed
    }

    pub fn clear(&mut self, now: DateTime<Utc>) {
        if !self.rules.is_empty() {
            self.rules.clear();
            self.last_modified = Some(now);
        }
    }

    /// Restore a rule as loaded from the job file, keeping its persisted id.
    pub fn restore(&mut self, rule: PersistenceRule) {
        self.next_id = self.next_id.max(rule.id);
        self.rules.push(rule);
        self.sort();
    }

    fn sort(&mut self) {
        self.rules.sort_by_key(|r| {
            (
                ArchiveType::ALL
                    .iter()
                    .position(|t| *t == r.archive_type)
                    .unwrap_or(usize::MAX),
                r.max_age.order_key(),
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_keep_limit_parse_display() {
        assert_eq!("unlimited".parse::<KeepLimit>().unwrap(), KeepLimit::Unlimited);
        assert_eq!("7".parse::<KeepLimit>().unwrap(), KeepLimit::Count(7));
        assert_eq!(KeepLimit::Count(7).to_string(), "7");
        assert!("week".parse::<KeepLimit>().is_err());
    }

    #[test]
    fn test_age_limit_parse_display() {
        assert_eq!("forever".parse::<AgeLimit>().unwrap(), AgeLimit::Forever);
        assert_eq!("30".parse::<AgeLimit>().unwrap(), AgeLimit::Days(30));
        assert_eq!(AgeLimit::Forever.to_string(), "forever");
    }

    #[test]
    fn test_rules_sorted_by_type_then_age() {
        let mut list = PersistenceList::new();
        list.add(
            ArchiveType::Full,
            KeepLimit::Unlimited,
            KeepLimit::Unlimited,
            AgeLimit::Forever,
            None,
            now(),
        );
        list.add(
            ArchiveType::Full,
            KeepLimit::Unlimited,
            KeepLimit::Unlimited,
            AgeLimit::Days(7),
            None,
            now(),
        );
        list.add(
            ArchiveType::Normal,
            KeepLimit::Unlimited,
            KeepLimit::Unlimited,
            AgeLimit::Days(30),
            None,
            now(),
        );

        let order: Vec<(ArchiveType, AgeLimit)> =
            list.iter().map(|r| (r.archive_type, r.max_age)).collect();
        assert_eq!(
            order,
            vec![
                (ArchiveType::Normal, AgeLimit::Days(30)),
                (ArchiveType::Full, AgeLimit::Days(7)),
                (ArchiveType::Full, AgeLimit::Forever),
            ]
        );
    }

    #[test]
    fn test_duplicate_add_returns_existing_id() {
        let mut list = PersistenceList::new();
        let first = list.add(
            ArchiveType::Full,
            KeepLimit::Count(2),
            KeepLimit::Count(3),
            AgeLimit::Forever,
            None,
            now(),
        );
        let second = list.add(
            ArchiveType::Full,
            KeepLimit::Count(2),
            KeepLimit::Count(3),
            AgeLimit::Forever,
            None,
            now(),
        );
        assert_eq!(first, second);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_remove_and_update() {
        let mut list = PersistenceList::new();
        let id = list.add(
            ArchiveType::Full,
            KeepLimit::Count(1),
            KeepLimit::Count(1),
            AgeLimit::Days(7),
            None,
            now(),
        );

        let mut rule = list.get(id).unwrap().clone();
        rule.max_keep = KeepLimit::Count(5);
        assert!(list.update(rule, now()));
        assert_eq!(list.get(id).unwrap().max_keep, KeepLimit::Count(5));

        assert!(list.remove(id, now()));
        assert!(!list.remove(id, now()));
        assert!(list.is_empty());
    }

    #[test]
    fn test_last_modified_tracks_changes() {
        let mut list = PersistenceList::new();
        assert!(list.last_modified.is_none());
        list.add(
            ArchiveType::Full,
            KeepLimit::Unlimited,
            KeepLimit::Unlimited,
            AgeLimit::Forever,
            None,
            now(),
        );
        assert_eq!(list.last_modified, Some(now()));
    }
}
