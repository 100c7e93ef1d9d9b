// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Hiring aggregate: one user bound to one agent.
//!
//! Hirings are never deleted. Every status change is kept on the record
//! through its timestamps so cancelled hirings remain auditable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::agent::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HiringId(pub i64);

impl fmt::Display for HiringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiringStatus {
    Active,
    Suspended,
    Cancelled,
    Expired,
}

impl HiringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HiringStatus::Active => "active",
            HiringStatus::Suspended => "suspended",
            HiringStatus::Cancelled => "cancelled",
            HiringStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(HiringStatus::Active),
            "suspended" => Some(HiringStatus::Suspended),
            "cancelled" => Some(HiringStatus::Cancelled),
            "expired" => Some(HiringStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for HiringStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    #[default]
    PerUse,
    Monthly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::PerUse => "per_use",
            BillingCycle::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "per_use" => Some(BillingCycle::PerUse),
            "monthly" => Some(BillingCycle::Monthly),
            _ => None,
        }
    }
}

/// Hiring request before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHiring {
    pub user_id: UserId,
    pub agent_id: AgentId,
    #[serde(default)]
    pub billing_cycle: BillingCycle,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewHiring {
    pub fn new(user_id: UserId, agent_id: AgentId) -> Self {
        Self {
            user_id,
            agent_id,
            billing_cycle: BillingCycle::default(),
            config: serde_json::Value::Object(Default::default()),
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hiring {
    pub id: HiringId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub status: HiringStatus,
    pub billing_cycle: BillingCycle,
    pub config: serde_json::Value,
    pub hired_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Hiring {
    pub fn from_request(id: HiringId, request: NewHiring) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: request.user_id,
            agent_id: request.agent_id,
            status: HiringStatus::Active,
            billing_cycle: request.billing_cycle,
            config: request.config,
            hired_at: now,
            updated_at: now,
            suspended_at: None,
            cancelled_at: None,
            expires_at: request.expires_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == HiringStatus::Active
    }

    /// Cancellation is final; every other status can move anywhere.
    pub fn can_transition_to(&self, target: HiringStatus) -> bool {
        self.status != HiringStatus::Cancelled || target == HiringStatus::Cancelled
    }

    /// Applies `target`, returning whether the stored status changed.
    pub fn transition_to(&mut self, target: HiringStatus) -> bool {
        if self.status == target {
            return false;
        }
        let now = Utc::now();
        match target {
            HiringStatus::Suspended => self.suspended_at = Some(now),
            HiringStatus::Cancelled => self.cancelled_at = Some(now),
            HiringStatus::Active => self.suspended_at = None,
            HiringStatus::Expired => {}
        }
        self.status = target;
        self.updated_at = now;
        true
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hiring() -> Hiring {
        Hiring::from_request(HiringId(1), NewHiring::new(UserId(1), AgentId::new("ABC123")))
    }

    #[test]
    fn test_new_hiring_is_active() {
        let hiring = hiring();
        assert_eq!(hiring.status, HiringStatus::Active);
        assert!(hiring.is_active());
    }

    #[test]
    fn test_transition_reports_change() {
        let mut hiring = hiring();
        assert!(hiring.transition_to(HiringStatus::Suspended));
        assert!(hiring.suspended_at.is_some());
        assert!(!hiring.transition_to(HiringStatus::Suspended));
        assert!(hiring.transition_to(HiringStatus::Active));
        assert!(hiring.suspended_at.is_none());
    }

    #[test]
    fn test_cancelled_is_final() {
        let mut hiring = hiring();
        hiring.transition_to(HiringStatus::Cancelled);
        assert!(!hiring.can_transition_to(HiringStatus::Active));
        assert!(hiring.can_transition_to(HiringStatus::Cancelled));
    }
}
