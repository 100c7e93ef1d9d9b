// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Who is asking. Users act on their own resources; internal workers act under
//! a [`ServiceIdentity`] with explicit capability grants instead of skipping
//! ownership checks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::domain::hiring::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Create, suspend, resume and cancel hirings on behalf of any user.
    ManageHirings,
    /// Create and run executions against any hiring.
    RunExecutions,
    /// Approve and reject agents, triggering cascade teardown.
    ModerateAgents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
}

impl ServiceIdentity {
    pub fn new(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Identity used by deployment workers and the hiring coordinator.
    pub fn lifecycle_worker() -> Self {
        Self::new(
            "lifecycle-worker",
            [Capability::ManageHirings, Capability::RunExecutions],
        )
    }

    pub fn moderator() -> Self {
        Self::new(
            "moderation",
            [Capability::ModerateAgents, Capability::ManageHirings],
        )
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Caller {
    User(UserId),
    Service(ServiceIdentity),
}

impl Caller {
    pub fn user(id: i64) -> Self {
        Caller::User(UserId(id))
    }

    /// Users may act on resources they own; services need the grant.
    pub fn may_act_for(&self, owner: UserId, capability: Capability) -> bool {
        match self {
            Caller::User(user) => *user == owner,
            Caller::Service(service) => service.has(capability),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        match self {
            Caller::User(_) => false,
            Caller::Service(service) => service.has(capability),
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::User(id) => write!(f, "user:{}", id),
            Caller::Service(service) => write!(f, "service:{}", service.name),
        }
    }
}
