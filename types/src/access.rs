// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A node in the fixed resource hierarchy. Coarse module-level categories sit
/// under the root [`ResourceType::Any`], with the concrete per-instance stores
/// as leaves beneath them.
///
/// Access operations on a type with children must use the wildcard
/// identifier; only leaf types may name a specific instance. See
/// [`AccessOperation::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Any,
    Auth,
    AuthAccount,
    Bank,
    BankBalance,
    BankSupply,
    BankParams,
    Staking,
    StakingDelegation,
    StakingValidator,
    Gov,
    GovProposal,
    GovVote,
}

impl ResourceType {
    pub fn parent(self) -> Option<ResourceType> {
        use ResourceType::*;
        match self {
            Any => None,
            Auth | Bank | Staking | Gov => Some(Any),
            AuthAccount => Some(Auth),
            BankBalance | BankSupply | BankParams => Some(Bank),
            StakingDelegation | StakingValidator => Some(Staking),
            GovProposal | GovVote => Some(Gov),
        }
    }

    pub fn children(self) -> &'static [ResourceType] {
        use ResourceType::*;
        match self {
            Any => &[Auth, Bank, Staking, Gov],
            Auth => &[AuthAccount],
            Bank => &[BankBalance, BankSupply, BankParams],
            Staking => &[StakingDelegation, StakingValidator],
            Gov => &[GovProposal, GovVote],
            AuthAccount | BankBalance | BankSupply | BankParams | StakingDelegation
            | StakingValidator | GovProposal | GovVote => &[],
        }
    }

    pub fn has_children(self) -> bool {
        !self.children().is_empty()
    }

    /// Whether `self` is a strict ancestor of `other` in the hierarchy.
    pub fn is_ancestor_of(self, other: ResourceType) -> bool {
        self != other && other.ancestors().any(|a| a == self)
    }

    /// The chain of ancestors of `self`, nearest first, root last.
    pub fn ancestors(self) -> impl Iterator<Item = ResourceType> {
        std::iter::successors(self.parent(), |r| r.parent())
    }

    /// Every strict descendant of `self`, in preorder.
    pub fn descendants(self) -> Vec<ResourceType> {
        let mut out = Vec::new();
        let mut stack: Vec<ResourceType> = self.children().to_vec();
        while let Some(r) = stack.pop() {
            out.push(r);
            stack.extend_from_slice(r.children());
        }
        out
    }
}

/// The declared intent of an access operation.
///
/// `Unknown` is emitted when static analysis cannot resolve the identifier
/// and conservatively conflicts with both reads and writes. `Commit` is the
/// synthetic terminal operation appended once per transaction and only serves
/// as a graph anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
    Unknown,
    Commit,
}

impl AccessKind {
    /// Read/Read is the only non-conflicting pairing of real accesses.
    /// Commit operations never participate in conflict matching.
    pub fn conflicts_with(self, other: AccessKind) -> bool {
        use AccessKind::*;
        match (self, other) {
            (Commit, _) | (_, Commit) => false,
            (Read, Read) => false,
            _ => true,
        }
    }
}

/// Instance selector of an access operation: a single named instance of a
/// leaf resource type, or every instance of the type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    Wildcard,
    Exact(String),
}

impl Identifier {
    pub fn exact(id: impl Into<String>) -> Self {
        Identifier::Exact(id.into())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Identifier::Wildcard)
    }

    /// Two selectors overlap when either is the wildcard or both name the
    /// same instance.
    pub fn overlaps(&self, other: &Identifier) -> bool {
        match (self, other) {
            (Identifier::Wildcard, _) | (_, Identifier::Wildcard) => true,
            (Identifier::Exact(a), Identifier::Exact(b)) => a == b,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AccessModelError {
    #[error("non-leaf resource type {resource_type:?} must use the wildcard identifier, got {identifier:?}")]
    NonLeafExactIdentifier {
        resource_type: ResourceType,
        identifier: Identifier,
    },
    #[error("unknown access on {0:?} must use the wildcard identifier")]
    UnknownExactIdentifier(ResourceType),
    #[error("commit operations must target the root resource type with the wildcard identifier")]
    MalformedCommit,
    #[error("commit operation may only appear as the final operation of a transaction")]
    MisplacedCommit,
    #[error("message kind {0:?} has no registered access template")]
    UnregisteredMessage(String),
    #[error("template import depth exceeded {max} while expanding {kind:?}")]
    ImportDepthExceeded { kind: String, max: usize },
}

/// A typed descriptor of what a transaction unit touches: the resource type,
/// the kind of access, and the instance selector. Generated fresh per
/// transaction at graph-build time, immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessOperation {
    pub resource_type: ResourceType,
    pub kind: AccessKind,
    pub identifier: Identifier,
}

impl AccessOperation {
    pub fn new(resource_type: ResourceType, kind: AccessKind, identifier: Identifier) -> Self {
        Self {
            resource_type,
            kind,
            identifier,
        }
    }

    pub fn read(resource_type: ResourceType, identifier: Identifier) -> Self {
        Self::new(resource_type, AccessKind::Read, identifier)
    }

    pub fn write(resource_type: ResourceType, identifier: Identifier) -> Self {
        Self::new(resource_type, AccessKind::Write, identifier)
    }

    pub fn unknown(resource_type: ResourceType) -> Self {
        Self::new(resource_type, AccessKind::Unknown, Identifier::Wildcard)
    }

    /// The synthetic terminal operation marking "transaction fully applied".
    pub fn commit() -> Self {
        Self::new(ResourceType::Any, AccessKind::Commit, Identifier::Wildcard)
    }

    pub fn is_commit(&self) -> bool {
        self.kind == AccessKind::Commit
    }

    /// Enforces the structural invariants of the model:
    /// - a resource type with children may only be accessed with the
    ///   wildcard identifier (an exact identifier on a non-leaf silently
    ///   evades conflict detection downstream, so it is rejected here);
    /// - unknown accesses carry the wildcard, by construction of the model;
    /// - commit anchors target the root with the wildcard.
    pub fn validate(&self) -> Result<(), AccessModelError> {
        if self.kind == AccessKind::Commit {
            if self.resource_type != ResourceType::Any || !self.identifier.is_wildcard() {
                return Err(AccessModelError::MalformedCommit);
            }
            return Ok(());
        }
        if self.kind == AccessKind::Unknown && !self.identifier.is_wildcard() {
            return Err(AccessModelError::UnknownExactIdentifier(self.resource_type));
        }
        if self.resource_type.has_children() && !self.identifier.is_wildcard() {
            return Err(AccessModelError::NonLeafExactIdentifier {
                resource_type: self.resource_type,
                identifier: self.identifier.clone(),
            });
        }
        Ok(())
    }

    /// Whether two operations touch overlapping state. Operations on the
    /// same resource type overlap when their identifiers do; operations on
    /// different types overlap exactly when one type is an ancestor of the
    /// other.
    pub fn scope_overlaps(&self, other: &AccessOperation) -> bool {
        if self.resource_type == other.resource_type {
            self.identifier.overlaps(&other.identifier)
        } else {
            self.resource_type.is_ancestor_of(other.resource_type)
                || other.resource_type.is_ancestor_of(self.resource_type)
        }
    }

    pub fn conflicts_with(&self, other: &AccessOperation) -> bool {
        self.kind.conflicts_with(other.kind) && self.scope_overlaps(other)
    }
}
