// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::access::{AccessKind, AccessModelError, AccessOperation, Identifier, ResourceType};
use std::collections::HashMap;

/// Bound on transitive template imports. An import chain deeper than this
/// (including any import cycle) is a modeling error and rejects the batch.
pub const MAX_IMPORT_DEPTH: usize = 8;

/// The type of a decoded message, used to look up its access template.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(String);

impl MessageKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How a template operation derives its instance identifier from the
/// concrete message at expansion time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentifierTemplate {
    Wildcard,
    /// The address of the submitting account.
    Signer,
    /// A named field of the message body.
    Field(String),
    Constant(String),
    /// Statically unresolvable; always expands to an unknown access.
    Unresolved,
}

/// One entry of a message's access template: either a concrete operation
/// pattern, or the inclusion of another message kind's whole template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateEntry {
    Op {
        resource_type: ResourceType,
        kind: AccessKind,
        identifier: IdentifierTemplate,
    },
    Import(MessageKind),
}

/// The concrete message data a template is instantiated against.
#[derive(Clone, Debug, Default)]
pub struct MessageContext {
    pub signer: Option<String>,
    pub fields: HashMap<String, String>,
}

impl MessageContext {
    pub fn with_signer(signer: impl Into<String>) -> Self {
        Self {
            signer: Some(signer.into()),
            fields: HashMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Lookup from message kind to its static access-operation template.
///
/// Expansion never guesses: an identifier that cannot be resolved from the
/// message context is emitted as an `Unknown` access on the same resource
/// type, which conservatively conflicts with both reads and writes.
///
/// The registry does not validate the operations it produces. Validation
/// happens once, centrally, where operation lists enter the dependency graph
/// builder, so that no declaration source can bypass it.
#[derive(Debug, Default)]
pub struct DependencyRegistry {
    templates: HashMap<MessageKind, Vec<TemplateEntry>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MessageKind, entries: Vec<TemplateEntry>) {
        self.templates.insert(kind, entries);
    }

    pub fn contains(&self, kind: &MessageKind) -> bool {
        self.templates.contains_key(kind)
    }

    /// Instantiates the template registered for `kind` against `ctx`,
    /// resolving transitive imports up to [`MAX_IMPORT_DEPTH`].
    pub fn expand(
        &self,
        kind: &MessageKind,
        ctx: &MessageContext,
    ) -> Result<Vec<AccessOperation>, AccessModelError> {
        let mut ops = Vec::new();
        self.expand_into(kind, ctx, 0, &mut ops)?;
        Ok(ops)
    }

    fn expand_into(
        &self,
        kind: &MessageKind,
        ctx: &MessageContext,
        depth: usize,
        ops: &mut Vec<AccessOperation>,
    ) -> Result<(), AccessModelError> {
        if depth > MAX_IMPORT_DEPTH {
            return Err(AccessModelError::ImportDepthExceeded {
                kind: kind.as_str().to_string(),
                max: MAX_IMPORT_DEPTH,
            });
        }
        let entries = self
            .templates
            .get(kind)
            .ok_or_else(|| AccessModelError::UnregisteredMessage(kind.as_str().to_string()))?;

        for entry in entries {
            match entry {
                TemplateEntry::Op {
                    resource_type,
                    kind,
                    identifier,
                } => ops.push(Self::instantiate(*resource_type, *kind, identifier, ctx)),
                TemplateEntry::Import(imported) => {
                    self.expand_into(imported, ctx, depth + 1, ops)?
                },
            }
        }
        Ok(())
    }

    fn instantiate(
        resource_type: ResourceType,
        kind: AccessKind,
        identifier: &IdentifierTemplate,
        ctx: &MessageContext,
    ) -> AccessOperation {
        let resolved = match identifier {
            IdentifierTemplate::Wildcard => Some(Identifier::Wildcard),
            IdentifierTemplate::Signer => ctx.signer.clone().map(Identifier::Exact),
            IdentifierTemplate::Field(name) => {
                ctx.fields.get(name).cloned().map(Identifier::Exact)
            },
            IdentifierTemplate::Constant(value) => Some(Identifier::exact(value.clone())),
            IdentifierTemplate::Unresolved => None,
        };
        match resolved {
            Some(identifier) => AccessOperation::new(resource_type, kind, identifier),
            // Could not be resolved statically: degrade to an unknown access
            // rather than guessing an identifier.
            None => AccessOperation::unknown(resource_type),
        }
    }
}
