// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Static per-entity field mapping tables.
//!
//! Applications declare one [`EntitySchema`] per synced table as a `const`:
//!
//! ```
//! use drift_core::schema::{EntitySchema, FieldMapping};
//!
//! pub const PROJECTS: EntitySchema = EntitySchema::new(
//!     "projects",
//!     &[
//!         FieldMapping::plain("project_name", "projectName"),
//!         FieldMapping::timestamp("due_at", "dueAt"),
//!     ],
//! );
//! assert!(PROJECTS.validate().is_ok());
//! ```
//!
//! Fields not listed in the table pass through the mapper unchanged.

use crate::error::{Error, Result};

/// Sync metadata names owned by the engine on the local side.
const RESERVED_LOCAL: &[&str] =
    &["id", "sync_status", "synced_at", "device_id", "deleted", "updated_at"];

/// Envelope names owned by the engine on the wire.
const RESERVED_REMOTE: &[&str] = &["id", "updatedAt", "deviceId", "deleted"];

/// How a field's value is represented on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Copied verbatim.
    Plain,
    /// Epoch milliseconds locally, ISO-8601 string on the wire.
    Timestamp,
}

/// One local (snake_case) ↔ remote (camelCase) field name pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub local: &'static str,
    pub remote: &'static str,
    pub kind: FieldKind,
}

impl FieldMapping {
    pub const fn plain(local: &'static str, remote: &'static str) -> Self {
        FieldMapping { local, remote, kind: FieldKind::Plain }
    }

    pub const fn timestamp(local: &'static str, remote: &'static str) -> Self {
        FieldMapping { local, remote, kind: FieldKind::Timestamp }
    }
}

/// Field mapping table for one synced entity (table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySchema {
    pub name: &'static str,
    pub fields: &'static [FieldMapping],
}

impl EntitySchema {
    pub const fn new(name: &'static str, fields: &'static [FieldMapping]) -> Self {
        EntitySchema { name, fields }
    }

    /// Looks up a mapping by its local name.
    pub fn by_local(&self, local: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|m| m.local == local)
    }

    /// Looks up a mapping by its remote name.
    pub fn by_remote(&self, remote: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|m| m.remote == remote)
    }

    /// Checks the table for typos and collisions.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(self.invalid("entity name cannot be empty"));
        }

        for (i, m) in self.fields.iter().enumerate() {
            if !is_snake_case(m.local) {
                return Err(self.invalid(format!("local field '{}' is not snake_case", m.local)));
            }
            if !is_camel_case(m.remote) {
                return Err(self.invalid(format!("remote field '{}' is not camelCase", m.remote)));
            }
            if RESERVED_LOCAL.contains(&m.local) {
                return Err(self.invalid(format!("local field '{}' is reserved", m.local)));
            }
            if RESERVED_REMOTE.contains(&m.remote) {
                return Err(self.invalid(format!("remote field '{}' is reserved", m.remote)));
            }

            let rest = &self.fields[i + 1..];
            if rest.iter().any(|o| o.local == m.local) {
                return Err(self.invalid(format!("local field '{}' mapped twice", m.local)));
            }
            if rest.iter().any(|o| o.remote == m.remote) {
                return Err(self.invalid(format!("remote field '{}' mapped twice", m.remote)));
            }
        }

        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidSchema { entity: self.name.to_string(), reason: reason.into() }
    }
}

fn is_snake_case(s: &str) -> bool {
    !s.is_empty()
        && s.starts_with(|c: char| c.is_ascii_lowercase())
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_camel_case(s: &str) -> bool {
    !s.is_empty()
        && s.starts_with(|c: char| c.is_ascii_lowercase())
        && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// The set of entities a sync engine instance knows about.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    schemas: Vec<EntitySchema>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a list of schemas, validating each.
    pub fn with_schemas(schemas: &[EntitySchema]) -> Result<Self> {
        let mut registry = Self::new();
        for schema in schemas {
            registry.register(*schema)?;
        }
        Ok(registry)
    }

    /// Adds a schema. Duplicate entity names are rejected.
    pub fn register(&mut self, schema: EntitySchema) -> Result<()> {
        schema.validate()?;
        if self.schemas.iter().any(|s| s.name == schema.name) {
            return Err(schema.invalid("entity registered twice"));
        }
        self.schemas.push(schema);
        Ok(())
    }

    /// Returns the schema for an entity.
    pub fn get(&self, entity: &str) -> Result<&EntitySchema> {
        self.schemas
            .iter()
            .find(|s| s.name == entity)
            .ok_or_else(|| Error::UnknownEntity(entity.to_string()))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.schemas.iter().any(|s| s.name == entity)
    }

    /// Entity names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.schemas.iter().map(|s| s.name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.iter()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
