//! Entity schema for the user store, plus query bounds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Largest page `find_many` will serve.
pub const MAX_FIRST: usize = 1000;
/// Largest offset `find_many` will honour.
pub const MAX_SKIP: usize = 5000;

/// A stored entity: field name → JSON value. Always carries `"id"`.
pub type EntityInstance = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldKind {
    Id,
    String,
    Int,
    BigInt,
    Float,
    Boolean,
    Bytes,
    /// Foreign key to another entity's id.
    Relation { entity: String },
    /// Virtual one-to-many field: every `entity` whose `field` equals this id.
    ///
    /// Resolved at the latest version rather than at the parent's read
    /// timestamp. Known limitation, kept for compatibility.
    Derived { entity: String, field: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields that are physically stored (everything but derived fields).
    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.kind, FieldKind::Derived { .. }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub entities: Vec<EntityDef>,
}

impl Schema {
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        for entity in &self.entities {
            match entity.field("id") {
                Some(FieldDef { kind: FieldKind::Id, .. }) => {}
                _ => {
                    return Err(IndexerError::Config(format!(
                        "entity \"{}\" must declare an \"id\" field of kind id",
                        entity.name
                    )))
                }
            }
            for field in &entity.fields {
                match &field.kind {
                    FieldKind::Relation { entity: target } => {
                        if self.entity(target).is_none() {
                            return Err(IndexerError::Config(format!(
                                "field \"{}.{}\" references unknown entity \"{target}\"",
                                entity.name, field.name
                            )));
                        }
                    }
                    FieldKind::Derived { entity: target, field: fk } => {
                        let ok = self
                            .entity(target)
                            .and_then(|t| t.field(fk))
                            .map_or(false, |f| {
                                matches!(&f.kind, FieldKind::Relation { entity: parent } if *parent == entity.name)
                            });
                        if !ok {
                            return Err(IndexerError::Config(format!(
                                "derived field \"{}.{}\" needs relation \"{target}.{fk}\"",
                                entity.name, field.name
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

// ─── Queries ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// Parameters of a `find_many` read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindManyQuery {
    /// Read the version visible at this timestamp (`None` = latest).
    #[serde(default)]
    pub timestamp: Option<u64>,
    /// Field equality constraints.
    #[serde(default)]
    pub where_eq: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub order_by: Option<(String, OrderDirection)>,
    #[serde(default = "default_first")]
    pub first: usize,
    #[serde(default)]
    pub skip: usize,
}

fn default_first() -> usize {
    100
}

impl Default for FindManyQuery {
    fn default() -> Self {
        Self {
            timestamp: None,
            where_eq: BTreeMap::new(),
            order_by: None,
            first: default_first(),
            skip: 0,
        }
    }
}

impl FindManyQuery {
    pub fn where_eq(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.where_eq.insert(field.to_string(), value.into());
        self
    }

    pub fn first(mut self, first: usize) -> Self {
        self.first = first;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Reject over-large pages instead of truncating them.
    pub fn check_limits(&self) -> Result<(), IndexerError> {
        if self.first > MAX_FIRST {
            return Err(IndexerError::QueryLimit(format!(
                "Cannot query more than {MAX_FIRST} rows."
            )));
        }
        if self.skip > MAX_SKIP {
            return Err(IndexerError::QueryLimit(format!(
                "Cannot skip more than {MAX_SKIP} rows."
            )));
        }
        Ok(())
    }

    /// Returns `true` if `instance` satisfies every equality constraint.
    pub fn matches(&self, instance: &EntityInstance) -> bool {
        self.where_eq
            .iter()
            .all(|(field, value)| instance.get(field) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, kind: FieldKind) -> FieldDef {
        FieldDef {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    fn schema() -> Schema {
        Schema {
            entities: vec![
                EntityDef {
                    name: "Account".into(),
                    fields: vec![
                        field("id", FieldKind::Id),
                        field(
                            "transfers",
                            FieldKind::Derived {
                                entity: "Transfer".into(),
                                field: "from".into(),
                            },
                        ),
                    ],
                },
                EntityDef {
                    name: "Transfer".into(),
                    fields: vec![
                        field("id", FieldKind::Id),
                        field(
                            "from",
                            FieldKind::Relation {
                                entity: "Account".into(),
                            },
                        ),
                        field("value", FieldKind::BigInt),
                    ],
                },
            ],
        }
    }

    #[test]
    fn valid_schema() {
        let s = schema();
        s.validate().unwrap();
        assert_eq!(s.entity("Account").unwrap().stored_fields().count(), 1);
    }

    #[test]
    fn derived_field_needs_relation() {
        let mut s = schema();
        s.entities[0].fields[1].kind = FieldKind::Derived {
            entity: "Transfer".into(),
            field: "value".into(),
        };
        assert!(matches!(s.validate(), Err(IndexerError::Config(_))));
    }

    #[test]
    fn missing_id_rejected() {
        let s = Schema {
            entities: vec![EntityDef {
                name: "X".into(),
                fields: vec![field("name", FieldKind::String)],
            }],
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn query_limits() {
        let err = FindManyQuery::default().first(1005).check_limits().unwrap_err();
        assert_eq!(err.to_string(), "Cannot query more than 1000 rows.");
        let err = FindManyQuery::default().skip(5005).check_limits().unwrap_err();
        assert_eq!(err.to_string(), "Cannot skip more than 5000 rows.");
        assert!(FindManyQuery::default().first(1000).skip(5000).check_limits().is_ok());
    }
}
