//! Object Identity Resolver
//!
//! Turns the host's dot-separated identity string (`public.employees`,
//! `public.get_count(integer)`) into the canonical `(schema, name, type)`
//! key the store is unique on.
//!
//! Rules, by number of dot-separated segments:
//! - 1 segment: the whole string is the name; the schema comes from the
//!   namespace hint (for schemas, the identity itself is the schema)
//! - 2 segments: the second segment is the name; the first is only used as
//!   schema when there is no hint
//! - 3+ segments: routines rejoin every segment after the first (argument
//!   type names may be qualified, `public.f(public.money_t)`); every other
//!   kind keeps the full string as name
//!
//! Triggers (`trg_audit on public.orders`) keep their own name in front of
//! the table part, so two triggers on one table get distinct keys.
//!
//! Resolution never fails. An unexpected shape produces a less precise name,
//! not an error.

use serde::{Deserialize, Serialize};

use crate::object_type::ObjectType;

/// Canonical merge key of a tracked object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub schema: String,
    pub name: String,
    pub object_type: ObjectType,
}

impl ObjectKey {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, object_type: ObjectType) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            object_type,
        }
    }
}

/// Resolve an identity string to its canonical key.
///
/// `schema_hint` is the namespace the host reports for the object; empty
/// strings count as absent.
pub fn resolve(identity: &str, object_type: ObjectType, schema_hint: Option<&str>) -> ObjectKey {
    let hint = schema_hint.map(str::trim).filter(|s| !s.is_empty());

    if object_type == ObjectType::Schema {
        return ObjectKey::new(identity, identity, object_type);
    }

    if object_type == ObjectType::Trigger {
        if let Some((trigger, table)) = identity.split_once(" on ") {
            let table_key = resolve(table, ObjectType::Table, schema_hint);
            return ObjectKey::new(table_key.schema, format!("{trigger} on {}", table_key.name), object_type);
        }
    }

    let segments: Vec<&str> = identity.split('.').collect();
    let (schema, name) = match segments.as_slice() {
        [only] => (hint.unwrap_or_default().to_string(), (*only).to_string()),
        [qualifier, name] => (hint.unwrap_or(*qualifier).to_string(), (*name).to_string()),
        [qualifier, rest @ ..] if object_type.is_routine() => {
            (hint.unwrap_or(*qualifier).to_string(), rest.join("."))
        }
        [qualifier, ..] => (hint.unwrap_or(*qualifier).to_string(), identity.to_string()),
        [] => (hint.unwrap_or_default().to_string(), identity.to_string()),
    };

    ObjectKey::new(schema, name, object_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_segments_use_hint_schema() {
        let key = resolve("public.employees", ObjectType::Table, Some("public"));
        assert_eq!(key, ObjectKey::new("public", "employees", ObjectType::Table));
    }

    #[test]
    fn test_two_segments_prefer_hint_over_qualifier() {
        let key = resolve("old.employees", ObjectType::Table, Some("hr"));
        assert_eq!(key.schema, "hr");
        assert_eq!(key.name, "employees");
    }

    #[test]
    fn test_two_segments_without_hint_use_qualifier() {
        let key = resolve("hr.employees", ObjectType::View, None);
        assert_eq!(key.schema, "hr");
        assert_eq!(key.name, "employees");

        let key = resolve("hr.employees", ObjectType::View, Some("  "));
        assert_eq!(key.schema, "hr");
    }

    #[test]
    fn test_routine_keeps_argument_list() {
        let key = resolve("public.get_employee_count()", ObjectType::Function, Some("public"));
        assert_eq!(key.schema, "public");
        assert_eq!(key.name, "get_employee_count()");
    }

    #[test]
    fn test_routine_with_qualified_argument_types() {
        let key = resolve(
            "billing.apply_rate(billing.money_t,integer)",
            ObjectType::Procedure,
            Some("billing"),
        );
        assert_eq!(key.name, "apply_rate(billing.money_t,integer)");
    }

    #[test]
    fn test_three_segments_non_routine_keep_full_string() {
        let key = resolve("db.public.employees", ObjectType::Table, Some("public"));
        assert_eq!(key.name, "db.public.employees");
        assert_eq!(key.schema, "public");
    }

    #[test]
    fn test_single_segment_takes_hint() {
        let key = resolve("employees", ObjectType::Table, Some("hr"));
        assert_eq!(key, ObjectKey::new("hr", "employees", ObjectType::Table));

        let key = resolve("employees", ObjectType::Table, None);
        assert_eq!(key.schema, "");
    }

    #[test]
    fn test_trigger_keeps_its_name() {
        let key = resolve("trg_audit on public.orders", ObjectType::Trigger, None);
        assert_eq!(key, ObjectKey::new("public", "trg_audit on orders", ObjectType::Trigger));

        let other = resolve("trg_stamp on public.orders", ObjectType::Trigger, Some("public"));
        assert_ne!(key, other);

        // a dotted trigger name does not leak into the schema
        let key = resolve("v1.audit on sales.orders", ObjectType::Trigger, None);
        assert_eq!(key.schema, "sales");
        assert_eq!(key.name, "v1.audit on orders");
    }

    #[test]
    fn test_schema_identity_is_its_own_schema() {
        let key = resolve("reporting", ObjectType::Schema, None);
        assert_eq!(key, ObjectKey::new("reporting", "reporting", ObjectType::Schema));

        // the hint never overrides the schema being acted on
        let key = resolve("reporting", ObjectType::Schema, Some("public"));
        assert_eq!(key.schema, "reporting");
    }
}
