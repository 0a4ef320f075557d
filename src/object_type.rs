//! Object categories and how they are derived from host-engine metadata.
//!
//! Two sources name an object's kind:
//! - the event feed (`object_type` column of `pg_event_trigger_ddl_commands()`
//!   and `pg_event_trigger_dropped_objects()`), which is coarse: `table`
//!   covers plain, partition and partitioned tables alike
//! - catalog rows (`pg_class.relkind`, `pg_proc.prokind`, `pg_type.typtype`),
//!   which are precise
//!
//! Both the change path and reconciliation classify through
//! [`ObjectType::classify`], so an object gets the same canonical type no
//! matter which path saw it first.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category stored in the `object_type` column (always uppercase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ObjectType {
    Table,
    Partition,
    PartitionedTable,
    View,
    MaterializedView,
    Sequence,
    Index,
    Function,
    Procedure,
    Aggregate,
    Window,
    Trigger,
    Schema,
    Type,
    Domain,
    Enum,
    Range,
    PseudoType,
    Other,
}

/// Catalog facts about an object, when the host can still introspect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogDetail {
    /// `pg_class` row: relkind and `relispartition`
    Relation { relkind: char, is_partition: bool },
    /// `pg_proc` row: prokind
    Routine { prokind: char },
    /// `pg_type` row: typtype
    Type { typtype: char },
    /// No catalog row (dropped, or not a relation/routine/type)
    #[default]
    Unknown,
}

impl ObjectType {
    pub const ALL: [ObjectType; 19] = [
        ObjectType::Table,
        ObjectType::Partition,
        ObjectType::PartitionedTable,
        ObjectType::View,
        ObjectType::MaterializedView,
        ObjectType::Sequence,
        ObjectType::Index,
        ObjectType::Function,
        ObjectType::Procedure,
        ObjectType::Aggregate,
        ObjectType::Window,
        ObjectType::Trigger,
        ObjectType::Schema,
        ObjectType::Type,
        ObjectType::Domain,
        ObjectType::Enum,
        ObjectType::Range,
        ObjectType::PseudoType,
        ObjectType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Table => "TABLE",
            ObjectType::Partition => "PARTITION",
            ObjectType::PartitionedTable => "PARTITIONED TABLE",
            ObjectType::View => "VIEW",
            ObjectType::MaterializedView => "MATERIALIZED VIEW",
            ObjectType::Sequence => "SEQUENCE",
            ObjectType::Index => "INDEX",
            ObjectType::Function => "FUNCTION",
            ObjectType::Procedure => "PROCEDURE",
            ObjectType::Aggregate => "AGGREGATE",
            ObjectType::Window => "WINDOW",
            ObjectType::Trigger => "TRIGGER",
            ObjectType::Schema => "SCHEMA",
            ObjectType::Type => "TYPE",
            ObjectType::Domain => "DOMAIN",
            ObjectType::Enum => "ENUM",
            ObjectType::Range => "RANGE",
            ObjectType::PseudoType => "PSEUDO-TYPE",
            ObjectType::Other => "OTHER",
        }
    }

    /// Parse a stored type name, case-insensitively. Unrecognized names are `Other`.
    pub fn parse(s: &str) -> Self {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == upper)
            .unwrap_or(ObjectType::Other)
    }

    /// Map the event feed's `object_type` text to a category, without catalog help.
    pub fn from_event_kind(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "table" => ObjectType::Table,
            "view" => ObjectType::View,
            "materialized view" => ObjectType::MaterializedView,
            "sequence" => ObjectType::Sequence,
            "index" => ObjectType::Index,
            "function" => ObjectType::Function,
            "procedure" => ObjectType::Procedure,
            "aggregate" => ObjectType::Aggregate,
            "trigger" => ObjectType::Trigger,
            "schema" => ObjectType::Schema,
            "type" | "composite type" => ObjectType::Type,
            "domain" => ObjectType::Domain,
            _ => ObjectType::Other,
        }
    }

    pub fn from_relkind(relkind: char, is_partition: bool) -> Self {
        match relkind {
            'r' if is_partition => ObjectType::Partition,
            'r' => ObjectType::Table,
            'p' => ObjectType::PartitionedTable,
            'v' => ObjectType::View,
            'm' => ObjectType::MaterializedView,
            'S' => ObjectType::Sequence,
            'i' | 'I' => ObjectType::Index,
            'c' => ObjectType::Type,
            _ => ObjectType::Other,
        }
    }

    pub fn from_prokind(prokind: char) -> Self {
        match prokind {
            'f' => ObjectType::Function,
            'p' => ObjectType::Procedure,
            'a' => ObjectType::Aggregate,
            'w' => ObjectType::Window,
            _ => ObjectType::Other,
        }
    }

    pub fn from_typtype(typtype: char) -> Self {
        match typtype {
            'b' | 'c' => ObjectType::Type,
            'd' => ObjectType::Domain,
            'e' => ObjectType::Enum,
            'r' => ObjectType::Range,
            'p' => ObjectType::PseudoType,
            _ => ObjectType::Other,
        }
    }

    /// Classify an object from its event kind, preferring catalog detail when present.
    pub fn classify(kind: &str, detail: CatalogDetail) -> Self {
        match detail {
            CatalogDetail::Relation { relkind, is_partition } => {
                Self::from_relkind(relkind, is_partition)
            }
            CatalogDetail::Routine { prokind } => Self::from_prokind(prokind),
            CatalogDetail::Type { typtype } => Self::from_typtype(typtype),
            CatalogDetail::Unknown => Self::from_event_kind(kind),
        }
    }

    /// Every category a dropped object of this event kind may have been tracked under.
    ///
    /// Drops carry no catalog detail, so the coarse kind is widened to the
    /// categories `classify` can refine it into.
    pub fn drop_candidates(kind: &str) -> Vec<ObjectType> {
        match Self::from_event_kind(kind) {
            ObjectType::Table => vec![
                ObjectType::Table,
                ObjectType::Partition,
                ObjectType::PartitionedTable,
            ],
            ObjectType::Function => vec![ObjectType::Function, ObjectType::Window],
            ObjectType::Type => vec![
                ObjectType::Type,
                ObjectType::Enum,
                ObjectType::Range,
                ObjectType::PseudoType,
            ],
            other => vec![other],
        }
    }

    /// Functions, procedures, aggregates and window functions
    pub fn is_routine(self) -> bool {
        matches!(
            self,
            ObjectType::Function | ObjectType::Procedure | ObjectType::Aggregate | ObjectType::Window
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ObjectType> for String {
    fn from(t: ObjectType) -> Self {
        t.as_str().to_string()
    }
}

impl TryFrom<String> for ObjectType {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(ObjectType::parse(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(ObjectType::parse("materialized view"), ObjectType::MaterializedView);
        assert_eq!(ObjectType::parse("Pseudo-Type"), ObjectType::PseudoType);
        assert_eq!(ObjectType::parse("FOREIGN TABLE"), ObjectType::Other);
    }

    #[test]
    fn test_as_str_parses_back() {
        for t in ObjectType::ALL {
            assert_eq!(ObjectType::parse(t.as_str()), t);
        }
    }

    #[test]
    fn test_relkind_disambiguates_partitions() {
        assert_eq!(ObjectType::from_relkind('r', false), ObjectType::Table);
        assert_eq!(ObjectType::from_relkind('r', true), ObjectType::Partition);
        assert_eq!(ObjectType::from_relkind('p', false), ObjectType::PartitionedTable);
        assert_eq!(ObjectType::from_relkind('I', false), ObjectType::Index);
        assert_eq!(ObjectType::from_relkind('f', false), ObjectType::Other);
    }

    #[test]
    fn test_classify_prefers_catalog_detail() {
        let detail = CatalogDetail::Relation { relkind: 'r', is_partition: true };
        assert_eq!(ObjectType::classify("table", detail), ObjectType::Partition);

        let detail = CatalogDetail::Type { typtype: 'e' };
        assert_eq!(ObjectType::classify("type", detail), ObjectType::Enum);

        let detail = CatalogDetail::Routine { prokind: 'w' };
        assert_eq!(ObjectType::classify("function", detail), ObjectType::Window);

        assert_eq!(ObjectType::classify("trigger", CatalogDetail::Unknown), ObjectType::Trigger);
        assert_eq!(ObjectType::classify("table column", CatalogDetail::Unknown), ObjectType::Other);
    }

    #[test]
    fn test_drop_candidates_cover_refined_types() {
        let tables = ObjectType::drop_candidates("table");
        assert!(tables.contains(&ObjectType::Partition));
        assert!(tables.contains(&ObjectType::PartitionedTable));

        assert_eq!(ObjectType::drop_candidates("view"), vec![ObjectType::View]);
        assert!(ObjectType::drop_candidates("type").contains(&ObjectType::Enum));
    }

    #[test]
    fn test_serde_uses_display_names() {
        let json = serde_json::to_string(&ObjectType::MaterializedView).unwrap();
        assert_eq!(json, "\"MATERIALIZED VIEW\"");

        let back: ObjectType = serde_json::from_str("\"partitioned table\"").unwrap();
        assert_eq!(back, ObjectType::PartitionedTable);
    }
}
