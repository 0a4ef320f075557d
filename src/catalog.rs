use pgrx::prelude::*;
use pgrx::IntoDatum;

use crate::config::TRACKER_SCHEMA;
use crate::error::{TrackerError, TrackerResult};
use crate::object_type::{CatalogDetail, ObjectType};

/// An object that currently exists, as listed by catalog introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogObject {
    /// `pg_identify_object(...).type`
    pub kind: String,
    pub schema: Option<String>,
    /// `pg_identify_object(...).identity`
    pub identity: String,
    pub detail: CatalogDetail,
    pub oid: Option<u32>,
}

impl CatalogObject {
    pub fn object_type(&self) -> ObjectType {
        ObjectType::classify(&self.kind, self.detail)
    }
}

/// Read-only enumeration of existing objects, consumed by reconciliation.
pub trait CatalogSource {
    fn existing_objects(&self) -> TrackerResult<Vec<CatalogObject>>;
}

impl CatalogSource for Vec<CatalogObject> {
    fn existing_objects(&self) -> TrackerResult<Vec<CatalogObject>> {
        Ok(self.clone())
    }
}

/// `$1` is the tracker's own schema. Extension members are left out.
const NAMESPACE_FILTER: &str = "\
    n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast', $1) \
    AND n.nspname NOT LIKE 'pg\\_temp\\_%' \
    AND n.nspname NOT LIKE 'pg\\_toast\\_temp\\_%'";

fn not_extension_member(catalog: &str, alias: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM pg_depend d \
                     WHERE d.classid = '{catalog}'::regclass AND d.objid = {alias}.oid AND d.deptype = 'e')"
    )
}

fn relations_sql() -> String {
    format!(
        "SELECT c.oid, i.type AS kind, n.nspname::text AS schema_name, i.identity, \
                c.relkind::text AS code, c.relispartition AS is_partition \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         CROSS JOIN LATERAL pg_identify_object('pg_class'::regclass, c.oid, 0) i \
         WHERE c.relkind IN ('r', 'p', 'v', 'm', 'S', 'i', 'I', 'f') \
           AND {NAMESPACE_FILTER} AND {}",
        not_extension_member("pg_class", "c")
    )
}

fn routines_sql() -> String {
    format!(
        "SELECT p.oid, i.type AS kind, n.nspname::text AS schema_name, i.identity, \
                p.prokind::text AS code, false AS is_partition \
         FROM pg_proc p \
         JOIN pg_namespace n ON n.oid = p.pronamespace \
         CROSS JOIN LATERAL pg_identify_object('pg_proc'::regclass, p.oid, 0) i \
         WHERE {NAMESPACE_FILTER} AND {}",
        not_extension_member("pg_proc", "p")
    )
}

fn schemas_sql() -> String {
    format!(
        "SELECT n.oid, i.type AS kind, NULL::text AS schema_name, i.identity, \
                NULL::text AS code, false AS is_partition \
         FROM pg_namespace n \
         CROSS JOIN LATERAL pg_identify_object('pg_namespace'::regclass, n.oid, 0) i \
         WHERE {NAMESPACE_FILTER} AND n.nspname NOT LIKE 'pg\\_toast%' AND {}",
        not_extension_member("pg_namespace", "n")
    )
}

/// User types, without array shadows, multiranges or relation row types.
fn types_sql() -> String {
    format!(
        "SELECT t.oid, i.type AS kind, n.nspname::text AS schema_name, i.identity, \
                t.typtype::text AS code, false AS is_partition \
         FROM pg_type t \
         JOIN pg_namespace n ON n.oid = t.typnamespace \
         CROSS JOIN LATERAL pg_identify_object('pg_type'::regclass, t.oid, 0) i \
         WHERE t.typtype IN ('b', 'c', 'd', 'e', 'r', 'p') \
           AND NOT EXISTS (SELECT 1 FROM pg_type el WHERE el.oid = t.typelem AND el.typarray = t.oid) \
           AND (t.typtype <> 'c' OR EXISTS (SELECT 1 FROM pg_class r WHERE r.oid = t.typrelid AND r.relkind = 'c')) \
           AND {NAMESPACE_FILTER} AND {}",
        not_extension_member("pg_type", "t")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Relations,
    Routines,
    Schemas,
    Types,
}

impl Section {
    fn sql(self) -> String {
        match self {
            Section::Relations => relations_sql(),
            Section::Routines => routines_sql(),
            Section::Schemas => schemas_sql(),
            Section::Types => types_sql(),
        }
    }

    fn detail(self, code: Option<char>, is_partition: bool) -> CatalogDetail {
        match (self, code) {
            (Section::Relations, Some(relkind)) => CatalogDetail::Relation { relkind, is_partition },
            (Section::Routines, Some(prokind)) => CatalogDetail::Routine { prokind },
            (Section::Types, Some(typtype)) => CatalogDetail::Type { typtype },
            _ => CatalogDetail::Unknown,
        }
    }
}

/// Live catalog of the current database, read through SPI.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgCatalog;

impl PgCatalog {
    fn list(section: Section) -> TrackerResult<Vec<CatalogObject>> {
        let query = section.sql();
        let args = vec![(PgOid::BuiltIn(PgBuiltInOids::TEXTOID), TRACKER_SCHEMA.into_datum())];

        Spi::connect(|client| {
            let rows = client.select(&query, None, Some(args))?;
            let mut objects = Vec::new();

            for row in rows {
                let Some(identity) = row["identity"].value::<String>()? else {
                    continue;
                };
                let code: Option<String> = row["code"].value()?;
                let is_partition = row["is_partition"].value::<bool>()?.unwrap_or(false);
                let oid: Option<pg_sys::Oid> = row["oid"].value()?;

                objects.push(CatalogObject {
                    kind: row["kind"].value::<String>()?.unwrap_or_default(),
                    schema: row["schema_name"].value::<String>()?,
                    identity,
                    detail: section.detail(code.and_then(|c| c.chars().next()), is_partition),
                    oid: oid.map(|o| o.as_u32()),
                });
            }

            Ok::<_, pgrx::spi::Error>(objects)
        })
        .map_err(|e| TrackerError::CatalogError {
            operation: format!("enumerate {section:?}"),
            pg_error: e.to_string(),
        })
    }
}

impl CatalogSource for PgCatalog {
    fn existing_objects(&self) -> TrackerResult<Vec<CatalogObject>> {
        let mut all = Vec::new();
        for section in [Section::Schemas, Section::Relations, Section::Routines, Section::Types] {
            all.extend(Self::list(section)?);
        }
        Ok(all)
    }
}


#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod pg_tests {
    use pgrx::prelude::*;
    use super::*;

    #[pg_test]
    fn test_pg_catalog_lists_user_objects() {
        Spi::run("CREATE SCHEMA inv").unwrap();
        Spi::run("CREATE TABLE inv.parts (id int PRIMARY KEY)").unwrap();
        Spi::run("CREATE TYPE inv.mood AS ENUM ('ok', 'meh')").unwrap();

        let objects = PgCatalog.existing_objects().unwrap();
        let find = |identity: &str| objects.iter().find(|o| o.identity == identity).cloned();

        assert_eq!(find("inv.parts").map(|o| o.object_type()), Some(ObjectType::Table));
        assert_eq!(find("inv.parts_pkey").map(|o| o.object_type()), Some(ObjectType::Index));
        assert_eq!(find("inv.mood").map(|o| o.object_type()), Some(ObjectType::Enum));
        assert_eq!(find("inv").map(|o| o.object_type()), Some(ObjectType::Schema));

        // array shadows and the table's row type stay out
        assert!(find("inv.mood[]").is_none());
        assert!(objects.iter().all(|o| o.schema.as_deref() != Some("pg_catalog")));
        assert!(objects.iter().all(|o| !o.identity.starts_with("obj_tracker.")));
    }

    #[pg_test]
    fn test_schema_identity_is_quoted_like_events() {
        Spi::run(r#"CREATE SCHEMA "Sales""#).unwrap();

        let objects = PgCatalog.existing_objects().unwrap();
        let schema = objects
            .iter()
            .find(|o| o.object_type() == ObjectType::Schema && o.identity.contains("Sales"))
            .cloned();

        assert_eq!(schema.map(|o| o.identity), Some(r#""Sales""#.to_string()));
    }
}
