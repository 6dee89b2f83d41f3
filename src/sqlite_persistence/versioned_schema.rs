use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};

/// Offset added to schema versions stored in `PRAGMA user_version`, so a
/// database created by another tool is never mistaken for one of ours.
pub const BASE_DB_VERSION: usize = 77000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(SqlType::Text),
            "INTEGER" => Some(SqlType::Integer),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
}

impl Column {
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            is_primary_key: false,
            non_null: false,
        }
    }

    pub const fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub const fn non_null(mut self) -> Self {
        self.non_null = true;
        self
    }
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indices: &'static [(&'static str, &'static str)],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let mut sql = format!("{} {}", column.name, column.sql_type.as_sql());
                if column.is_primary_key {
                    sql.push_str(" PRIMARY KEY");
                }
                if column.non_null {
                    sql.push_str(" NOT NULL");
                }
                sql
            })
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(&format!("CREATE TABLE {} ({});", self.name, columns), params![])?;

        for (index_name, column_name) in self.indices {
            conn.execute(
                &format!(
                    "CREATE INDEX {} ON {}({});",
                    index_name, self.name, column_name
                ),
                params![],
            )?;
        }
        Ok(())
    }

    /// Check the live table against this definition.
    pub fn validate(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual = stmt
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)? == 1,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if actual.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {}",
                self.name,
                actual.len(),
                self.columns.len()
            );
        }

        for ((name, sql_type, non_null), expected) in actual.iter().zip(self.columns) {
            if name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    name
                );
            }
            if SqlType::parse(sql_type) != Some(expected.sql_type) {
                bail!(
                    "Table {} column {} type mismatch: expected {:?}, got {}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    sql_type
                );
            }
            // SQLite reports primary keys as nullable unless declared otherwise
            if *non_null != expected.non_null {
                bail!(
                    "Table {} column {} non-null mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.non_null,
                    non_null
                );
            }
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

/// Create the database from the latest schema, or validate and migrate an
/// existing one.
pub fn open_versioned(
    conn: &mut Connection,
    schemas: &'static [VersionedSchema],
    is_new_db: bool,
    label: &str,
) -> Result<()> {
    let latest = schemas
        .last()
        .with_context(|| format!("No schema defined for {} database", label))?;

    if is_new_db {
        return latest.create(conn);
    }

    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let db_version = raw_version - BASE_DB_VERSION as i64;
    if db_version < 1 {
        bail!(
            "{} database version {} is invalid (expected >= 1)",
            label,
            db_version
        );
    }

    let schema = schemas
        .iter()
        .find(|s| s.version == db_version as usize)
        .with_context(|| format!("Unknown {} database version {}", label, db_version))?;
    schema
        .validate(conn)
        .with_context(|| format!("{} database schema validation failed", label))?;

    if (db_version as usize) < latest.version {
        let tx = conn.transaction()?;
        for schema in schemas.iter().filter(|s| s.version > db_version as usize) {
            tracing::info!(
                "Migrating {} database to version {}",
                label,
                schema.version
            );
            if let Some(migration) = schema.migration {
                migration(&tx)
                    .with_context(|| format!("Failed to migrate to version {}", schema.version))?;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest.version),
            [],
        )?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const THINGS: Table = Table {
        name: "things",
        columns: &[
            Column::new("id", SqlType::Text).primary_key(),
            Column::new("value", SqlType::Integer).non_null(),
        ],
        indices: &[("idx_things_value", "value")],
    };

    const SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
        version: 1,
        tables: &[THINGS],
        migration: None,
    }];

    #[test]
    fn test_create_then_validate() {
        let mut conn = Connection::open_in_memory().unwrap();
        open_versioned(&mut conn, SCHEMAS, true, "test").unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, (BASE_DB_VERSION + 1) as i64);

        open_versioned(&mut conn, SCHEMAS, false, "test").unwrap();
    }

    #[test]
    fn test_validate_rejects_foreign_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE things (id TEXT)", []).unwrap();

        let err = open_versioned(&mut conn, SCHEMAS, false, "test").unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn test_validate_detects_column_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE things (id TEXT PRIMARY KEY, value TEXT NOT NULL)", [])
            .unwrap();

        let err = THINGS.validate(&conn).unwrap_err();
        assert!(err.to_string().contains("type mismatch"));
    }
}
