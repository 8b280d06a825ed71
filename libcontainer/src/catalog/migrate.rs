//! Schema creation and additive migration via `PRAGMA table_info`
//! introspection: create the tables if they don't exist at their oldest
//! known shape, then add any columns declared below that a previously
//! created database is missing, all inside one transaction.

use rusqlite::Connection;

use super::error::CatalogError;

type Result<T> = std::result::Result<T, CatalogError>;

/// `(column name, DDL fragment to add it)`. Order matters only for
/// readability; `ALTER TABLE ... ADD COLUMN` is applied one at a time.
const CONTAINER_COLUMNS: &[(&str, &str)] = &[
    ("restart_count", "INTEGER NOT NULL DEFAULT 0"),
    ("health_cmd", "TEXT NOT NULL DEFAULT ''"),
    ("health_interval_seconds", "INTEGER NOT NULL DEFAULT 30"),
    ("restart_max", "INTEGER NOT NULL DEFAULT 0"),
    ("ports", "TEXT NOT NULL DEFAULT ''"),
    ("ip_forward_orig", "TEXT NOT NULL DEFAULT ''"),
    ("network_setup", "INTEGER NOT NULL DEFAULT 0"),
    ("ip_suffix", "INTEGER NOT NULL DEFAULT 0"),
];

pub fn run(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS containers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            image TEXT NOT NULL,
            pid INTEGER NOT NULL,
            state TEXT NOT NULL,
            started_at TEXT NOT NULL,
            rootfs_dir TEXT NOT NULL
        )",
        [],
    )?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS images (
            name TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    let existing = existing_columns(&tx, "containers")?;
    for (column, ddl) in CONTAINER_COLUMNS {
        if !existing.contains(&column.to_string()) {
            tx.execute(
                &format!("ALTER TABLE containers ADD COLUMN {column} {ddl}"),
                [],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_adds_missing_columns_and_preserves_old_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE containers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                image TEXT NOT NULL,
                pid INTEGER NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT NOT NULL,
                rootfs_dir TEXT NOT NULL
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO containers (id, name, image, pid, state, started_at, rootfs_dir)
             VALUES ('abc', 'busybox', 'busybox', 42, 'Running', '2024-01-01T00:00:00Z', '/tmp/x')",
            [],
        )
        .unwrap();

        run(&mut conn).unwrap();

        let columns = existing_columns(&conn, "containers").unwrap();
        for (column, _) in CONTAINER_COLUMNS {
            assert!(columns.contains(&column.to_string()), "missing {column}");
        }

        let restart_count: i64 = conn
            .query_row(
                "SELECT restart_count FROM containers WHERE id = 'abc'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(restart_count, 0);

        let name: String = conn
            .query_row("SELECT name FROM containers WHERE id = 'abc'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "busybox");
    }

    #[test]
    fn migration_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
    }
}
