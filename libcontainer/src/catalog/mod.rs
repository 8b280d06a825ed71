//! The embedded container/image catalog: upsert-by-id storage with
//! additive schema migration, backed by `rusqlite`.

mod error;
mod migrate;

pub use error::CatalogError;

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "Running",
            ContainerState::Stopped => "Stopped",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "Running" => ContainerState::Running,
            _ => ContainerState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub pid: i64,
    pub state: ContainerState,
    pub started_at: DateTime<Utc>,
    pub rootfs_dir: String,
    pub restart_count: i64,
    pub health_cmd: String,
    pub health_interval_seconds: i64,
    pub restart_max: i64,
    pub ports: String,
    pub ip_forward_orig: String,
    pub network_setup: bool,
    pub ip_suffix: i64,
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (creating if absent) the catalog file, enabling WAL and
    /// foreign-key enforcement, and runs schema migration.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CatalogError::Io { path: parent.to_path_buf(), err })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut catalog = Catalog { conn };
        catalog.init()?;
        Ok(catalog)
    }

    pub fn init(&mut self) -> Result<()> {
        migrate::run(&mut self.conn)
    }

    pub fn save_container(&self, record: &ContainerRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO containers (
                id, name, image, pid, state, started_at, rootfs_dir,
                restart_count, health_cmd, health_interval_seconds, restart_max,
                ports, ip_forward_orig, network_setup, ip_suffix
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                image = excluded.image,
                pid = excluded.pid,
                state = excluded.state,
                started_at = excluded.started_at,
                rootfs_dir = excluded.rootfs_dir,
                restart_count = excluded.restart_count,
                health_cmd = excluded.health_cmd,
                health_interval_seconds = excluded.health_interval_seconds,
                restart_max = excluded.restart_max,
                ports = excluded.ports,
                ip_forward_orig = excluded.ip_forward_orig,
                network_setup = excluded.network_setup,
                ip_suffix = excluded.ip_suffix",
            params![
                record.id,
                record.name,
                record.image,
                record.pid,
                record.state.as_str(),
                record.started_at.to_rfc3339(),
                record.rootfs_dir,
                record.restart_count,
                record.health_cmd,
                record.health_interval_seconds,
                record.restart_max,
                record.ports,
                record.ip_forward_orig,
                record.network_setup,
                record.ip_suffix,
            ],
        )?;
        Ok(())
    }

    pub fn get_container(&self, id: &str) -> Result<ContainerRecord> {
        self.conn
            .query_row(
                "SELECT id, name, image, pid, state, started_at, rootfs_dir,
                        restart_count, health_cmd, health_interval_seconds, restart_max,
                        ports, ip_forward_orig, network_setup, ip_suffix
                 FROM containers WHERE id = ?1",
                params![id],
                row_to_container,
            )
            .optional()?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, image, pid, state, started_at, rootfs_dir,
                    restart_count, health_cmd, health_interval_seconds, restart_max,
                    ports, ip_forward_orig, network_setup, ip_suffix
             FROM containers ORDER BY started_at",
        )?;
        let rows = stmt.query_map([], row_to_container)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_container_state(&self, id: &str, state: ContainerState) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE containers SET state = ?1 WHERE id = ?2",
            params![state.as_str(), id],
        )?;
        if changed == 0 {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn update_container_pid(&self, id: &str, pid: i64) -> Result<()> {
        let changed = self
            .conn
            .execute("UPDATE containers SET pid = ?1 WHERE id = ?2", params![pid, id])?;
        if changed == 0 {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete_container(&self, id: &str) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn save_image(&self, record: &ImageRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO images (name, path, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET path = excluded.path, created_at = excluded.created_at",
            params![record.name, record.path, record.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_image(&self, name: &str) -> Result<ImageRecord> {
        self.conn
            .query_row(
                "SELECT name, path, created_at FROM images WHERE name = ?1",
                params![name],
                row_to_image,
            )
            .optional()?
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))
    }

    pub fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, path, created_at FROM images ORDER BY name")?;
        let rows = stmt.query_map([], row_to_image)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_container(row: &rusqlite::Row) -> rusqlite::Result<ContainerRecord> {
    let started_at: String = row.get(5)?;
    Ok(ContainerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        image: row.get(2)?,
        pid: row.get(3)?,
        state: ContainerState::parse(&row.get::<_, String>(4)?),
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        rootfs_dir: row.get(6)?,
        restart_count: row.get(7)?,
        health_cmd: row.get(8)?,
        health_interval_seconds: row.get(9)?,
        restart_max: row.get(10)?,
        ports: row.get(11)?,
        ip_forward_orig: row.get(12)?,
        network_setup: row.get(13)?,
        ip_suffix: row.get(14)?,
    })
}

fn row_to_image(row: &rusqlite::Row) -> rusqlite::Result<ImageRecord> {
    let created_at: String = row.get(2)?;
    Ok(ImageRecord {
        name: row.get(0)?,
        path: row.get(1)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(id: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: "busybox".to_string(),
            image: "busybox".to_string(),
            pid: 1234,
            state: ContainerState::Running,
            started_at: Utc::now(),
            rootfs_dir: "/tmp/rootfs".to_string(),
            restart_count: 0,
            health_cmd: String::new(),
            health_interval_seconds: 30,
            restart_max: 0,
            ports: String::new(),
            ip_forward_orig: String::new(),
            network_setup: false,
            ip_suffix: 0,
        }
    }

    #[test]
    fn upsert_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        let record = sample("abc123");
        catalog.save_container(&record).unwrap();
        let got = catalog.get_container("abc123").unwrap();
        assert_eq!(got.id, record.id);
        assert_eq!(got.pid, record.pid);
        assert_eq!(got.state, ContainerState::Running);
    }

    #[test]
    fn upsert_updates_existing_row() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        let mut record = sample("abc123");
        catalog.save_container(&record).unwrap();
        record.state = ContainerState::Stopped;
        record.pid = 0;
        catalog.save_container(&record).unwrap();

        let all = catalog.list_containers().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, ContainerState::Stopped);
    }

    #[test]
    fn get_missing_container_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        let err = catalog.get_container("nope").unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[test]
    fn delete_container_removes_row() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        catalog.save_container(&sample("abc123")).unwrap();
        catalog.delete_container("abc123").unwrap();
        assert!(catalog.get_container("abc123").is_err());
    }

    #[test]
    fn image_upsert_round_trips() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        let image = ImageRecord {
            name: "busybox".to_string(),
            path: "/home/user/.pocket-docker/images/busybox".to_string(),
            created_at: Utc::now(),
        };
        catalog.save_image(&image).unwrap();
        let got = catalog.get_image("busybox").unwrap();
        assert_eq!(got.path, image.path);
    }
}
