// Cluster store: SQLite-backed records for networks, cluster members and
// per-device volatile state. Reads and writes go through separate pools so
// long write transactions never starve queries.

use crate::net::error::{NetworkError, NetworkResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Network lifecycle state, replicated per member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Pending,
    Created,
    Errored,
}

impl NetworkState {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => NetworkState::Created,
            2 => NetworkState::Errored,
            _ => NetworkState::Pending,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            NetworkState::Pending => 0,
            NetworkState::Created => 1,
            NetworkState::Errored => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkRecord {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub description: String,
    pub state: NetworkState,
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub last_heartbeat: i64,
}

impl Member {
    /// Alive iff the last heartbeat is fresher than the offline threshold.
    pub fn is_alive(&self, threshold_secs: i64, now: i64) -> bool {
        now - self.last_heartbeat < threshold_secs
    }
}

#[derive(Clone)]
pub struct Store {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> NetworkResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(NetworkError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(NetworkError::Database)?;
        let read_pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(NetworkError::Database)?;

        let store = Self {
            read_pool,
            write_pool,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> NetworkResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS networks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                state INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL DEFAULT '{}',
                UNIQUE(project, name)
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_nodes (
                network_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                state INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY(network_id, node_id),
                FOREIGN KEY(network_id) REFERENCES networks(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL,
                last_heartbeat INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_volatile (
                project TEXT NOT NULL,
                instance TEXT NOT NULL,
                device TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY(project, instance, device, key)
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    // ── Networks ──────────────────────────────────────────────────────

    pub async fn create_network(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: &HashMap<String, String>,
    ) -> NetworkResult<i64> {
        let config_json = serde_json::to_string(config)?;
        let result = sqlx::query(
            r#"INSERT INTO networks (project, name, description, state, config)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(project)
        .bind(name)
        .bind(description)
        .bind(NetworkState::Pending.as_i64())
        .bind(&config_json)
        .execute(&self.write_pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.message().to_ascii_uppercase().contains("UNIQUE") {
                    return NetworkError::AlreadyExists(format!("network {}", name));
                }
            }
            NetworkError::Database(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_network(
        &self,
        project: &str,
        name: &str,
    ) -> NetworkResult<Option<NetworkRecord>> {
        let row = sqlx::query(
            r#"SELECT id, project, name, description, state, config
               FROM networks WHERE project = ? AND name = ?"#,
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&self.read_pool)
        .await?;

        row.map(row_to_network).transpose()
    }

    pub async fn list_networks(&self, project: &str) -> NetworkResult<Vec<NetworkRecord>> {
        let rows = sqlx::query(
            r#"SELECT id, project, name, description, state, config
               FROM networks WHERE project = ? ORDER BY name"#,
        )
        .bind(project)
        .fetch_all(&self.read_pool)
        .await?;

        rows.into_iter().map(row_to_network).collect()
    }

    pub async fn update_network(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: &HashMap<String, String>,
    ) -> NetworkResult<()> {
        let config_json = serde_json::to_string(config)?;
        let changed = sqlx::query(
            r#"UPDATE networks SET description = ?, config = ?
               WHERE project = ? AND name = ?"#,
        )
        .bind(description)
        .bind(&config_json)
        .bind(project)
        .bind(name)
        .execute(&self.write_pool)
        .await?
        .rows_affected();

        if changed == 0 {
            return Err(NetworkError::NotFound(format!("network {}", name)));
        }
        Ok(())
    }

    pub async fn rename_network(
        &self,
        project: &str,
        old_name: &str,
        new_name: &str,
    ) -> NetworkResult<()> {
        let changed = sqlx::query(
            r#"UPDATE networks SET name = ? WHERE project = ? AND name = ?"#,
        )
        .bind(new_name)
        .bind(project)
        .bind(old_name)
        .execute(&self.write_pool)
        .await?
        .rows_affected();

        if changed == 0 {
            return Err(NetworkError::NotFound(format!("network {}", old_name)));
        }
        Ok(())
    }

    pub async fn delete_network(&self, project: &str, name: &str) -> NetworkResult<()> {
        sqlx::query(r#"DELETE FROM networks WHERE project = ? AND name = ?"#)
            .bind(project)
            .bind(name)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn set_network_state(&self, id: i64, state: NetworkState) -> NetworkResult<()> {
        sqlx::query(r#"UPDATE networks SET state = ? WHERE id = ?"#)
            .bind(state.as_i64())
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    // ── Cluster members ───────────────────────────────────────────────

    pub async fn add_member(&self, name: &str, address: &str) -> NetworkResult<i64> {
        let now = now_ts();
        let result = sqlx::query(
            r#"INSERT INTO nodes (name, address, last_heartbeat) VALUES (?, ?, ?)"#,
        )
        .bind(name)
        .bind(address)
        .bind(now)
        .execute(&self.write_pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn heartbeat_member(&self, address: &str) -> NetworkResult<()> {
        sqlx::query(r#"UPDATE nodes SET last_heartbeat = ? WHERE address = ?"#)
            .bind(now_ts())
            .bind(address)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    /// Used by tests and the down-detection path to age a member's
    /// heartbeat explicitly.
    pub async fn set_member_heartbeat(&self, address: &str, when: i64) -> NetworkResult<()> {
        sqlx::query(r#"UPDATE nodes SET last_heartbeat = ? WHERE address = ?"#)
            .bind(when)
            .bind(address)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn members(&self) -> NetworkResult<Vec<Member>> {
        let rows = sqlx::query(
            r#"SELECT id, name, address, last_heartbeat FROM nodes ORDER BY id"#,
        )
        .fetch_all(&self.read_pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Member {
                id: r.get::<i64, _>("id"),
                name: r.get::<String, _>("name"),
                address: r.get::<String, _>("address"),
                last_heartbeat: r.get::<i64, _>("last_heartbeat"),
            })
            .collect())
    }

    // ── Device volatile state ─────────────────────────────────────────

    pub async fn volatile_get(
        &self,
        project: &str,
        instance: &str,
        device: &str,
    ) -> NetworkResult<HashMap<String, String>> {
        let rows = sqlx::query(
            r#"SELECT key, value FROM instance_volatile
               WHERE project = ? AND instance = ? AND device = ?"#,
        )
        .bind(project)
        .bind(instance)
        .bind(device)
        .fetch_all(&self.read_pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect())
    }

    /// Merge volatile keys for a device. An empty value deletes the key.
    pub async fn volatile_set(
        &self,
        project: &str,
        instance: &str,
        device: &str,
        values: &HashMap<String, String>,
    ) -> NetworkResult<()> {
        let mut tx = self.write_pool.begin().await?;
        for (key, value) in values {
            if value.is_empty() {
                sqlx::query(
                    r#"DELETE FROM instance_volatile
                       WHERE project = ? AND instance = ? AND device = ? AND key = ?"#,
                )
                .bind(project)
                .bind(instance)
                .bind(device)
                .bind(key)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    r#"INSERT INTO instance_volatile (project, instance, device, key, value)
                       VALUES (?, ?, ?, ?, ?)
                       ON CONFLICT(project, instance, device, key)
                       DO UPDATE SET value = excluded.value"#,
                )
                .bind(project)
                .bind(instance)
                .bind(device)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

fn row_to_network(row: sqlx::sqlite::SqliteRow) -> NetworkResult<NetworkRecord> {
    let config_json: String = row.get("config");
    let config: HashMap<String, String> = serde_json::from_str(&config_json)?;
    Ok(NetworkRecord {
        id: row.get::<i64, _>("id"),
        project: row.get::<String, _>("project"),
        name: row.get::<String, _>("name"),
        description: row.get::<String, _>("description"),
        state: NetworkState::from_i64(row.get::<i64, _>("state")),
        config,
    })
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
