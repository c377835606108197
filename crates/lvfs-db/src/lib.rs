//! LVFS persistence layer for vendor credentials and uploaded firmware metadata.
//!
//! This crate wraps a SQLite pool (sqlx) with the handful of queries the upload
//! daemon needs: resolving vendor keys, checking whether a firmware hash is
//! already known, and recording a firmware row once the archive has been
//! written to disk. Rows in `firmware` are append-only from the daemon's point
//! of view.

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/lvfs/lvfs.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Registers a vendor key. Keys are provisioned out of band; the daemon
    /// never issues them.
    pub async fn insert_vendor(&self, vendor_key: &str, name: &str) -> Result<VendorRecord> {
        let now = Utc::now();
        sqlx::query("INSERT INTO vendors (vendor_key, name, created_at) VALUES (?, ?, ?)")
            .bind(vendor_key)
            .bind(name)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;

        self.find_vendor(vendor_key)
            .await?
            .ok_or_else(|| anyhow!("vendor '{}' inserted but missing when reloaded", name))
    }

    /// Resolves a vendor by its key.
    pub async fn find_vendor(&self, vendor_key: &str) -> Result<Option<VendorRecord>> {
        let row = sqlx::query("SELECT * FROM vendors WHERE vendor_key = ?")
            .bind(vendor_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_vendor).transpose()
    }

    /// Returns true when a firmware row with the given content hash exists.
    pub async fn firmware_exists(&self, hash: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM firmware WHERE hash = ? LIMIT 1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Records an uploaded firmware archive. A second row for the same hash is
    /// rejected with [`FirmwareError::DuplicateHash`].
    pub async fn insert_firmware(&self, data: NewFirmware<'_>) -> Result<FirmwareRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO firmware (id, vendor_key, addr, timestamp, filename, hash)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(data.vendor_key)
        .bind(data.addr)
        .bind(now.to_rfc3339())
        .bind(data.filename)
        .bind(data.hash)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(FirmwareError::DuplicateHash(data.hash.to_owned()))
            } else {
                err.into()
            }
        })?;

        self.fetch_firmware_by_hash(data.hash)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "firmware inserted but missing when reloaded (hash={})",
                    data.hash
                )
            })
    }

    pub async fn fetch_firmware_by_hash(&self, hash: &str) -> Result<Option<FirmwareRecord>> {
        let row = sqlx::query("SELECT * FROM firmware WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_firmware).transpose()
    }

    /// Lists the firmware uploaded with a vendor key, newest first.
    pub async fn list_firmware(&self, vendor_key: &str) -> Result<Vec<FirmwareRecord>> {
        let mut rows =
            sqlx::query("SELECT * FROM firmware WHERE vendor_key = ? ORDER BY timestamp DESC")
                .bind(vendor_key)
                .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_firmware(row)?);
        }
        Ok(out)
    }

    pub async fn count_firmware(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM firmware")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_vendor(row: SqliteRow) -> Result<VendorRecord> {
    Ok(VendorRecord {
        vendor_key: row.try_get("vendor_key")?,
        name: row.try_get("name")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
    })
}

fn map_firmware(row: SqliteRow) -> Result<FirmwareRecord> {
    let id: String = row.try_get("id")?;

    Ok(FirmwareRecord {
        id: Uuid::parse_str(&id)?,
        vendor_key: row.try_get("vendor_key")?,
        addr: row.try_get("addr")?,
        timestamp: parse_datetime(row.try_get("timestamp")?)?,
        filename: row.try_get("filename")?,
        hash: row.try_get("hash")?,
    })
}

/// Errors returned by the database layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware with hash '{0}' already exists")]
    DuplicateHash(String),
}

/// Input payload for firmware inserts.
#[derive(Debug, Clone, Copy)]
pub struct NewFirmware<'a> {
    pub vendor_key: &'a str,
    pub addr: &'a str,
    pub filename: &'a str,
    pub hash: &'a str,
}

/// Persisted firmware metadata row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirmwareRecord {
    pub id: Uuid,
    pub vendor_key: String,
    pub addr: String,
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub hash: String,
}

/// Vendor allowed to upload firmware.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorRecord {
    pub vendor_key: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Database::connect_file(&temp.path().join("lvfs.sqlite"))
            .await
            .unwrap();
        (db, temp)
    }

    fn firmware<'a>(hash: &'a str, filename: &'a str) -> NewFirmware<'a> {
        NewFirmware {
            vendor_key: "vendor-key-1",
            addr: "192.0.2.10",
            filename,
            hash,
        }
    }

    #[tokio::test]
    async fn vendor_lookup_roundtrip() {
        let (db, _tmp) = setup_db().await;
        assert!(db.find_vendor("vendor-key-1").await.unwrap().is_none());

        let vendor = db.insert_vendor("vendor-key-1", "Acme").await.unwrap();
        assert_eq!(vendor.name, "Acme");

        let fetched = db.find_vendor("vendor-key-1").await.unwrap().unwrap();
        assert_eq!(fetched, vendor);
    }

    #[tokio::test]
    async fn insert_and_lookup_firmware_by_hash() {
        let (db, _tmp) = setup_db().await;
        let hash = "0123456789abcdef0123456789abcdef01234567";
        assert!(!db.firmware_exists(hash).await.unwrap());

        let record = db
            .insert_firmware(firmware(hash, &format!("{hash}-firmware.cab")))
            .await
            .unwrap();
        assert_eq!(record.vendor_key, "vendor-key-1");
        assert_eq!(record.addr, "192.0.2.10");

        assert!(db.firmware_exists(hash).await.unwrap());
        let fetched = db.fetch_firmware_by_hash(hash).await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.filename, format!("{hash}-firmware.cab"));
    }

    #[tokio::test]
    async fn duplicate_hashes_are_rejected() {
        let (db, _tmp) = setup_db().await;
        let hash = "ffffffffffffffffffffffffffffffffffffffff";
        db.insert_firmware(firmware(hash, "a.cab")).await.unwrap();

        let err = db
            .insert_firmware(firmware(hash, "b.cab"))
            .await
            .unwrap_err();
        let firmware_err = err.downcast::<FirmwareError>().unwrap();
        assert_eq!(firmware_err, FirmwareError::DuplicateHash(hash.to_string()));
        assert_eq!(db.count_firmware().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_firmware_is_scoped_to_vendor() {
        let (db, _tmp) = setup_db().await;
        db.insert_firmware(firmware("aaaa", "aaaa-one.cab"))
            .await
            .unwrap();
        db.insert_firmware(NewFirmware {
            vendor_key: "other-vendor",
            ..firmware("bbbb", "bbbb-two.cab")
        })
        .await
        .unwrap();

        let listed = db.list_firmware("vendor-key-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hash, "aaaa");
    }
}
