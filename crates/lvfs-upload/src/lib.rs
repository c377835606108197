//! Firmware upload core.
//!
//! [`UploadService`] runs the LVFS acceptance sequence for a single archive:
//! every check is evaluated (failures accumulate rather than short-circuit),
//! and only a fully passing upload is written to content-addressed storage and
//! recorded in the `firmware` table. The file write and the row insert are not
//! atomic; when the insert fails the file is removed again on a best-effort
//! basis, unless a concurrent upload recorded that same file.

mod storage;
pub mod validation;

use std::path::PathBuf;

use lvfs_db::{Database, FirmwareError, FirmwareRecord, NewFirmware};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub use storage::{FirmwareStorage, LocalFirmwareStorage, StorageError};
pub use validation::{UploadCheck, ValidationReport};

/// A single archive submitted by a vendor.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub auth_token: String,
    pub remote_addr: String,
    pub filename: String,
    pub size: u64,
    pub data: Vec<u8>,
}

impl UploadRequest {
    /// Builds a request whose declared size is the payload length.
    pub fn new(
        auth_token: impl Into<String>,
        remote_addr: impl Into<String>,
        filename: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            auth_token: auth_token.into(),
            remote_addr: remote_addr.into(),
            filename: filename.into(),
            size: data.len() as u64,
            data,
        }
    }
}

/// Result of an upload attempt that reached the end of validation.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub report: ValidationReport,
    pub hash: String,
    pub record: Option<FirmwareRecord>,
    pub stored_path: Option<PathBuf>,
}

impl UploadOutcome {
    pub fn accepted(&self) -> bool {
        self.report.passed()
    }

    pub fn redirect_location(&self, page: &str) -> String {
        self.report.redirect_location(page)
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("firmware with hash {0} was recorded concurrently")]
    Duplicate(String),
    #[error("database error: {0}")]
    Database(anyhow::Error),
}

/// Name under which an archive is stored: `{sha1}-{original name}`.
pub fn stored_filename(hash: &str, original: &str) -> String {
    format!("{hash}-{original}")
}

/// Validates, stores and records uploaded firmware.
pub struct UploadService<S>
where
    S: FirmwareStorage,
{
    db: Database,
    storage: S,
}

impl<S> UploadService<S>
where
    S: FirmwareStorage,
{
    pub fn new(db: Database, storage: S) -> Self {
        Self { db, storage }
    }

    /// Runs every check, then stores and records the archive if all passed.
    #[instrument(skip(self, request), fields(filename = %request.filename, size = request.size, addr = %request.remote_addr))]
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, UploadError> {
        let hash = validation::content_hash(&request.data);
        let report = self.evaluate(&request, &hash).await?;

        if !report.passed() {
            warn!(hash = %hash, flags = %report.to_query(), "firmware upload rejected");
            return Ok(UploadOutcome {
                report,
                hash,
                record: None,
                stored_path: None,
            });
        }

        let filename = stored_filename(&hash, &request.filename);
        let stored_path = self.storage.store(&filename, &request.data).await?;

        let inserted = self
            .db
            .insert_firmware(NewFirmware {
                vendor_key: &request.auth_token,
                addr: &request.remote_addr,
                filename: &filename,
                hash: &hash,
            })
            .await;

        let record = match inserted {
            Ok(record) => record,
            Err(err) => match err.downcast::<FirmwareError>() {
                Ok(FirmwareError::DuplicateHash(hash)) => {
                    // The winning row may point at the very file we just wrote.
                    if !self.recorded_as(&hash, &filename).await {
                        self.discard(&filename).await;
                    }
                    return Err(UploadError::Duplicate(hash));
                }
                Err(err) => {
                    self.discard(&filename).await;
                    return Err(UploadError::Database(err));
                }
            },
        };

        info!(hash = %hash, stored = %stored_path.display(), "firmware upload accepted");
        Ok(UploadOutcome {
            report,
            hash,
            record: Some(record),
            stored_path: Some(stored_path),
        })
    }

    /// True when the row recorded for `hash` refers to `filename`. Lookup
    /// failures count as a match so the archive is kept.
    async fn recorded_as(&self, hash: &str, filename: &str) -> bool {
        match self.db.fetch_firmware_by_hash(hash).await {
            Ok(Some(record)) => record.filename == filename,
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "cannot resolve concurrent firmware row");
                true
            }
        }
    }

    async fn discard(&self, filename: &str) {
        if let Err(cleanup) = self.storage.remove(filename).await {
            warn!(error = %cleanup, "failed to remove archive after insert failure");
        }
    }

    /// Evaluates all checks without side effects.
    pub async fn validate(&self, request: &UploadRequest) -> Result<ValidationReport, UploadError> {
        let hash = validation::content_hash(&request.data);
        self.evaluate(request, &hash).await
    }

    async fn evaluate(
        &self,
        request: &UploadRequest,
        hash: &str,
    ) -> Result<ValidationReport, UploadError> {
        let mut report = ValidationReport::new();

        let vendor = self
            .db
            .find_vendor(&request.auth_token)
            .await
            .map_err(UploadError::Database)?;
        report.record(UploadCheck::AuthKey, vendor.is_some());

        report.record(
            UploadCheck::SizeCheck,
            validation::size_in_range(request.size),
        );
        report.record(UploadCheck::FileType, validation::is_cabinet(&request.data));
        report.record(
            UploadCheck::Metadata,
            validation::has_metainfo(&request.data),
        );

        let exists = self
            .db
            .firmware_exists(hash)
            .await
            .map_err(UploadError::Database)?;
        report.record(UploadCheck::Exists, !exists);

        Ok(report)
    }
}
