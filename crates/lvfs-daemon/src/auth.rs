use lvfs_db::{Database, VendorRecord};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VendorInfo {
    pub name: String,
    pub key_prefix: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid or unknown vendor key")]
    InvalidToken,
    #[error("vendor lookup failed: {0}")]
    Internal(String),
}

/// Resolves vendor keys against the `vendors` table.
#[derive(Clone)]
pub struct AuthService {
    db: Database,
}

impl AuthService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn authorize(&self, token: &str) -> Result<VendorRecord, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        self.db
            .find_vendor(token)
            .await
            .map_err(|err| AuthError::Internal(err.to_string()))?
            .ok_or(AuthError::InvalidToken)
    }
}

impl From<&VendorRecord> for VendorInfo {
    fn from(record: &VendorRecord) -> Self {
        Self {
            name: record.name.clone(),
            key_prefix: key_prefix(&record.vendor_key),
        }
    }
}

/// First few characters of a key, safe to echo back in responses and logs.
pub fn key_prefix(key: &str) -> String {
    key.chars().take(6).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn authorize_resolves_known_vendor() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::connect_file(&temp.path().join("auth.sqlite"))
            .await
            .expect("db");
        db.insert_vendor("known-vendor-key", "Acme")
            .await
            .expect("vendor");
        let auth = AuthService::new(db);

        let vendor = auth.authorize("known-vendor-key").await.expect("vendor");
        assert_eq!(vendor.name, "Acme");
        assert_eq!(VendorInfo::from(&vendor).key_prefix, "known-");

        assert!(matches!(
            auth.authorize("other-key").await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(auth.authorize("").await, Err(AuthError::InvalidToken)));
    }
}
