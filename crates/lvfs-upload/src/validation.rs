//! Content checks applied to every uploaded archive.

use sha1::{Digest, Sha1};

/// Smallest archive accepted, in bytes.
pub const MIN_FIRMWARE_SIZE: u64 = 1280;
/// Largest archive accepted, in bytes.
pub const MAX_FIRMWARE_SIZE: u64 = 50_000_000;
/// Microsoft cabinet signature.
pub const CAB_MAGIC: &[u8] = b"MSCF";
/// Every archive must ship AppStream metadata.
pub const METAINFO_MARKER: &[u8] = b".metainfo.xml";

/// One step of the upload validation sequence. The declaration order is the
/// order flags appear in the redirect query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UploadCheck {
    AuthKey,
    SizeCheck,
    FileType,
    Metadata,
    Exists,
}

impl UploadCheck {
    pub const ALL: [UploadCheck; 5] = [
        UploadCheck::AuthKey,
        UploadCheck::SizeCheck,
        UploadCheck::FileType,
        UploadCheck::Metadata,
        UploadCheck::Exists,
    ];

    /// Query-string key for this check.
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadCheck::AuthKey => "authkey",
            UploadCheck::SizeCheck => "sizecheck",
            UploadCheck::FileType => "filetype",
            UploadCheck::Metadata => "metadata",
            UploadCheck::Exists => "exists",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            UploadCheck::AuthKey => "the vendor key was not recognised",
            UploadCheck::SizeCheck => "the archive must be between 1280 bytes and 50 MB",
            UploadCheck::FileType => "the file is not a cabinet archive",
            UploadCheck::Metadata => "the archive has no .metainfo.xml metadata",
            UploadCheck::Exists => "this firmware has already been uploaded",
        }
    }
}

/// Accumulated outcome of the validation sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    failures: Vec<UploadCheck>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `check` as failed unless `passed` holds.
    pub fn record(&mut self, check: UploadCheck, passed: bool) {
        if !passed && !self.failures.contains(&check) {
            self.failures.push(check);
            self.failures.sort();
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, check: UploadCheck) -> bool {
        self.failures.contains(&check)
    }

    pub fn failures(&self) -> &[UploadCheck] {
        &self.failures
    }

    /// Renders the flags as `authkey=False&...&result=False`.
    pub fn to_query(&self) -> String {
        let mut query = String::new();
        for check in &self.failures {
            query.push_str(check.as_str());
            query.push_str("=False&");
        }
        query.push_str("result=");
        query.push_str(flag_value(self.passed()));
        query
    }

    /// Redirect target for `page`, e.g. `result.php?sizecheck=False&result=False`.
    pub fn redirect_location(&self, page: &str) -> String {
        format!("{page}?{}", self.to_query())
    }
}

fn flag_value(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub fn size_in_range(size: u64) -> bool {
    (MIN_FIRMWARE_SIZE..=MAX_FIRMWARE_SIZE).contains(&size)
}

pub fn is_cabinet(data: &[u8]) -> bool {
    data.starts_with(CAB_MAGIC)
}

pub fn has_metainfo(data: &[u8]) -> bool {
    data.windows(METAINFO_MARKER.len())
        .any(|window| window == METAINFO_MARKER)
}

/// SHA-1 of the raw archive bytes as lowercase hex.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
