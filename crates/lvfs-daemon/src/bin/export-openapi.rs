//! Writes the upload API description as YAML, to stdout or to the given path.

use std::{env, fs, path::PathBuf};

use anyhow::{Context, Result};
use lvfs_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

fn main() -> Result<()> {
    let yaml = ApiDoc::openapi()
        .to_yaml()
        .context("failed to render OpenAPI document")?;

    let Some(target) = env::args().nth(1).map(PathBuf::from) else {
        println!("{yaml}");
        return Ok(());
    };

    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&target, yaml).with_context(|| format!("failed to write {}", target.display()))?;
    Ok(())
}
