use anyhow::Result;

use lvfs_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("lvfs-daemon")?;
    lvfs_daemon::server::run().await
}
