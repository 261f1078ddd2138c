use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

/// Applies SQL migrations by shelling out to the goose binary.
///
/// The driver and DSN are passed straight through, so any database goose
/// knows about works here.
pub struct MigrationRunner {
    goose_binary_path: String,
    migrations_dir: String,
    driver: String,
    dsn: String,
}

impl MigrationRunner {
    pub fn new(
        goose_binary_path: impl Into<String>,
        migrations_dir: impl Into<String>,
        driver: impl Into<String>,
        dsn: impl Into<String>,
    ) -> Self {
        Self {
            goose_binary_path: goose_binary_path.into(),
            migrations_dir: migrations_dir.into(),
            driver: driver.into(),
            dsn: dsn.into(),
        }
    }

    /// Arguments for `goose -dir {migrations_dir} {driver} {dsn} up`
    fn up_args(&self) -> [&str; 5] {
        ["-dir", &self.migrations_dir, &self.driver, &self.dsn, "up"]
    }

    /// Apply every pending migration
    pub async fn run_migrations(&self) -> Result<()> {
        info!(dir = %self.migrations_dir, driver = %self.driver, "Running database migrations");

        let output = Command::new(&self.goose_binary_path)
            .args(self.up_args())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.goose_binary_path))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Migration failed ({}).\nstdout: {}\nstderr: {}",
                output.status,
                stdout,
                stderr
            );
        }

        debug!(output = %stdout, "Migrations completed");
        Ok(())
    }
}
