use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

use crate::changelog;
use crate::cli::StatusArgs;
use crate::config::Settings;
use crate::store;

pub fn run(args: StatusArgs) -> Result<()> {
    let settings = Settings::load(args.data_root)?;

    info!(data_root = %settings.data_root.display(), "status requested");

    if settings.db_path.exists() {
        let connection = Connection::open_with_flags(
            &settings.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {}", settings.db_path.display()))?;

        let benchmarks = store::count_rows(&connection, "SELECT COUNT(*) FROM benchmarks")?;
        let models = store::count_rows(&connection, "SELECT COUNT(*) FROM models")?;
        let sources = store::count_rows(&connection, "SELECT COUNT(*) FROM sources")?;
        let results = store::count_rows(&connection, "SELECT COUNT(*) FROM results")?;
        let overridden = store::count_rows(
            &connection,
            "SELECT COUNT(*) FROM results WHERE is_override = 1",
        )?;
        let last_update: Option<String> = connection
            .query_row(
                "SELECT value FROM metadata WHERE key = 'last_update'",
                [],
                |row| row.get(0),
            )
            .ok();

        info!(
            path = %settings.db_path.display(),
            benchmarks,
            models,
            sources,
            results,
            overridden,
            last_update = %last_update.unwrap_or_default(),
            "store status"
        );
    } else {
        warn!(path = %settings.db_path.display(), "store file missing; run init first");
    }

    let entries = changelog::read_entries(&settings.changelog_path)?;
    info!(
        path = %settings.changelog_path.display(),
        entries = entries.len(),
        "changelog status"
    );

    let backups = match std::fs::read_dir(&settings.backups_dir) {
        Ok(dir) => dir.count(),
        Err(_) => 0,
    };
    info!(
        path = %settings.backups_dir.display(),
        backups,
        retention_days = settings.backup_retention_days,
        "backup status"
    );

    Ok(())
}
