use anyhow::Result;
use tracing::info;

use crate::cli::InitArgs;
use crate::config::Settings;
use crate::store;

/// Create the data layout and an empty store with the current schema.
/// Safe to run repeatedly; existing data is never touched.
pub fn run(args: InitArgs) -> Result<()> {
    let settings = Settings::load(args.data_root)?;
    settings.ensure_dirs()?;

    let connection = store::open(&settings.db_path)?;
    drop(connection);

    info!(
        data_root = %settings.data_root.display(),
        store = %settings.db_path.display(),
        "initialized"
    );

    Ok(())
}
