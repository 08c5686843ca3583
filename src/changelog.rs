use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::schema::ChangelogEntry;
use crate::util::ensure_directory;

/// Append entries to the JSONL changelog, one record per line. The file is
/// only ever appended to, never rewritten.
pub fn append_entries(path: &Path, entries: &[ChangelogEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open changelog {}", path.display()))?;

    let mut buffer = String::new();
    for entry in entries {
        let line = serde_json::to_string(entry)
            .with_context(|| format!("failed to serialize changelog entry for {}", entry.record_id))?;
        buffer.push_str(&line);
        buffer.push('\n');
    }

    file.write_all(buffer.as_bytes())
        .with_context(|| format!("failed to append changelog {}", path.display()))?;

    Ok(())
}

pub fn read_entries(path: &Path) -> Result<Vec<ChangelogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read changelog {}", path.display()))?;

    let mut entries = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: ChangelogEntry = serde_json::from_str(line).with_context(|| {
            format!("corrupt changelog line {} in {}", index + 1, path.display())
        })?;
        entries.push(entry);
    }

    Ok(entries)
}
