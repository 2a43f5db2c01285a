//! On-disk store for artifacts returned by beacons.
//!
//! Uploaded content is written as `<loot_dir>/<task_id>_<sanitized filename>`
//! so two beacons returning `passwd` never collide and no beacon-supplied name
//! can escape the loot directory.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::hasher;

/// Longest filename kept after sanitizing.
const MAX_NAME_LEN: usize = 128;

pub struct LootStore {
    dir: PathBuf,
}

/// Where a piece of loot ended up.
#[derive(Debug, Clone)]
pub struct LootRecord {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl LootStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `content` for `task_id`. Written to a temp name first, then
    /// renamed into place.
    pub async fn save(
        &self,
        task_id: &str,
        original_name: &str,
        content: &[u8],
    ) -> std::io::Result<LootRecord> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = format!(
            "{}_{}",
            sanitize_filename(task_id),
            sanitize_filename(original_name)
        );
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.part"));

        let mut file = tokio::fs::File::create(&tmp).await?;
        if let Err(e) = async {
            file.write_all(content).await?;
            file.sync_data().await
        }
        .await
        {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        let record = LootRecord {
            path,
            size: content.len() as u64,
            sha256: hasher::hash_bytes(content),
        };
        info!(
            task_id,
            path = %record.path.display(),
            size = record.size,
            "Stored loot"
        );
        Ok(record)
    }
}

/// Reduce a beacon-supplied name to a single safe path component.
///
/// Keeps only the last component of either `/` or `\` paths, maps anything
/// outside `[A-Za-z0-9._-]` to `_`, strips leading dots, and caps the length.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    let capped: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    if capped.is_empty() {
        "unnamed".to_string()
    } else {
        capped
    }
}
