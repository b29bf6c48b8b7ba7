//! C7: scans the export directory tree with a TTL cache and a recent-
//! window fast path; paginates listings; resolves download paths safely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::errors::{Result, TraktExportError};

const META_FILE_NAME: &str = ".export-meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct ExportMeta {
    duration_secs: u64,
    error: Option<String>,
}

const TTL: Duration = Duration::from_secs(5 * 60);
const RECENT_WINDOW_DAYS: i64 = 30;
const RECENT_FAST_PATH_MIN_ITEMS: usize = 50;
const OLDER_PASS_MAX_ITEMS: usize = 100;
const ONE_MIB: u64 = 1024 * 1024;
const ESTIMATE_BYTES_PER_RECORD: u64 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    Completed,
    Failed,
    InProgress,
}

#[derive(Debug, Clone)]
pub struct ExportItem {
    pub id: String,
    pub export_type: String,
    pub date: DateTime<Utc>,
    pub status: ExportStatus,
    pub files: Vec<String>,
    pub record_count: u64,
    pub file_size_bytes: u64,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<ExportItem>,
    pub page: usize,
    pub size: usize,
    pub total: usize,
    pub total_pages: usize,
    pub has_prev: bool,
    pub has_next: bool,
}

pub const MAX_PAGE_SIZE: usize = 100;

struct Snapshot {
    scanned_at: SystemTime,
    items: Vec<ExportItem>,
}

pub struct ExportRegistry {
    export_dir: PathBuf,
    snapshot: RwLock<Option<Snapshot>>,
}

impl ExportRegistry {
    pub fn new(export_dir: PathBuf) -> Self {
        Self {
            export_dir,
            snapshot: RwLock::new(None),
        }
    }

    /// Invalidates the cached snapshot; called on every HTTP-server
    /// transition out of `running` so listings reflect the finished export.
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }

    /// Records a finished run's duration/error against `export_id`'s
    /// directory so the next scan can backfill `ExportItem::duration` and
    /// `ExportItem::error`. Best-effort: a write failure only means those
    /// two fields stay `None` for this export, never an export-wide error.
    pub async fn record_outcome(&self, export_id: &str, duration: Duration, error: Option<String>) {
        let dir = self.export_dir.join(export_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            log::warn!("could not create {export_id}'s export directory for metadata: {e}");
            return;
        }
        let meta = ExportMeta {
            duration_secs: duration.as_secs(),
            error,
        };
        let Ok(body) = serde_json::to_vec(&meta) else {
            return;
        };
        if let Err(e) = tokio::fs::write(dir.join(META_FILE_NAME), body).await {
            log::warn!("failed writing export metadata for {export_id}: {e}");
        }
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        {
            let guard = self.snapshot.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.scanned_at.elapsed().unwrap_or(Duration::MAX) < TTL {
                    return Ok(());
                }
            }
        }
        let items = self.scan().await?;
        *self.snapshot.write().await = Some(Snapshot {
            scanned_at: SystemTime::now(),
            items,
        });
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<ExportItem>> {
        let export_dir = self.export_dir.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&export_dir))
            .await
            .map_err(|e| TraktExportError::Internal(format!("scan task panicked: {e}")))?
    }

    pub async fn list(&self) -> Result<Vec<ExportItem>> {
        self.refresh_if_stale().await?;
        let guard = self.snapshot.read().await;
        Ok(guard
            .as_ref()
            .map(|s| s.items.clone())
            .unwrap_or_default())
    }

    pub async fn list_page(
        &self,
        page: usize,
        limit: usize,
        export_type: Option<&str>,
        status: Option<ExportStatus>,
    ) -> Result<Page> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let all = self.list().await?;
        let filtered: Vec<ExportItem> = all
            .into_iter()
            .filter(|item| export_type.map_or(true, |t| item.export_type == t))
            .filter(|item| status.map_or(true, |s| item.status == s))
            .collect();

        let total = filtered.len();
        let total_pages = total.div_ceil(limit).max(1);
        let start = (page - 1) * limit;
        let items: Vec<ExportItem> = filtered.into_iter().skip(start).take(limit).collect();

        Ok(Page {
            items,
            page,
            size: limit,
            total,
            total_pages,
            has_prev: page > 1,
            has_next: page < total_pages,
        })
    }

    /// Resolves `<export_dir>/<id>/<file>`, refusing any path that
    /// canonicalizes outside `export_dir` (`..` segments or symlinks).
    pub fn resolve_download(&self, id: &str, file: &str) -> Result<PathBuf> {
        let candidate = self.export_dir.join(id).join(file);
        let canonical_export_dir = self
            .export_dir
            .canonicalize()
            .map_err(|_| TraktExportError::NotFound("export directory missing".to_string()))?;
        let canonical_candidate = candidate
            .canonicalize()
            .map_err(|_| TraktExportError::NotFound(format!("{id}/{file} not found")))?;

        if !canonical_candidate.starts_with(&canonical_export_dir) {
            return Err(TraktExportError::Forbidden(format!(
                "{id}/{file} resolves outside the export directory"
            )));
        }
        Ok(canonical_candidate)
    }
}

fn scan_blocking(export_dir: &Path) -> Result<Vec<ExportItem>> {
    if !export_dir.exists() {
        return Ok(Vec::new());
    }

    let now = SystemTime::now();
    let mut recent = Vec::new();
    let mut older = Vec::new();

    for entry in WalkDir::new(export_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let metadata = entry.metadata().map_err(|e| {
            TraktExportError::Internal(format!("failed reading metadata for {:?}: {e}", entry.path()))
        })?;
        let modified = metadata.modified().unwrap_or(now);
        let age_days = now
            .duration_since(modified)
            .unwrap_or_default()
            .as_secs() as i64
            / 86_400;

        if age_days <= RECENT_WINDOW_DAYS {
            recent.push((entry.into_path(), modified));
        } else {
            older.push((entry.into_path(), modified));
        }
    }

    let mut dirs = recent;
    if dirs.len() < RECENT_FAST_PATH_MIN_ITEMS {
        older.sort_by(|a, b| b.1.cmp(&a.1));
        dirs.extend(older.into_iter().take(OLDER_PASS_MAX_ITEMS));
    }

    let mut items: Vec<ExportItem> = dirs
        .into_iter()
        .map(|(path, modified)| build_item(&path, modified))
        .collect();
    items.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(items)
}

fn build_item(dir: &Path, modified: SystemTime) -> ExportItem {
    let id = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let export_type = infer_export_type(&id);
    let date: DateTime<Utc> = modified.into();

    let mut files = Vec::new();
    let mut total_size = 0u64;
    let mut total_records = 0u64;

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "csv"))
    {
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        total_size += size;
        total_records += estimate_record_count(entry.path(), size);
        if let Some(name) = entry.path().file_name() {
            files.push(name.to_string_lossy().into_owned());
        }
    }

    let meta = read_meta(dir);
    let status = if let Some((_, Some(_))) = &meta {
        ExportStatus::Failed
    } else if files.is_empty() {
        ExportStatus::Failed
    } else {
        ExportStatus::Completed
    };
    let (duration, error) = match meta {
        Some((duration_secs, error)) => (Some(Duration::from_secs(duration_secs)), error),
        None => (None, None),
    };

    ExportItem {
        id,
        export_type,
        date,
        status,
        files,
        record_count: total_records,
        file_size_bytes: total_size,
        duration,
        error,
    }
}

fn read_meta(dir: &Path) -> Option<(u64, Option<String>)> {
    let raw = std::fs::read(dir.join(META_FILE_NAME)).ok()?;
    let meta: ExportMeta = serde_json::from_slice(&raw).ok()?;
    Some((meta.duration_secs, meta.error))
}

fn infer_export_type(id: &str) -> String {
    if id.contains("watched") {
        "watched".to_string()
    } else if id.contains("collection") {
        "collection".to_string()
    } else if id.contains("shows") {
        "shows".to_string()
    } else if id.contains("ratings") {
        "ratings".to_string()
    } else if id.contains("watchlist") {
        "watchlist".to_string()
    } else {
        "all".to_string()
    }
}

fn estimate_record_count(path: &Path, size: u64) -> u64 {
    if size <= ONE_MIB {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count().saturating_sub(1).max(0) as u64)
            .unwrap_or(0)
    } else {
        size / ESTIMATE_BYTES_PER_RECORD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_export(dir: &Path, name: &str, rows: &[&str]) {
        let export_dir = dir.join(name);
        std::fs::create_dir_all(&export_dir).unwrap();
        let mut content = String::from("Title,Year,imdbID,tmdbID,WatchedDate,Rating10,Rewatch\n");
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        std::fs::write(export_dir.join("watched.csv"), content).unwrap();
    }

    #[tokio::test]
    async fn list_page_reflects_scanned_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_export(dir.path(), "export_2025-01-01_00-00", &["A,2020,\"tt1\",1,2025-01-01,,false"]);
        write_export(dir.path(), "export_2025-02-01_00-00", &["B,2021,\"tt2\",2,2025-02-01,,false"]);

        let registry = ExportRegistry::new(dir.path().to_path_buf());
        let page = registry.list_page(1, 10, None, None).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, "export_2025-02-01_00-00");
    }

    #[tokio::test]
    async fn directory_without_csv_children_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("export_empty")).unwrap();

        let registry = ExportRegistry::new(dir.path().to_path_buf());
        let items = registry.list().await.unwrap();
        assert_eq!(items[0].status, ExportStatus::Failed);
    }

    #[tokio::test]
    async fn resolve_download_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        write_export(dir.path(), "export_2025-01-01_00-00", &["A,2020,\"tt1\",1,2025-01-01,,false"]);
        std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();

        let registry = ExportRegistry::new(dir.path().to_path_buf());
        let err = registry
            .resolve_download("export_2025-01-01_00-00", "../secret.txt")
            .unwrap_err();
        assert!(matches!(err, TraktExportError::Forbidden(_)));

        let ok = registry
            .resolve_download("export_2025-01-01_00-00", "watched.csv")
            .unwrap();
        assert!(ok.ends_with("watched.csv"));
    }

    #[tokio::test]
    async fn record_outcome_backfills_duration_and_error() {
        let dir = tempfile::tempdir().unwrap();
        write_export(dir.path(), "export_2025-01-01_00-00", &["A,2020,\"tt1\",1,2025-01-01,,false"]);

        let registry = ExportRegistry::new(dir.path().to_path_buf());
        registry
            .record_outcome(
                "export_2025-01-01_00-00",
                Duration::from_secs(42),
                Some("history/movies failed".to_string()),
            )
            .await;

        let items = registry.list().await.unwrap();
        assert_eq!(items[0].duration, Some(Duration::from_secs(42)));
        assert_eq!(items[0].error.as_deref(), Some("history/movies failed"));
        assert_eq!(items[0].status, ExportStatus::Failed);
    }

    #[tokio::test]
    async fn pagination_clamps_limit_and_computes_pages() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_export(dir.path(), &format!("export_2025-01-0{i}_00-00"), &["A,2020,\"tt1\",1,2025-01-01,,false"]);
        }
        let registry = ExportRegistry::new(dir.path().to_path_buf());
        let page = registry.list_page(1, 2, None, None).await.unwrap();
        assert_eq!(page.size, 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next);
        assert!(!page.has_prev);
    }
}
