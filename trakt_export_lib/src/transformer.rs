//! C6: parses backup JSON, joins ratings/plays, dedupes, and emits the
//! Letterboxd-shaped CSV. A pure function of (backup directory,
//! history_mode, lookups) to a row sequence; the CSV writer owns escaping
//! so callers never hand-assemble delimited strings.

use chrono::{DateTime, NaiveDate};
use csv::{QuoteStyle, WriterBuilder};
use log::warn;
use serde::Deserialize;
use std::{collections::HashMap, path::Path};
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    config::HistoryMode,
    errors::Result,
};

#[derive(Debug, Deserialize, Clone)]
struct Ids {
    trakt: Option<i64>,
    imdb: Option<String>,
    tmdb: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
struct MovieRef {
    title: String,
    year: Option<i32>,
    ids: Ids,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    watched_at: Option<String>,
    movie: MovieRef,
}

#[derive(Debug, Deserialize)]
struct WatchedEntry {
    plays: Option<i64>,
    last_watched_at: Option<String>,
    movie: MovieRef,
}

#[derive(Debug, Deserialize)]
struct RatingEntry {
    rating: Option<i64>,
    movie: MovieRef,
}

#[derive(Debug, Clone)]
pub struct LetterboxdRow {
    pub title: String,
    pub year: Option<i32>,
    pub imdb_id: String,
    pub tmdb_id: Option<i64>,
    pub watched_date: String,
    pub rating10: Option<u8>,
    pub rewatch: bool,
}

pub struct TransformResult {
    pub rows: Vec<LetterboxdRow>,
    pub skipped_count: usize,
    pub used_watched_only_fallback: bool,
}

fn normalize_imdb(raw: &str) -> String {
    raw.trim_start_matches("tt").to_string()
}

fn emit_imdb(raw: &str) -> String {
    format!("tt{}", raw.trim_start_matches("tt"))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .ok()
}

fn render_date(raw: &str) -> String {
    match parse_date(raw) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => String::new(),
    }
}

async fn read_json_array<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(Into::into),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Reads the backup directory's `history`/`ratings`/`watched` artifacts
/// for `user` and produces the joined, deduplicated row sequence.
pub async fn transform(
    backup_dir: &Path,
    user: &str,
    history_mode: HistoryMode,
) -> Result<TransformResult> {
    let history_path = backup_dir.join(format!("{user}-history_movies.json"));
    let watched_path = backup_dir.join(format!("{user}-watched_movies.json"));
    let ratings_path = backup_dir.join(format!("{user}-ratings_movies.json"));

    let history: Vec<HistoryEntry> = read_json_array(&history_path).await?;
    let watched: Vec<WatchedEntry> = read_json_array(&watched_path).await?;
    let ratings: Vec<RatingEntry> = read_json_array(&ratings_path).await?;

    let ratings_by_trakt: HashMap<String, u8> = ratings
        .iter()
        .filter_map(|r| {
            let trakt_id = r.movie.ids.trakt?;
            let rating = r.rating?;
            if (1..=10).contains(&rating) {
                Some((trakt_id.to_string(), rating as u8))
            } else {
                None
            }
        })
        .collect();

    let plays_by_imdb: HashMap<String, i64> = watched
        .iter()
        .filter_map(|w| {
            let imdb = w.movie.ids.imdb.clone()?;
            Some((imdb, w.plays.unwrap_or(0)))
        })
        .collect();

    let used_watched_only_fallback = history.is_empty() && !watched.is_empty();
    let mut skipped_count = 0usize;

    let mut rows: Vec<LetterboxdRow> = match history_mode {
        HistoryMode::Aggregated => build_aggregated(
            &history,
            &watched,
            &ratings_by_trakt,
            &plays_by_imdb,
            &mut skipped_count,
        ),
        HistoryMode::Individual => build_individual(
            &history,
            &ratings_by_trakt,
            &plays_by_imdb,
            &mut skipped_count,
        ),
    };

    if used_watched_only_fallback {
        rows = build_watched_only(&watched, &ratings_by_trakt, &plays_by_imdb, &mut skipped_count);
    } else {
        supplement_from_watched(
            &mut rows,
            &watched,
            &ratings_by_trakt,
            &plays_by_imdb,
            &mut skipped_count,
        );
    }

    Ok(TransformResult {
        rows,
        skipped_count,
        used_watched_only_fallback,
    })
}

fn row_from_movie(
    movie: &MovieRef,
    watched_date: String,
    rewatch: bool,
    ratings_by_trakt: &HashMap<String, u8>,
    skipped_count: &mut usize,
) -> Option<LetterboxdRow> {
    let raw_imdb = match movie.ids.imdb.as_deref() {
        Some(imdb) if !imdb.is_empty() => imdb,
        _ => {
            warn!(
                "skipping row with missing imdb id: title={} year={:?}",
                movie.title, movie.year
            );
            *skipped_count += 1;
            return None;
        }
    };

    let rating10 = movie
        .ids
        .trakt
        .and_then(|trakt_id| ratings_by_trakt.get(&trakt_id.to_string()).copied());

    Some(LetterboxdRow {
        title: movie.title.clone(),
        year: movie.year,
        imdb_id: emit_imdb(raw_imdb),
        tmdb_id: movie.ids.tmdb,
        watched_date,
        rating10,
        rewatch,
    })
}

fn build_aggregated(
    history: &[HistoryEntry],
    watched: &[WatchedEntry],
    ratings_by_trakt: &HashMap<String, u8>,
    plays_by_imdb: &HashMap<String, i64>,
    skipped_count: &mut usize,
) -> Vec<LetterboxdRow> {
    let _ = watched;
    struct Retained {
        movie: MovieRef,
        watched_at_raw: String,
        watched_at: Option<NaiveDate>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut retained: HashMap<String, Retained> = HashMap::new();

    for entry in history {
        let Some(raw_imdb) = entry.movie.ids.imdb.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let key = normalize_imdb(raw_imdb);
        let watched_at_raw = entry.watched_at.clone().unwrap_or_default();
        let watched_at = parse_date(&watched_at_raw);

        match retained.get(&key) {
            Some(existing) if existing.watched_at >= watched_at => {}
            _ => {
                if !retained.contains_key(&key) {
                    order.push(key.clone());
                }
                retained.insert(
                    key,
                    Retained {
                        movie: entry.movie.clone(),
                        watched_at_raw,
                        watched_at,
                    },
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            let entry = retained.remove(&key)?;
            let plays = entry
                .movie
                .ids
                .imdb
                .as_deref()
                .and_then(|imdb| plays_by_imdb.get(imdb))
                .copied()
                .unwrap_or(0);
            row_from_movie(
                &entry.movie,
                render_date(&entry.watched_at_raw),
                plays > 1,
                ratings_by_trakt,
                skipped_count,
            )
        })
        .collect()
}

fn build_individual(
    history: &[HistoryEntry],
    ratings_by_trakt: &HashMap<String, u8>,
    plays_by_imdb: &HashMap<String, i64>,
    skipped_count: &mut usize,
) -> Vec<LetterboxdRow> {
    let _ = plays_by_imdb;
    let mut earliest: HashMap<String, Option<NaiveDate>> = HashMap::new();

    for entry in history {
        let Some(raw_imdb) = entry.movie.ids.imdb.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let key = normalize_imdb(raw_imdb);
        let date = entry.watched_at.as_deref().and_then(parse_date);
        earliest
            .entry(key)
            .and_modify(|current| {
                if let (Some(d), Some(c)) = (date, *current) {
                    if d < c {
                        *current = Some(d);
                    }
                } else if current.is_none() {
                    *current = date;
                }
            })
            .or_insert(date);
    }

    history
        .iter()
        .filter_map(|entry| {
            let raw_imdb = entry.movie.ids.imdb.as_deref().filter(|s| !s.is_empty())?;
            let key = normalize_imdb(raw_imdb);
            let watched_at_raw = entry.watched_at.clone().unwrap_or_default();
            let date = parse_date(&watched_at_raw);
            let is_earliest = earliest.get(&key).copied().flatten() == date;
            row_from_movie(
                &entry.movie,
                render_date(&watched_at_raw),
                !is_earliest,
                ratings_by_trakt,
                skipped_count,
            )
        })
        .collect()
}

fn build_watched_only(
    watched: &[WatchedEntry],
    ratings_by_trakt: &HashMap<String, u8>,
    plays_by_imdb: &HashMap<String, i64>,
    skipped_count: &mut usize,
) -> Vec<LetterboxdRow> {
    watched
        .iter()
        .filter_map(|entry| {
            let plays = entry
                .movie
                .ids
                .imdb
                .as_deref()
                .and_then(|imdb| plays_by_imdb.get(imdb))
                .copied()
                .unwrap_or(entry.plays.unwrap_or(0));
            row_from_movie(
                &entry.movie,
                render_date(entry.last_watched_at.as_deref().unwrap_or_default()),
                plays > 1,
                ratings_by_trakt,
                skipped_count,
            )
        })
        .collect()
}

/// Appends any movie present in the watched file but absent from `rows`,
/// deduplicated by IMDb ID regardless of history mode.
fn supplement_from_watched(
    rows: &mut Vec<LetterboxdRow>,
    watched: &[WatchedEntry],
    ratings_by_trakt: &HashMap<String, u8>,
    plays_by_imdb: &HashMap<String, i64>,
    skipped_count: &mut usize,
) {
    let mut present: std::collections::HashSet<String> =
        rows.iter().map(|r| normalize_imdb(&r.imdb_id)).collect();

    for entry in watched {
        let Some(raw_imdb) = entry.movie.ids.imdb.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let key = normalize_imdb(raw_imdb);
        if present.contains(&key) {
            continue;
        }
        let plays = plays_by_imdb.get(raw_imdb).copied().unwrap_or(entry.plays.unwrap_or(0));
        if let Some(row) = row_from_movie(
            &entry.movie,
            render_date(entry.last_watched_at.as_deref().unwrap_or_default()),
            plays > 1,
            ratings_by_trakt,
            skipped_count,
        ) {
            present.insert(key);
            rows.push(row);
        }
    }
}

fn escape_title(title: &str) -> String {
    if title.contains(',') || title.contains('"') || title.contains('\n') || title.contains('\r') {
        format!("\"{}\"", title.replace('"', "\"\""))
    } else {
        title.to_string()
    }
}

/// Writes `rows` to `output_path` via a temp-file-then-rename, so a
/// concurrent reader of the final path never observes a partial CSV.
pub async fn write_csv(rows: &[LetterboxdRow], output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755)).await?;
        }
    }

    let mut writer = WriterBuilder::new().quote_style(QuoteStyle::Never).from_writer(Vec::new());
    writer.write_record(["Title", "Year", "imdbID", "tmdbID", "WatchedDate", "Rating10", "Rewatch"])?;

    for row in rows {
        let year = row.year.map(|y| y.to_string()).unwrap_or_default();
        let tmdb = row.tmdb_id.map(|t| t.to_string()).unwrap_or_default();
        let rating = row.rating10.map(|r| r.to_string()).unwrap_or_default();
        writer.write_record([
            escape_title(&row.title),
            year,
            format!("\"{}\"", row.imdb_id),
            tmdb,
            row.watched_date.clone(),
            rating,
            row.rewatch.to_string(),
        ])?;
    }
    writer.flush()?;
    let bytes = writer.into_inner().expect("in-memory csv writer never fails to flush");

    let tmp_path = output_path.with_extension("csv.tmp");
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    fs::rename(&tmp_path, output_path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(output_path, std::fs::Permissions::from_mode(0o644)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn write_json(dir: &Path, name: &str, value: serde_json::Value) {
        fs::write(dir.join(name), serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();
    }

    fn movie(title: &str, year: i32, trakt: i64, imdb: &str, tmdb: i64) -> serde_json::Value {
        json!({
            "title": title,
            "year": year,
            "ids": {"trakt": trakt, "imdb": imdb, "tmdb": tmdb},
        })
    }

    #[tokio::test]
    async fn aggregated_keeps_latest_watched_at_and_flags_rewatch() {
        let dir = tempfile::tempdir().unwrap();
        let cars = movie("Cars", 2006, 1, "tt0317219", 920);
        write_json(
            dir.path(),
            "me-history_movies.json",
            json!([
                {"watched_at": "2024-12-01T00:00:00.000Z", "movie": cars},
                {"watched_at": "2025-01-15T00:00:00.000Z", "movie": cars},
                {"watched_at": "2025-07-10T00:00:00.000Z", "movie": cars},
            ]),
        )
        .await;
        write_json(
            dir.path(),
            "me-watched_movies.json",
            json!([{"plays": 3, "last_watched_at": "2025-07-10T00:00:00.000Z", "movie": cars}]),
        )
        .await;
        write_json(
            dir.path(),
            "me-ratings_movies.json",
            json!([{"rating": 7, "movie": cars}]),
        )
        .await;

        let result = transform(dir.path(), "me", HistoryMode::Aggregated).await.unwrap();
        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert_eq!(row.imdb_id, "tt0317219");
        assert_eq!(row.watched_date, "2025-07-10");
        assert_eq!(row.rating10, Some(7));
        assert!(row.rewatch);
    }

    #[tokio::test]
    async fn individual_marks_only_earliest_event_as_not_rewatch() {
        let dir = tempfile::tempdir().unwrap();
        let cars = movie("Cars", 2006, 1, "tt0317219", 920);
        write_json(
            dir.path(),
            "me-history_movies.json",
            json!([
                {"watched_at": "2025-07-10T00:00:00.000Z", "movie": cars},
                {"watched_at": "2025-01-15T00:00:00.000Z", "movie": cars},
                {"watched_at": "2024-12-01T00:00:00.000Z", "movie": cars},
            ]),
        )
        .await;

        let result = transform(dir.path(), "me", HistoryMode::Individual).await.unwrap();
        assert_eq!(result.rows.len(), 3);
        assert_eq!(
            result.rows.iter().map(|r| r.watched_date.clone()).collect::<Vec<_>>(),
            vec!["2025-07-10", "2025-01-15", "2024-12-01"]
        );
        assert_eq!(
            result.rows.iter().map(|r| r.rewatch).collect::<Vec<_>>(),
            vec![true, true, false]
        );
    }

    #[tokio::test]
    async fn supplementation_skips_movies_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let cars = movie("Cars", 2006, 1, "tt0317219", 920);
        let coco = movie("Coco", 2017, 2, "tt2380307", 354912);
        write_json(
            dir.path(),
            "me-history_movies.json",
            json!([{"watched_at": "2025-01-01T00:00:00.000Z", "movie": cars}]),
        )
        .await;
        write_json(
            dir.path(),
            "me-watched_movies.json",
            json!([
                {"plays": 1, "last_watched_at": "2025-01-01T00:00:00.000Z", "movie": cars},
                {"plays": 1, "last_watched_at": "2025-02-02T00:00:00.000Z", "movie": coco},
            ]),
        )
        .await;

        let result = transform(dir.path(), "me", HistoryMode::Aggregated).await.unwrap();
        assert_eq!(result.rows.len(), 2);
        assert!(result.rows.iter().any(|r| r.imdb_id == "tt2380307"));
    }

    #[tokio::test]
    async fn missing_imdb_id_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let no_imdb = json!({"title": "Unknown", "year": 2020, "ids": {"trakt": 9, "imdb": null, "tmdb": null}});
        write_json(
            dir.path(),
            "me-history_movies.json",
            json!([{"watched_at": "2025-01-01T00:00:00.000Z", "movie": no_imdb}]),
        )
        .await;

        let result = transform(dir.path(), "me", HistoryMode::Aggregated).await.unwrap();
        assert_eq!(result.rows.len(), 0);
        assert_eq!(result.skipped_count, 1);
    }

    #[tokio::test]
    async fn falls_back_to_watched_only_when_history_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cars = movie("Cars", 2006, 1, "tt0317219", 920);
        write_json(
            dir.path(),
            "me-watched_movies.json",
            json!([{"plays": 2, "last_watched_at": "2025-01-01T00:00:00.000Z", "movie": cars}]),
        )
        .await;

        let result = transform(dir.path(), "me", HistoryMode::Aggregated).await.unwrap();
        assert!(result.used_watched_only_fallback);
        assert_eq!(result.rows.len(), 1);
        assert!(result.rows[0].rewatch);
    }

    #[tokio::test]
    async fn write_csv_escapes_title_and_quotes_imdb() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![LetterboxdRow {
            title: "Dr. Strange, \"Supreme\"".to_string(),
            year: Some(2016),
            imdb_id: "tt1211837".to_string(),
            tmdb_id: Some(284052),
            watched_date: "2025-01-01".to_string(),
            rating10: Some(9),
            rewatch: false,
        }];
        let out = dir.path().join("watched.csv");
        write_csv(&rows, &out).await.unwrap();
        let content = std::fs::read_to_string(&out).unwrap();
        assert!(content.contains("\"Dr. Strange, \"\"Supreme\"\"\""));
        assert!(content.contains("\"tt1211837\""));
    }
}
