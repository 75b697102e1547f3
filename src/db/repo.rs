use super::model::SeenKey;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Whether `key` has been surfaced before. A hit refreshes the key's recency.
#[instrument(skip(pool))]
pub async fn is_seen(pool: &Pool, key: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE seen_keys
         SET last_seen_at = strftime('%Y-%m-%dT%H:%M:%f', 'now'),
             touch_seq = (SELECT COALESCE(MAX(touch_seq), 0) + 1 FROM seen_keys)
         WHERE key = ?",
    )
    .bind(key)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Record `key` as surfaced. Returns true when the key was not present before.
#[instrument(skip(pool))]
pub async fn mark_seen(pool: &Pool, key: &str) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO seen_keys (key, touch_seq)
         VALUES (?, (SELECT COALESCE(MAX(touch_seq), 0) + 1 FROM seen_keys))",
    )
    .bind(key)
    .execute(pool)
    .await?
    .rows_affected()
        > 0;
    if !inserted {
        is_seen(pool, key).await?;
    }
    Ok(inserted)
}

pub async fn get_seen_key(pool: &Pool, key: &str) -> Result<Option<SeenKey>> {
    let row = sqlx::query_as::<_, SeenKey>(
        "SELECT key, first_seen_at, last_seen_at, touch_seq FROM seen_keys WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn count_seen_keys(pool: &Pool) -> Result<i64> {
    let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM seen_keys")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Keep the `max_keys` most recently touched keys, delete the rest.
#[instrument(skip(pool))]
pub async fn prune_seen_keys(pool: &Pool, max_keys: usize) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM seen_keys WHERE key IN (
             SELECT key FROM seen_keys ORDER BY touch_seq DESC LIMIT -1 OFFSET ?
         )",
    )
    .bind(i64::try_from(max_keys).unwrap_or(i64::MAX))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}
