use rusqlite::Connection;

use super::entities::template::Template;
use super::{SqlitePool, StoreError};

/// Breaks a template filter like `cisco_ios_show_ip_arp` into its required
/// terms. Terms of one or two characters are dropped.
pub fn filter_terms(filter: &str) -> Vec<String> {
    filter
        .replace('-', "_")
        .split('_')
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Candidate templates whose identifier contains every required term.
/// Runs on the caller's thread with the caller's own connection; the
/// underlying handle must not be shared across worker threads.
pub fn candidates_blocking(
    conn: &Connection,
    filter: &str,
) -> Result<Vec<Template>, rusqlite::Error> {
    let terms = filter_terms(filter);

    let mut sql = String::from("SELECT * FROM templates WHERE 1=1");
    for _ in &terms {
        sql.push_str(" AND identifier LIKE '%' || ? || '%'");
    }
    sql.push_str(" ORDER BY identifier");

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> =
        terms.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(params.as_slice(), |row| {
        Ok(Template {
            id: row.get("id")?,
            identifier: row.get("identifier")?,
            content: row.get("content")?,
            content_hash: row.get("content_hash")?,
        })
    })?;
    rows.collect()
}

pub async fn candidates(pool: SqlitePool, filter: String) -> Result<Vec<Template>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<Template>, StoreError> {
        let conn = pool.get()?;
        candidates_blocking(&conn, &filter).map_err(Into::into)
    })
    .await?
}

pub async fn list_identifiers(pool: SqlitePool) -> Result<Vec<String>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<String>, StoreError> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT identifier FROM templates ORDER BY identifier")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    })
    .await?
}
