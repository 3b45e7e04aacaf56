use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Row};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use super::entities::device::DeviceDetail;
use super::enums::CredentialTestResult;
use super::{SqlitePool, StoreError};
use crate::db::entities::job::DeviceFilterSpec;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid device name pattern `{pattern}`: {source}")]
    BadNamePattern {
        pattern: String,
        source: regex::Error,
    },
}

impl From<rusqlite::Error> for ResolveError {
    fn from(err: rusqlite::Error) -> Self {
        ResolveError::Store(StoreError::Sqlite(err))
    }
}

fn row_to_device(row: &Row) -> rusqlite::Result<DeviceDetail> {
    let port: i64 = row.get("ssh_port")?;
    Ok(DeviceDetail {
        id: row.get("id")?,
        name: row.get("name")?,
        status: row.get("status")?,
        primary_ip4: row.get("primary_ip4")?,
        ssh_port: port as u16,
        credential_id: row.get("credential_id")?,
        credential_tested_at: row.get("credential_tested_at")?,
        credential_test_result: row.get("credential_test_result")?,
        last_collected_at: row.get("last_collected_at")?,
        site_id: row.get("site_id")?,
        site_name: row.get("site_name")?,
        site_slug: row.get("site_slug")?,
        platform_id: row.get("platform_id")?,
        platform_name: row.get("platform_name")?,
        platform_slug: row.get("platform_slug")?,
        driver_hint: row.get("driver_hint")?,
        paging_disable_command: row.get("paging_disable_command")?,
        manufacturer_id: row.get("manufacturer_id")?,
        manufacturer_name: row.get("manufacturer_name")?,
        role_id: row.get("role_id")?,
        role_name: row.get("role_name")?,
    })
}

/// Resolves a device filter into a deduplicated device list, sorted by
/// (site name, device name). Devices must carry a non-empty primary
/// address and match the status filter (`any` disables it).
pub async fn resolve_devices(
    pool: SqlitePool,
    filter: &DeviceFilterSpec,
    limit: Option<usize>,
) -> Result<Vec<DeviceDetail>, ResolveError> {
    let name_regex = filter
        .name_pattern
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(p).map_err(|source| ResolveError::BadNamePattern {
                pattern: p.to_string(),
                source,
            })
        })
        .transpose()?;

    let filter = filter.clone();
    tokio::task::spawn_blocking(move || -> Result<Vec<DeviceDetail>, ResolveError> {
        let conn = pool.get().map_err(StoreError::from)?;

        let mut sql = String::from(
            "SELECT * FROM device_details \
             WHERE primary_ip4 IS NOT NULL AND primary_ip4 != ''",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if filter.status != "any" {
            sql.push_str(" AND status = ?");
            args.push(Box::new(filter.status.clone()));
        }
        if let Some(site_id) = filter.site_id {
            sql.push_str(" AND site_id = ?");
            args.push(Box::new(site_id));
        }
        if let Some(platform_id) = filter.platform_id {
            sql.push_str(" AND platform_id = ?");
            args.push(Box::new(platform_id));
        }
        if let Some(role_id) = filter.role_id {
            sql.push_str(" AND role_id = ?");
            args.push(Box::new(role_id));
        }
        if let Some(vendor) = filter.vendor.as_deref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND LOWER(manufacturer_name) LIKE '%' || ? || '%'");
            args.push(Box::new(vendor.to_lowercase()));
        }
        sql.push_str(" ORDER BY site_name, name");

        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_device)?;

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for row in rows {
            let device = row?;
            if let Some(regex) = &name_regex {
                if !regex.is_match(&device.name) {
                    continue;
                }
            }
            if !seen.insert(device.id) {
                continue;
            }
            devices.push(device);
            if let Some(cap) = limit {
                if devices.len() >= cap {
                    break;
                }
            }
        }

        debug!(matched = devices.len(), "device filter resolved");
        Ok(devices)
    })
    .await
    .map_err(StoreError::from)?
}

/// Fetches devices by explicit id list, preserving resolver ordering rules.
pub async fn get_devices_by_ids(
    pool: SqlitePool,
    ids: Vec<i64>,
) -> Result<Vec<DeviceDetail>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || -> Result<Vec<DeviceDetail>, StoreError> {
        let conn = pool.get()?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM device_details WHERE id IN ({placeholders}) \
             ORDER BY site_name, name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_device)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    })
    .await?
}

/// Records the outcome of a credential probe against a device. On success
/// the working credential is pinned; on failure only the test stamp moves.
pub async fn record_credential_test(
    pool: SqlitePool,
    device_id: i64,
    credential_id: Option<i64>,
    result: CredentialTestResult,
    tested_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let conn = pool.get()?;
        let updated = match credential_id {
            Some(cred) => conn.execute(
                "UPDATE devices SET credential_id = ?, credential_tested_at = ?, \
                 credential_test_result = ? WHERE id = ?",
                params![cred, tested_at, result, device_id],
            )?,
            None => conn.execute(
                "UPDATE devices SET credential_tested_at = ?, credential_test_result = ? \
                 WHERE id = ?",
                params![tested_at, result, device_id],
            )?,
        };
        if updated == 0 {
            return Err(StoreError::NotFound(format!("device {device_id}")));
        }
        Ok(())
    })
    .await?
}

/// Stamps a device's last successful collection time.
pub async fn touch_last_collected(
    pool: SqlitePool,
    device_id: i64,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let conn = pool.get()?;
        conn.execute(
            "UPDATE devices SET last_collected_at = ? WHERE id = ?",
            params![at, device_id],
        )?;
        Ok(())
    })
    .await?
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::db::testutil::open_test_stores;

    fn base_filter() -> DeviceFilterSpec {
        DeviceFilterSpec::default()
    }

    #[tokio::test]
    async fn resolves_ordered_by_site_then_name() {
        let stores = open_test_stores();
        seed_lookups(&stores.inventory);
        seed_device(&stores.inventory, "den-sw2", 1, 1, "active", Some("10.0.0.2"));
        seed_device(&stores.inventory, "den-sw1", 1, 1, "active", Some("10.0.0.1"));
        seed_device(&stores.inventory, "aus-sw1", 2, 2, "active", Some("10.1.0.1"));

        let devices = resolve_devices(stores.inventory.clone(), &base_filter(), None)
            .await
            .unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        // Austin DC sorts before Denver DC.
        assert_eq!(names, vec!["aus-sw1", "den-sw1", "den-sw2"]);
    }

    #[tokio::test]
    async fn deterministic_for_identical_state() {
        let stores = open_test_stores();
        seed_lookups(&stores.inventory);
        for i in 0..6 {
            seed_device(
                &stores.inventory,
                &format!("sw{i}"),
                1,
                1,
                "active",
                Some("10.0.0.9"),
            );
        }
        let first = resolve_devices(stores.inventory.clone(), &base_filter(), None)
            .await
            .unwrap();
        let second = resolve_devices(stores.inventory.clone(), &base_filter(), None)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn excludes_addressless_and_inactive_devices() {
        let stores = open_test_stores();
        seed_lookups(&stores.inventory);
        seed_device(&stores.inventory, "no-ip", 1, 1, "active", None);
        seed_device(&stores.inventory, "empty-ip", 1, 1, "active", Some(""));
        seed_device(&stores.inventory, "offline", 1, 1, "offline", Some("10.0.0.3"));
        seed_device(&stores.inventory, "ok", 1, 1, "active", Some("10.0.0.4"));

        let devices = resolve_devices(stores.inventory.clone(), &base_filter(), None)
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "ok");

        let mut any = base_filter();
        any.status = "any".into();
        let devices = resolve_devices(stores.inventory.clone(), &any, None)
            .await
            .unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn vendor_substring_is_case_insensitive() {
        let stores = open_test_stores();
        seed_lookups(&stores.inventory);
        seed_device(&stores.inventory, "c1", 1, 1, "active", Some("10.0.0.1"));
        seed_device(&stores.inventory, "a1", 1, 2, "active", Some("10.0.0.2"));

        let mut filter = base_filter();
        filter.vendor = Some("CISC".into());
        let devices = resolve_devices(stores.inventory.clone(), &filter, None)
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "c1");
    }

    #[tokio::test]
    async fn name_pattern_is_a_regex_search() {
        let stores = open_test_stores();
        seed_lookups(&stores.inventory);
        seed_device(&stores.inventory, "core-sw1", 1, 1, "active", Some("10.0.0.1"));
        seed_device(&stores.inventory, "edge-sw1", 1, 1, "active", Some("10.0.0.2"));

        let mut filter = base_filter();
        filter.name_pattern = Some("core-".into());
        let devices = resolve_devices(stores.inventory.clone(), &filter, None)
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);

        // Anchored pattern only matches whole names.
        filter.name_pattern = Some("^sw1$".into());
        let devices = resolve_devices(stores.inventory.clone(), &filter, None)
            .await
            .unwrap();
        assert!(devices.is_empty());

        filter.name_pattern = Some("[".into());
        let err = resolve_devices(stores.inventory.clone(), &filter, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::BadNamePattern { .. }));
    }

    #[tokio::test]
    async fn limit_caps_after_ordering() {
        let stores = open_test_stores();
        seed_lookups(&stores.inventory);
        seed_device(&stores.inventory, "b", 1, 1, "active", Some("10.0.0.1"));
        seed_device(&stores.inventory, "a", 1, 1, "active", Some("10.0.0.2"));
        seed_device(&stores.inventory, "c", 1, 1, "active", Some("10.0.0.3"));

        let devices = resolve_devices(stores.inventory.clone(), &base_filter(), Some(2))
            .await
            .unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn credential_test_writeback() {
        let stores = open_test_stores();
        seed_lookups(&stores.inventory);
        let id = seed_device(&stores.inventory, "sw1", 1, 1, "active", Some("10.0.0.1"));

        let now = Utc::now();
        record_credential_test(
            stores.inventory.clone(),
            id,
            Some(7),
            CredentialTestResult::Success,
            now,
        )
        .await
        .unwrap();

        let devices = resolve_devices(stores.inventory.clone(), &base_filter(), None)
            .await
            .unwrap();
        assert_eq!(devices[0].credential_id, Some(7));
        assert_eq!(
            devices[0].credential_test_result,
            CredentialTestResult::Success
        );
        assert!(devices[0].credential_tested_at.is_some());
    }
}
