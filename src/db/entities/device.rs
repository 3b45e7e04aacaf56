use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::enums::CredentialTestResult;

/// One row of the `device_details` view (device joined with its lookups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetail {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub primary_ip4: Option<String>,
    pub ssh_port: u16,
    pub credential_id: Option<i64>,
    pub credential_tested_at: Option<DateTime<Utc>>,
    pub credential_test_result: CredentialTestResult,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub site_id: i64,
    pub site_name: String,
    pub site_slug: String,
    pub platform_id: Option<i64>,
    pub platform_name: Option<String>,
    pub platform_slug: Option<String>,
    pub driver_hint: Option<String>,
    pub paging_disable_command: Option<String>,
    pub manufacturer_id: Option<i64>,
    pub manufacturer_name: Option<String>,
    pub role_id: Option<i64>,
    pub role_name: Option<String>,
}

impl DeviceDetail {
    /// Address the collector will actually dial, if the device has one.
    pub fn address(&self) -> Option<&str> {
        self.primary_ip4.as_deref().filter(|a| !a.is_empty())
    }
}
