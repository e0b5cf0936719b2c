//! Device context: who is issuing commands and on which business date.
//!
//! Persisted in `local_settings` under the `device` category by the settings
//! screen; resolved once per session. Resolution is the point where the
//! business date gets fixed, so every key derived during the session uses
//! the same date even if the session crosses midnight.

use chrono::{Local, NaiveDate};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db;
use crate::error::{OutboxError, Result};
use crate::idempotency;

const CATEGORY: &str = "device";
const KEY_TENANT_ID: &str = "tenant_id";
const KEY_STORE_ID: &str = "store_id";
const KEY_DEVICE_ID: &str = "device_id";
const KEY_BUSINESS_DATE: &str = "business_date";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Resolved device identity. A value of this type always has a device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContext {
    tenant_id: Option<String>,
    store_id: Option<String>,
    device_id: String,
    business_date: NaiveDate,
}

impl DeviceContext {
    pub fn new(device_id: impl Into<String>, business_date: NaiveDate) -> Result<Self> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(OutboxError::MissingDeviceContext("device_id"));
        }
        idempotency::check_device_id(&device_id)?;
        Ok(Self {
            tenant_id: None,
            store_id: None,
            device_id,
            business_date,
        })
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = non_blank(tenant_id.into());
        self
    }

    pub fn with_store(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = non_blank(store_id.into());
        self
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn store_id(&self) -> Option<&str> {
        self.store_id.as_deref()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn business_date(&self) -> NaiveDate {
        self.business_date
    }
}

/// Raw device settings as the settings screen stores them. Every field is
/// optional; [`resolve`] decides whether they are enough to issue commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub store_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    /// Explicit override; when absent the local calendar date is used.
    #[serde(default)]
    pub business_date: Option<NaiveDate>,
}

/// Read the stored device settings.
pub fn load_settings(conn: &Connection) -> Result<DeviceSettings> {
    let business_date = match db::get_setting(conn, CATEGORY, KEY_BUSINESS_DATE)? {
        Some(raw) => Some(parse_date(&raw)?),
        None => None,
    };
    Ok(DeviceSettings {
        tenant_id: db::get_setting(conn, CATEGORY, KEY_TENANT_ID)?.and_then(non_blank),
        store_id: db::get_setting(conn, CATEGORY, KEY_STORE_ID)?.and_then(non_blank),
        device_id: db::get_setting(conn, CATEGORY, KEY_DEVICE_ID)?.and_then(non_blank),
        business_date,
    })
}

/// Persist device settings. Absent or blank fields are removed.
pub fn save_settings(conn: &Connection, settings: &DeviceSettings) -> Result<()> {
    let date = settings
        .business_date
        .map(|d| d.format(DATE_FORMAT).to_string());
    let fields = [
        (KEY_TENANT_ID, settings.tenant_id.clone()),
        (KEY_STORE_ID, settings.store_id.clone()),
        (KEY_DEVICE_ID, settings.device_id.clone()),
        (KEY_BUSINESS_DATE, date),
    ];
    for (key, value) in fields {
        match value.and_then(non_blank) {
            Some(v) => db::set_setting(conn, CATEGORY, key, &v)?,
            None => db::delete_setting(conn, CATEGORY, key)?,
        }
    }
    info!(
        device_id = settings.device_id.as_deref().unwrap_or("-"),
        "device settings saved"
    );
    Ok(())
}

/// Forget the stored device settings.
pub fn clear_settings(conn: &Connection) -> Result<()> {
    db::delete_all_settings(conn, CATEGORY)
}

/// Resolve the context commands are issued under, fixing the business date
/// to today's local date unless the settings override it.
pub fn resolve(conn: &Connection) -> Result<DeviceContext> {
    resolve_with_today(conn, Local::now().date_naive())
}

fn resolve_with_today(conn: &Connection, today: NaiveDate) -> Result<DeviceContext> {
    let settings = load_settings(conn)?;
    let device_id = settings
        .device_id
        .ok_or(OutboxError::MissingDeviceContext("device_id"))?;
    let business_date = settings.business_date.unwrap_or(today);

    let mut ctx = DeviceContext::new(device_id, business_date)?;
    ctx.tenant_id = settings.tenant_id;
    ctx.store_id = settings.store_id;

    debug!(
        device_id = %ctx.device_id,
        business_date = %ctx.business_date,
        "device context resolved"
    );
    Ok(ctx)
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| {
        OutboxError::InvalidStoredValue {
            field: "device.business_date",
            value: raw.to_string(),
        }
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
