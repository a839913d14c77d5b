use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};

use crate::db::{
    helpers::{decode_optional_json, encode_json, format_datetime},
    Database,
};
use crate::models::{ApplicationToken, CategoryToken};
use crate::platform::ShieldConfig;

pub(crate) fn write_applications(
    conn: &Connection,
    applications: Option<&BTreeSet<ApplicationToken>>,
) -> Result<()> {
    let encoded = applications
        .map(|tokens| encode_json(tokens, "shield applications"))
        .transpose()?;
    conn.execute(
        "UPDATE shield_state SET applications = ?1, updated_at = ?2 WHERE id = 1",
        params![encoded, format_datetime(Utc::now())],
    )
    .context("failed to write application shield")?;
    Ok(())
}

pub(crate) fn write_categories(
    conn: &Connection,
    categories: Option<&BTreeSet<CategoryToken>>,
) -> Result<()> {
    let encoded = categories
        .map(|tokens| encode_json(tokens, "shield categories"))
        .transpose()?;
    conn.execute(
        "UPDATE shield_state SET categories = ?1, updated_at = ?2 WHERE id = 1",
        params![encoded, format_datetime(Utc::now())],
    )
    .context("failed to write category shield")?;
    Ok(())
}

pub(crate) fn read_shield(conn: &Connection) -> Result<ShieldConfig> {
    let (applications, categories): (Option<String>, Option<String>) = conn
        .query_row(
            "SELECT applications, categories FROM shield_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("failed to read shield state")?;

    Ok(ShieldConfig {
        applications: decode_optional_json(applications, "shield applications")?,
        categories: decode_optional_json(categories, "shield categories")?,
    })
}

impl Database {
    pub async fn shield_config(&self) -> Result<ShieldConfig> {
        self.execute(|conn| read_shield(conn)).await
    }
}
