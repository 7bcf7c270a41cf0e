use anyhow::{Context, Result};
use reqwest::Client;
use sqlx::{Executor, MySqlPool};

use super::fetch;
use crate::db::ObjectDefinition;
use crate::util::sql::{quote_ident, split_file_name};

/// Object kinds in the order they must be applied per schema.
const OBJECT_TYPES: [&str; 4] = ["trigger", "view", "procedure", "function"];

/// Create a schema from its dumped statement if it does not exist yet.
pub async fn ensure_schema(
    pool: &MySqlPool,
    http: &Client,
    taburl: &str,
    schema: &str,
) -> Result<()> {
    let like = schema.replace('\'', "''");
    let exists = pool
        .fetch_optional(format!("show databases like '{like}'").as_str())
        .await?
        .is_some();

    if !exists {
        let url = format!("{taburl}{schema}/{schema}.sql");
        let stmt = fetch::fetch_text(http, &url).await?;
        pool.execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create schema {schema}"))?;
    }

    Ok(())
}

fn escape_value(value: &str) -> String {
    value.replace('\'', "''")
}

/// Session variables that must be restored before replaying stored code,
/// each only when the dump recorded a value for it.
pub fn session_setup(def: &ObjectDefinition) -> Vec<String> {
    let mut stmts = Vec::new();

    if let Some(mode) = &def.sql_mode {
        if !mode.is_empty() {
            stmts.push(format!("set session sql_mode = '{}'", escape_value(mode)));
        }
    }
    if !def.charset_client.is_empty() {
        stmts.push(format!(
            "set session character_set_client = '{}'",
            escape_value(&def.charset_client)
        ));
    }
    if !def.collation.is_empty() {
        stmts.push(format!(
            "set session collation_connection = '{}'",
            escape_value(&def.collation)
        ));
    }
    if let Some(collation) = &def.db_collation {
        if !collation.is_empty() {
            stmts.push(format!(
                "set session collation_database = '{}'",
                escape_value(collation)
            ));
        }
    }

    stmts
}

/// Apply every trigger, view, procedure and function for one schema inside
/// a single transaction. Runs only after all table applies have drained.
pub async fn apply_schema_objects(
    pool: &MySqlPool,
    http: &Client,
    taburl: &str,
    schema: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    // Text protocol throughout: `use` cannot be prepared.
    (&mut *tx)
        .execute("set session foreign_key_checks=0")
        .await?;
    (&mut *tx)
        .execute(format!("use {}", quote_ident(schema)).as_str())
        .await?;

    for object_type in OBJECT_TYPES {
        let plural = format!("{object_type}s");
        let dir_url = format!("{taburl}{schema}/{plural}");
        let objects = fetch::fetch_listing(http, &dir_url).await?;
        println!("Applying {plural} for {schema}");

        for object in objects {
            let (name, _) = split_file_name(&object);

            (&mut *tx)
                .execute(format!("drop {object_type} if exists {}", quote_ident(name)).as_str())
                .await?;

            let body = fetch::fetch_text(http, &format!("{dir_url}/{object}")).await?;
            let def: ObjectDefinition = serde_json::from_str(&body)
                .with_context(|| format!("invalid definition for {object_type} {schema}.{name}"))?;

            for stmt in session_setup(&def) {
                (&mut *tx).execute(stmt.as_str()).await?;
            }

            (&mut *tx)
                .execute(def.create.as_str())
                .await
                .with_context(|| format!("failed to create {object_type} {schema}.{name}"))?;
        }
    }

    tx.commit().await?;
    Ok(())
}
