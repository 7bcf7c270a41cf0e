use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use sqlx::{Executor, MySqlPool, Row};

use crate::db::{Credentials, ObjectDefinition};
use crate::util::sql::quote_ident;

/// Schemas that belong to the server itself and are never dumped.
const INTERNAL_SCHEMAS: [&str; 3] = ["mysql", "information_schema", "performance_schema"];

/// Dump create statements for every schema into a timestamped directory
/// tree that server mode can serve as-is.
pub async fn run(dir: &Path, creds: Credentials) -> Result<()> {
    let pool = creds.connect().await?;

    let dumpdir = dir.join(dump_dirname(&creds.host, Local::now()));
    println!("Dumping to: {}", dumpdir.display());
    println!();

    std::fs::create_dir_all(&dumpdir)
        .with_context(|| format!("could not create {}", dumpdir.display()))?;

    let schemas = schema_list(&pool).await?;

    let mut total = 0usize;
    println!();
    for schema in &schemas {
        total += 1;
        print!("{schema}: ");
        std::io::stdout().flush()?;

        dump_schema(&pool, &dumpdir, schema).await?;

        let count = dump_tables(&pool, &dumpdir, schema).await?;
        total += count;
        print!("{count} tables, ");

        let count = dump_routines(&pool, &dumpdir, schema, "procedure").await?;
        total += count;
        print!("{count} procedures, ");

        let count = dump_routines(&pool, &dumpdir, schema, "function").await?;
        total += count;
        print!("{count} functions, ");

        let count = dump_triggers(&pool, &dumpdir, schema).await?;
        total += count;
        print!("{count} triggers, ");

        let count = dump_views(&pool, &dumpdir, schema).await?;
        total += count;
        println!("{count} views");
    }

    println!();
    println!("{total} total objects dumped");

    Ok(())
}

/// Directory name for a dump taken now, second precision.
pub fn dump_dirname(host: &str, now: DateTime<Local>) -> String {
    format!("{host}_dump{}", now.format("%Y%m%d%H%M%S"))
}

pub fn is_internal_schema(schema: &str) -> bool {
    INTERNAL_SCHEMAS.contains(&schema)
}

/// Schemas to dump, with the server's own schemas omitted.
async fn schema_list(pool: &MySqlPool) -> Result<Vec<String>> {
    let rows = pool.fetch_all("show databases").await?;

    let mut schemas = Vec::new();
    for row in rows {
        let schema: String = row.try_get(0)?;
        if !is_internal_schema(&schema) {
            schemas.push(schema);
        }
    }
    Ok(schemas)
}

/// Write the schema creation statement to `{schema}/{schema}.sql`.
async fn dump_schema(pool: &MySqlPool, dumpdir: &Path, schema: &str) -> Result<()> {
    let dir = dumpdir.join(schema);
    std::fs::create_dir(&dir)?;

    let row = pool
        .fetch_one(format!("show create schema {}", quote_ident(schema)).as_str())
        .await?;
    let stmt: String = row.try_get(1)?;

    write_statement(&dir.join(format!("{schema}.sql")), &stmt)
}

/// Write every base table's creation statement under `{schema}/tables/`.
async fn dump_tables(pool: &MySqlPool, dumpdir: &Path, schema: &str) -> Result<usize> {
    let dir = dumpdir.join(schema).join("tables");
    std::fs::create_dir(&dir)?;

    let rows = pool
        .fetch_all(
            format!(
                "select table_name from information_schema.tables \
                 where table_schema='{}' and table_type = 'BASE TABLE'",
                escape(schema)
            )
            .as_str(),
        )
        .await?;

    let mut count = 0;
    for row in rows {
        let table: String = row.try_get(0)?;
        let create = pool
            .fetch_one(
                format!(
                    "show create table {}.{}",
                    quote_ident(schema),
                    quote_ident(&table)
                )
                .as_str(),
            )
            .await?;
        let stmt: String = create.try_get(1)?;

        write_statement(&dir.join(format!("{table}.sql")), &stmt)?;
        count += 1;
    }

    Ok(count)
}

/// Write procedure or function definitions as JSON under the matching
/// subdirectory.
async fn dump_routines(
    pool: &MySqlPool,
    dumpdir: &Path,
    schema: &str,
    routine_type: &str,
) -> Result<usize> {
    let dir = dumpdir.join(schema).join(format!("{routine_type}s"));
    std::fs::create_dir(&dir)?;

    let rows = pool
        .fetch_all(
            format!(
                "select routine_name from information_schema.routines \
                 where routine_schema='{}' and routine_type = '{}'",
                escape(schema),
                routine_type.to_uppercase()
            )
            .as_str(),
        )
        .await?;

    let mut count = 0;
    for row in rows {
        let name: String = row.try_get(0)?;
        let create = pool
            .fetch_one(
                format!(
                    "show create {routine_type} {}.{}",
                    quote_ident(schema),
                    quote_ident(&name)
                )
                .as_str(),
            )
            .await?;

        let def = ObjectDefinition {
            name: create.try_get(0)?,
            sql_mode: Some(create.try_get(1)?),
            create: create.try_get(2)?,
            charset_client: create.try_get(3)?,
            collation: create.try_get(4)?,
            db_collation: Some(create.try_get(5)?),
        };

        write_definition(&dir.join(format!("{name}.sql")), &def)?;
        count += 1;
    }

    Ok(count)
}

/// Write trigger definitions as JSON under `{schema}/triggers/`.
async fn dump_triggers(pool: &MySqlPool, dumpdir: &Path, schema: &str) -> Result<usize> {
    let dir = dumpdir.join(schema).join("triggers");
    std::fs::create_dir(&dir)?;

    let rows = pool
        .fetch_all(
            format!(
                "select trigger_name from information_schema.triggers \
                 where trigger_schema='{}'",
                escape(schema)
            )
            .as_str(),
        )
        .await?;

    let mut count = 0;
    for row in rows {
        let name: String = row.try_get(0)?;
        let create = pool
            .fetch_one(
                format!(
                    "show create trigger {}.{}",
                    quote_ident(schema),
                    quote_ident(&name)
                )
                .as_str(),
            )
            .await?;

        let def = ObjectDefinition {
            name: create.try_get(0)?,
            sql_mode: Some(create.try_get(1)?),
            create: create.try_get(2)?,
            charset_client: create.try_get(3)?,
            collation: create.try_get(4)?,
            db_collation: Some(create.try_get(5)?),
        };

        write_definition(&dir.join(format!("{name}.sql")), &def)?;
        count += 1;
    }

    Ok(count)
}

/// Write view definitions as JSON under `{schema}/views/`. Views carry no
/// sql_mode or database collation.
async fn dump_views(pool: &MySqlPool, dumpdir: &Path, schema: &str) -> Result<usize> {
    let dir = dumpdir.join(schema).join("views");
    std::fs::create_dir(&dir)?;

    let rows = pool
        .fetch_all(
            format!(
                "select table_name from information_schema.tables \
                 where table_schema='{}' and table_type = 'VIEW'",
                escape(schema)
            )
            .as_str(),
        )
        .await?;

    let mut count = 0;
    for row in rows {
        let name: String = row.try_get(0)?;
        let create = pool
            .fetch_one(
                format!(
                    "show create view {}.{}",
                    quote_ident(schema),
                    quote_ident(&name)
                )
                .as_str(),
            )
            .await?;

        let def = ObjectDefinition {
            name: create.try_get(0)?,
            sql_mode: None,
            create: create.try_get(1)?,
            charset_client: create.try_get(2)?,
            collation: create.try_get(3)?,
            db_collation: None,
        };

        write_definition(&dir.join(format!("{name}.sql")), &def)?;
        count += 1;
    }

    Ok(count)
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Raw DDL files end in `;\n` so they execute as fetched.
fn write_statement(path: &PathBuf, stmt: &str) -> Result<()> {
    std::fs::write(path, format!("{stmt};\n"))?;
    Ok(())
}

fn write_definition(path: &PathBuf, def: &ObjectDefinition) -> Result<()> {
    let json = serde_json::to_vec_pretty(def)?;
    std::fs::write(path, json)?;
    Ok(())
}
