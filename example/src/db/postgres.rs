// BaseKit
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Implementation of the database abstraction using PostgreSQL.

use crate::db::affected;
use crate::model::*;
use basekit_core::db::DbResult;
use basekit_core::db::postgres::{PostgresExecutor, map_sqlx_error, run_schema};
use basekit_core::paging::Page;
use futures::TryStreamExt;
use sqlx::Row;
use sqlx::postgres::PgRow;

/// Schema to use to initialize the production database.
const SCHEMA: &str = include_str!("postgres.sql");

/// Converts a `row` with the `key`, `value` and `version` columns into an entry.
fn entry_from_row(row: &PgRow) -> DbResult<Entry> {
    let key: String = row.try_get("key").map_err(map_sqlx_error)?;
    let value: String = row.try_get("value").map_err(map_sqlx_error)?;
    let version: i32 = row.try_get("version").map_err(map_sqlx_error)?;
    Ok(Entry::new(Key::new(key), value, Version::from_i32(version)?))
}

pub(super) async fn init_schema(ex: &mut PostgresExecutor) -> DbResult<()> {
    run_schema(ex, SCHEMA).await
}

pub(super) async fn get_entry(ex: &mut PostgresExecutor, key: &Key) -> DbResult<Option<Entry>> {
    let query_str = "SELECT key, value, version FROM store WHERE key = $1";
    let maybe_row = sqlx::query(query_str)
        .bind(key.as_ref())
        .fetch_optional(ex.conn())
        .await
        .map_err(map_sqlx_error)?;
    match maybe_row {
        None => Ok(None),
        Some(row) => Ok(Some(entry_from_row(&row)?)),
    }
}

pub(super) async fn insert_entry(ex: &mut PostgresExecutor, entry: &Entry) -> DbResult<i64> {
    let query_str = "
        INSERT INTO store (key, value, version)
        VALUES ($1, $2, $3)
        ON CONFLICT (key) DO NOTHING
    ";
    let done = sqlx::query(query_str)
        .bind(entry.key().as_ref())
        .bind(entry.value())
        .bind(entry.version().as_i32())
        .execute(ex.conn())
        .await
        .map_err(map_sqlx_error)?;
    affected(done.rows_affected())
}

pub(super) async fn update_entry(ex: &mut PostgresExecutor, entry: &Entry) -> DbResult<i64> {
    let query_str = "UPDATE store SET value = $2, version = $3 WHERE key = $1";
    let done = sqlx::query(query_str)
        .bind(entry.key().as_ref())
        .bind(entry.value())
        .bind(entry.version().as_i32())
        .execute(ex.conn())
        .await
        .map_err(map_sqlx_error)?;
    affected(done.rows_affected())
}

pub(super) async fn patch_entry(
    ex: &mut PostgresExecutor,
    key: &Key,
    value: Option<&str>,
    version: Option<Version>,
    expected: Option<Version>,
) -> DbResult<i64> {
    let query_str = "
        UPDATE store
        SET value = COALESCE($2, value), version = COALESCE($3, version)
        WHERE key = $1 AND ($4::INTEGER IS NULL OR version = $4)
    ";
    let done = sqlx::query(query_str)
        .bind(key.as_ref())
        .bind(value)
        .bind(version.map(|v| v.as_i32()))
        .bind(expected.map(|v| v.as_i32()))
        .execute(ex.conn())
        .await
        .map_err(map_sqlx_error)?;
    affected(done.rows_affected())
}

pub(super) async fn delete_entry(ex: &mut PostgresExecutor, key: &Key) -> DbResult<i64> {
    let query_str = "DELETE FROM store WHERE key = $1";
    let done = sqlx::query(query_str)
        .bind(key.as_ref())
        .execute(ex.conn())
        .await
        .map_err(map_sqlx_error)?;
    affected(done.rows_affected())
}

pub(super) async fn search_entries(
    ex: &mut PostgresExecutor,
    prefix: &str,
    limit: i64,
    offset: i64,
) -> DbResult<Page<Entry>> {
    let query_str = "SELECT COUNT(*) AS total FROM store WHERE starts_with(key, $1)";
    let row = sqlx::query(query_str)
        .bind(prefix)
        .fetch_one(ex.conn())
        .await
        .map_err(map_sqlx_error)?;
    let total: i64 = row.try_get("total").map_err(map_sqlx_error)?;

    let query_str = r#"
        SELECT key, value, version FROM store
        WHERE starts_with(key, $1)
        ORDER BY key COLLATE "C"
        LIMIT $2 OFFSET $3
    "#;
    let mut rows = sqlx::query(query_str).bind(prefix).bind(limit).bind(offset).fetch(ex.conn());

    let mut items = vec![];
    while let Some(row) = rows.try_next().await.map_err(map_sqlx_error)? {
        items.push(entry_from_row(&row)?);
    }
    Ok(Page { items, total })
}
