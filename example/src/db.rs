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

//! Database abstraction in terms of the operations needed by the service.
//!
//! Every operation takes an `Executor` so that it can run either directly against the database
//! or inside a transaction, and dispatches to the backend-specific implementation.

use crate::model::*;
use basekit_core::db::{DbError, DbResult, Executor};
use basekit_core::paging::Page;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

/// Converts a count of affected rows as reported by the database into the signed counts that
/// repositories return.
fn affected(rows: u64) -> DbResult<i64> {
    i64::try_from(rows)
        .map_err(|e| DbError::DataIntegrityError(format!("Too many affected rows: {}", e)))
}

/// Initializes the database schema.
pub async fn init_schema(ex: &mut Executor) -> DbResult<()> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::init_schema(ex).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::init_schema(ex).await,
    }
}

/// Gets the entry stored under `key`, if any.
pub(crate) async fn get_entry(ex: &mut Executor, key: &Key) -> DbResult<Option<Entry>> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::get_entry(ex, key).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::get_entry(ex, key).await,
    }
}

/// Inserts `entry` unless its key already exists.  Returns the number of inserted rows.
pub(crate) async fn insert_entry(ex: &mut Executor, entry: &Entry) -> DbResult<i64> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::insert_entry(ex, entry).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::insert_entry(ex, entry).await,
    }
}

/// Replaces the value and version of an existing entry.  Returns the number of updated rows.
pub(crate) async fn update_entry(ex: &mut Executor, entry: &Entry) -> DbResult<i64> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::update_entry(ex, entry).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::update_entry(ex, entry).await,
    }
}

/// Updates the `value` and/or the `version` of the entry stored under `key`, leaving the
/// fields given as `None` untouched.  Returns the number of updated rows.
///
/// If `expected` is set, the entry is only updated while it is still at that version.
pub(crate) async fn patch_entry(
    ex: &mut Executor,
    key: &Key,
    value: Option<&str>,
    version: Option<Version>,
    expected: Option<Version>,
) -> DbResult<i64> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::patch_entry(ex, key, value, version, expected).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::patch_entry(ex, key, value, version, expected).await,
    }
}

/// Deletes the entry stored under `key`.  Returns the number of deleted rows.
pub(crate) async fn delete_entry(ex: &mut Executor, key: &Key) -> DbResult<i64> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::delete_entry(ex, key).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::delete_entry(ex, key).await,
    }
}

/// Gets at most `limit` entries whose key starts with `prefix`, in key order, after skipping
/// `offset` of them.  The returned total counts all matching entries.
pub(crate) async fn search_entries(
    ex: &mut Executor,
    prefix: &str,
    limit: i64,
    offset: i64,
) -> DbResult<Page<Entry>> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::search_entries(ex, prefix, limit, offset).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::search_entries(ex, prefix, limit, offset).await,
    }
}
