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

//! Repository for key/value entries.

use crate::db;
use crate::model::*;
use async_trait::async_trait;
use basekit_core::context::Context;
use basekit_core::db::{Db, DbError, DbResult, Executor};
use basekit_core::paging::Page;
use basekit_core::service::{Fields, Repository, SearchRepository};
use basekit_core::tx::{DEFAULT_TX_KEY, resolve_executor};
use serde_json::{Number, Value};
use std::borrow::Cow;
use std::sync::Arc;

/// Fields of a patch request for an entry.
#[derive(Debug, PartialEq)]
struct EntryPatch<'a> {
    /// Key of the entry to patch.
    key: Key,

    /// New value, if it changes.
    value: Option<&'a str>,

    /// New version, if it changes.
    version: Option<Version>,

    /// Version the entry must be at for the patch to apply, if any.
    expected_version: Option<Version>,
}

/// Parses a version number given in field `name`.
fn parse_version(name: &str, n: &Number) -> DbResult<Version> {
    let n = n
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| DbError::DataIntegrityError(format!("Invalid {} {}", name, n)))?;
    Version::from_u32(n)
}

/// Extracts the fields of a patch request for an entry.
///
/// The `key` field is required.  `value` and `version` are optional and are left untouched when
/// missing.  `expected_version` makes the patch apply only to an entry at that version.  Any
/// other field is rejected.
fn parse_patch(fields: &Fields) -> DbResult<EntryPatch<'_>> {
    let mut key = None;
    let mut value = None;
    let mut version = None;
    let mut expected_version = None;
    for (name, field) in fields {
        match (name.as_str(), field) {
            ("key", Value::String(s)) => key = Some(Key::new(s.clone())),
            ("value", Value::String(s)) => value = Some(s.as_str()),
            ("version", Value::Number(n)) => version = Some(parse_version("version", n)?),
            ("expected_version", Value::Number(n)) => {
                expected_version = Some(parse_version("expected version", n)?)
            }
            (name, field) => {
                return Err(DbError::DataIntegrityError(format!(
                    "Invalid field '{}' with value {}",
                    name, field
                )));
            }
        }
    }
    match key {
        Some(key) => Ok(EntryPatch { key, value, version, expected_version }),
        None => Err(DbError::DataIntegrityError("Patch requires a 'key' field".to_owned())),
    }
}

/// Stores entries in the database `D`.
///
/// All operations participate in the transaction stored in the context under the repository's
/// transaction key, if any.
pub struct KvRepository<D> {
    /// The database backing the repository.
    db: Arc<D>,

    /// Context key under which to look for an ambient transaction.
    tx_key: Cow<'static, str>,
}

impl<D> KvRepository<D>
where
    D: Db<Executor = Executor>,
{
    /// Creates a new repository backed by `db` that joins transactions stored under the default
    /// transaction key.
    pub fn new(db: Arc<D>) -> Self {
        Self { db, tx_key: Cow::Borrowed(DEFAULT_TX_KEY) }
    }

    /// Makes the repository join transactions stored under `key` instead.
    pub fn with_tx_key(mut self, key: impl Into<Cow<'static, str>>) -> Self {
        self.tx_key = key.into();
        self
    }
}

#[async_trait]
impl<D> Repository<Entry, Key> for KvRepository<D>
where
    D: Db<Executor = Executor> + 'static,
{
    async fn load(&self, ctx: &Context, id: &Key) -> DbResult<Option<Entry>> {
        let mut ex = resolve_executor(ctx, self.db.as_ref(), &self.tx_key).await?;
        db::get_entry(ex.ex(), id).await
    }

    async fn create(&self, ctx: &Context, model: &Entry) -> DbResult<i64> {
        let mut ex = resolve_executor(ctx, self.db.as_ref(), &self.tx_key).await?;
        db::insert_entry(ex.ex(), model).await
    }

    async fn update(&self, ctx: &Context, model: &Entry) -> DbResult<i64> {
        let mut ex = resolve_executor(ctx, self.db.as_ref(), &self.tx_key).await?;
        db::update_entry(ex.ex(), model).await
    }

    async fn patch(&self, ctx: &Context, fields: &Fields) -> DbResult<i64> {
        let patch = parse_patch(fields)?;
        let mut ex = resolve_executor(ctx, self.db.as_ref(), &self.tx_key).await?;
        db::patch_entry(ex.ex(), &patch.key, patch.value, patch.version, patch.expected_version)
            .await
    }

    async fn delete(&self, ctx: &Context, id: &Key) -> DbResult<i64> {
        let mut ex = resolve_executor(ctx, self.db.as_ref(), &self.tx_key).await?;
        db::delete_entry(ex.ex(), id).await
    }
}

#[async_trait]
impl<D> SearchRepository<Entry, Key, KeyFilter> for KvRepository<D>
where
    D: Db<Executor = Executor> + 'static,
{
    async fn search(
        &self,
        ctx: &Context,
        filter: &KeyFilter,
        limit: i64,
        offset: i64,
    ) -> DbResult<Page<Entry>> {
        let mut ex = resolve_executor(ctx, self.db.as_ref(), &self.tx_key).await?;
        db::search_entries(ex.ex(), filter.prefix(), limit, offset).await
    }
}
