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

//! Operations on one key.

use crate::driver::{Driver, DriverError, DriverResult};
use crate::model::*;
use crate::repository::KvRepository;
use basekit_core::context::Context;
use basekit_core::db::{Db, Executor};
use basekit_core::service::{Fields, RepositoryService};
use serde_json::json;

/// Replaces the value of the `current` entry with `value` and bumps its version, as long as the
/// stored entry is still at the version of `current`.
async fn replace_entry<D>(
    entries: &RepositoryService<Entry, Key, KvRepository<D>>,
    ctx: &Context,
    current: &Entry,
    value: String,
) -> DriverResult<Entry>
where
    D: Db<Executor = Executor> + 'static,
{
    let version = current.version().next();
    let mut fields = Fields::new();
    fields.insert("key".to_owned(), json!(current.key().to_string()));
    fields.insert("value".to_owned(), json!(value));
    fields.insert("version".to_owned(), json!(version.as_u32()));
    fields.insert("expected_version".to_owned(), json!(current.version().as_u32()));
    if entries.patch(ctx, &fields).await? == 0 {
        return Err(DriverError::Conflict(format!(
            "Key '{}' changed while updating it from version {}",
            current.key(),
            current.version()
        )));
    }
    Ok(Entry::new(current.key().clone(), value, version))
}

impl<D> Driver<D>
where
    D: Db<Executor = Executor> + 'static,
{
    /// Deletes an existing `key`.
    pub async fn delete_key(self, ctx: &Context, key: &Key) -> DriverResult<()> {
        if self.entries.delete(ctx, key).await? == 0 {
            return Err(DriverError::NotFound(format!("Key '{}' not found", key)));
        }
        Ok(())
    }

    /// Gets the current value of the given `key`.
    pub async fn get_key(self, ctx: &Context, key: &Key) -> DriverResult<Entry> {
        match self.entries.load(ctx, key).await? {
            Some(entry) => Ok(entry),
            None => Err(DriverError::NotFound(format!("Key '{}' not found", key))),
        }
    }

    /// Sets `key` to `value`, incrementing its version.
    ///
    /// Fails with a conflict if the entry changes between reading and writing it.
    pub async fn set_key(self, ctx: &Context, key: &Key, value: String) -> DriverResult<Entry> {
        let entries = &self.entries;
        let entry = self
            .runner
            .run_and_return(ctx, self.db.as_ref(), |ctx| async move {
                match entries.load(&ctx, key).await? {
                    Some(old) => replace_entry(entries, &ctx, &old, value).await,
                    None => {
                        let entry = Entry::new(key.clone(), value, Version::initial());
                        if entries.create(&ctx, &entry).await? == 0 {
                            return Err(DriverError::AlreadyExists(format!(
                                "Key '{}' already exists",
                                key
                            )));
                        }
                        Ok::<Entry, DriverError>(entry)
                    }
                }
            })
            .await?;
        Ok(entry)
    }

    /// Sets `key` to `value` only if its current version is `expected`, incrementing its version.
    pub async fn compare_and_set(
        self,
        ctx: &Context,
        key: &Key,
        expected: Version,
        value: String,
    ) -> DriverResult<Entry> {
        let entries = &self.entries;
        let entry = self
            .runner
            .run_and_return(ctx, self.db.as_ref(), |ctx| async move {
                let current = match entries.load(&ctx, key).await? {
                    Some(entry) => entry,
                    None => return Err(DriverError::NotFound(format!("Key '{}' not found", key))),
                };
                if *current.version() != expected {
                    return Err(DriverError::Conflict(format!(
                        "Key '{}' is at version {} but expected {}",
                        key,
                        current.version(),
                        expected
                    )));
                }

                replace_entry(entries, &ctx, &current, value).await
            })
            .await?;
        Ok(entry)
    }

    /// Moves the content of `from` to the new key `to`, preserving its version.
    pub async fn rename_key(self, ctx: &Context, from: &Key, to: &Key) -> DriverResult<Entry> {
        let entries = &self.entries;
        let entry = self
            .runner
            .run_and_return(ctx, self.db.as_ref(), |ctx| async move {
                let old = match entries.load(&ctx, from).await? {
                    Some(entry) => entry,
                    None => return Err(DriverError::NotFound(format!("Key '{}' not found", from))),
                };
                entries.delete(&ctx, from).await?;

                let entry = Entry::new(to.clone(), old.value().clone(), *old.version());
                if entries.create(&ctx, &entry).await? == 0 {
                    return Err(DriverError::AlreadyExists(format!(
                        "Key '{}' already exists",
                        to
                    )));
                }
                Ok::<Entry, DriverError>(entry)
            })
            .await?;
        Ok(entry)
    }
}
