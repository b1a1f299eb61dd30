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

//! Operations on multiple keys.

use crate::driver::{Driver, DriverError, DriverResult};
use crate::model::*;
use basekit_core::context::Context;
use basekit_core::db::{Db, Executor};
use basekit_core::paging::{Page, PageRequest};

impl<D> Driver<D>
where
    D: Db<Executor = Executor> + 'static,
{
    /// Gets the keys that start with `prefix` within the window described by `page`.
    pub async fn get_keys(
        self,
        ctx: &Context,
        prefix: String,
        page: PageRequest,
    ) -> DriverResult<Page<Key>> {
        if page.limit <= 0 {
            return Err(DriverError::InvalidInput("Page limit must be positive".to_owned()));
        }
        if page.offset < 0 {
            return Err(DriverError::InvalidInput("Page offset cannot be negative".to_owned()));
        }

        let entries = self.entries.search_page(ctx, &KeyFilter::new(prefix), page).await?;
        Ok(entries.map(|entry| entry.key().clone()))
    }

    /// Deletes all keys that start with `prefix` and returns how many were deleted.
    pub async fn delete_keys(self, ctx: &Context, prefix: String) -> DriverResult<i64> {
        let entries = &self.entries;
        let deleted = self
            .runner
            .run_and_return(ctx, self.db.as_ref(), |ctx| async move {
                let filter = KeyFilter::new(prefix);
                let matches = entries.search(&ctx, &filter, i64::MAX, 0).await?;
                let mut deleted = 0;
                for entry in matches.items {
                    deleted += entries.delete(&ctx, entry.key()).await?;
                }
                if deleted != matches.total {
                    return Err(DriverError::BackendError(format!(
                        "Deleted {} keys but {} matched",
                        deleted, matches.total
                    )));
                }
                Ok::<i64, DriverError>(deleted)
            })
            .await?;
        Ok(deleted)
    }
}
