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

//! Pagination of search results.

use serde::{Deserialize, Serialize};

/// Window of results to return from a search.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PageRequest {
    /// Maximum number of items to return.
    pub limit: i64,

    /// Number of items to skip before the first returned one.
    pub offset: i64,
}

impl PageRequest {
    /// Creates a window of at most `limit` items after skipping `offset` items.
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Creates the window for the 1-based `page` of `size` items.  Page 0 is treated as page 1.
    ///
    /// Offsets that do not fit in an `i64` saturate to `i64::MAX`, which selects no rows.
    pub fn from_page(page: u32, size: u32) -> Self {
        let page = i64::from(page.max(1));
        let size = i64::from(size);
        let offset = (page - 1).checked_mul(size).unwrap_or(i64::MAX);
        Self { limit: size, offset }
    }
}

/// One page of search results.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Page<T> {
    /// The items in this page.
    pub items: Vec<T>,

    /// Total number of items that matched the search, ignoring the requested window.
    pub total: i64,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self { items: vec![], total: 0 }
    }
}

impl<T> Page<T> {
    /// Converts the items in this page with `f`, keeping the total.
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Page<U> {
        Page { items: self.items.into_iter().map(f).collect(), total: self.total }
    }
}
