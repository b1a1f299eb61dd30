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

//! Test utilities for the business layer.

use crate::db;
use crate::driver::Driver;
use crate::model::*;
use basekit_core::db::Db;
use basekit_core::db::sqlite::{self, SqliteDb};
use std::sync::Arc;

/// State of a test that exercises the driver against an in-memory database.
pub(crate) struct TestContext {
    /// The database backing the driver, for direct inspection.
    db: Arc<SqliteDb>,

    /// The driver under test.
    driver: Driver<SqliteDb>,
}

impl TestContext {
    /// Initializes a new database with the schema and a driver on top of it.
    pub(crate) async fn setup() -> Self {
        let db = Arc::new(sqlite::testutils::setup().await);
        db::init_schema(&mut db.ex().await.unwrap()).await.unwrap();
        let driver = Driver::new(db.clone());
        Self { db, driver }
    }

    /// Returns a new copy of the driver for a single operation.
    pub(crate) fn driver(&self) -> Driver<SqliteDb> {
        self.driver.clone()
    }

    /// Stores `value` under `key` with `version` without going through the driver.
    pub(crate) async fn put(&self, key: &Key, value: &str, version: u32) -> Entry {
        let entry = Entry::new(key.clone(), value.to_owned(), Version::from_u32(version).unwrap());
        assert_eq!(1, db::insert_entry(&mut self.db.ex().await.unwrap(), &entry).await.unwrap());
        entry
    }

    /// Overwrites the existing entry with the key of `entry` without going through the driver.
    pub(crate) async fn overwrite(&self, entry: &Entry) {
        assert_eq!(1, db::update_entry(&mut self.db.ex().await.unwrap(), entry).await.unwrap());
    }

    /// Loads the entry stored under `key` without going through the driver.
    pub(crate) async fn get(&self, key: &Key) -> Option<Entry> {
        db::get_entry(&mut self.db.ex().await.unwrap(), key).await.unwrap()
    }
}
