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

//! Sample key/value store built on the BaseKit transaction runner and repository services.
//!
//! The layers are:
//!
//! 1.  `model`: The entities stored by the service.
//!
//! 1.  `db`: Backend-specific SQL for each operation, dispatched on the `Executor` in use.
//!
//! 1.  `repository`: The `Repository` adapter for entries, which joins the ambient transaction
//!     of the context it receives.
//!
//! 1.  `driver`: The business logic, which composes repository calls inside transactions.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod db;
pub mod driver;
pub mod model;
pub mod repository;

/// Connects to the PostgreSQL database configured in the environment and returns a driver for it.
///
/// The connection settings come from the `<prefix>_HOST`, `<prefix>_PORT`, `<prefix>_DATABASE`,
/// `<prefix>_USERNAME` and `<prefix>_PASSWORD` variables, and the transaction settings from the
/// optional `<prefix>_ISOLATION` and `<prefix>_READ_ONLY` variables.
#[cfg(feature = "postgres")]
pub async fn connect_from_env(
    prefix: &str,
) -> Result<driver::Driver<basekit_core::db::postgres::PostgresDb>, String> {
    use basekit_core::db::postgres::{PostgresDb, PostgresOptions};
    use basekit_core::db::{Db, TxOptions};
    use std::sync::Arc;

    let db_opts = PostgresOptions::from_env(prefix)?;
    let tx_opts = TxOptions::from_env(prefix)?;

    let db = PostgresDb::connect(db_opts).map_err(|e| e.to_string())?;
    db::init_schema(&mut db.ex().await.map_err(|e| e.to_string())?)
        .await
        .map_err(|e| e.to_string())?;
    Ok(driver::Driver::new(Arc::new(db)).with_tx_options(tx_opts))
}
