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

//! Business logic for the service.
//!
//! Operations that touch more than one entry run inside a transaction started by the driver's
//! `TxRunner`.  The repository finds that transaction in the context it receives, so the
//! operations compose plain service calls without passing the transaction around.

use crate::model::*;
use crate::repository::KvRepository;
use basekit_core::db::{Db, DbError, Executor, TxOptions};
use basekit_core::service::RepositoryService;
use basekit_core::tx::{TxError, TxRunner};
use log::warn;
use std::borrow::Cow;
use std::sync::Arc;

mod key;
mod keys;
#[cfg(test)]
mod testutils;

/// Business logic errors.  These errors encompass backend and logical errors.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DriverError {
    /// Indicates that a request to create an entry failed because it already exists.
    #[error("{0}")]
    AlreadyExists(String),

    /// Catch-all error type for unexpected database errors.
    #[error("{0}")]
    BackendError(String),

    /// Indicates that an entry changed since the caller last saw it.
    #[error("{0}")]
    Conflict(String),

    /// Indicates an error in the input data.
    #[error("{0}")]
    InvalidInput(String),

    /// Indicates that a requested entry does not exist.
    #[error("{0}")]
    NotFound(String),
}

impl From<DbError> for DriverError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::AlreadyExists => DriverError::AlreadyExists(e.to_string()),
            DbError::BackendError(_) => DriverError::BackendError(e.to_string()),
            DbError::DataIntegrityError(_) => DriverError::BackendError(e.to_string()),
            DbError::NotFound => DriverError::NotFound(e.to_string()),
            DbError::TxInUse => DriverError::BackendError(e.to_string()),
            DbError::Unavailable => DriverError::BackendError(e.to_string()),
        }
    }
}

impl From<TxError<DriverError>> for DriverError {
    fn from(e: TxError<DriverError>) -> Self {
        match e {
            TxError::UnitOfWork(e) => e,
            TxError::Start(e) | TxError::Commit(e) => DriverError::from(e),
            e @ (TxError::AlreadyActive(_) | TxError::Execution(_)) => {
                DriverError::BackendError(e.to_string())
            }
        }
    }
}

/// Result type for this module.
pub type DriverResult<T> = Result<T, DriverError>;

/// Business logic.
///
/// The public operations exposed by the driver are all "one shot": they start and commit a
/// transaction, so it's incorrect for the caller to use two separate calls.  For this reason,
/// these operations consume the driver in an attempt to minimize the possibility of executing
/// two operations.
pub struct Driver<D> {
    /// The database that the driver uses for persistence.
    db: Arc<D>,

    /// Access to the stored entries.
    entries: RepositoryService<Entry, Key, KvRepository<D>>,

    /// Runner for the operations that need a transaction.
    runner: TxRunner,
}

impl<D> Clone for Driver<D> {
    fn clone(&self) -> Self {
        Self { db: self.db.clone(), entries: self.entries.clone(), runner: self.runner.clone() }
    }
}

impl<D> Driver<D>
where
    D: Db<Executor = Executor> + 'static,
{
    /// Creates a new driver backed by the given injected components.
    pub fn new(db: Arc<D>) -> Self {
        let runner = TxRunner::default()
            .with_hook(|_ctx, message| warn!("Transaction did not complete: {}", message));
        Self::with_runner(db, runner)
    }

    /// Creates a new driver whose repository joins the transactions started by `runner`.
    fn with_runner(db: Arc<D>, runner: TxRunner) -> Self {
        let repository = KvRepository::new(db.clone()).with_tx_key(runner.key().to_owned());
        let entries = RepositoryService::new(Arc::new(repository));
        Self { db, entries, runner }
    }

    /// Stores the transactions of this driver in the context under `key`.
    pub fn with_tx_key(self, key: impl Into<Cow<'static, str>>) -> Self {
        let runner = self.runner.with_key(key);
        Self::with_runner(self.db, runner)
    }

    /// Begins the transactions of this driver with `opts`.
    pub fn with_tx_options(mut self, opts: TxOptions) -> Self {
        self.runner = self.runner.with_options(opts);
        self
    }
}
