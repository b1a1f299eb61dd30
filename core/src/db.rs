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

//! Generic abstraction to access different database systems.
//!
//! The facilities in this module provide an abstraction over different database systems such as
//! PostgreSQL and SQLite.  The PostgreSQL backend is for production use and the SQLite backend is
//! primarily intended to support unit tests.  An in-memory `MockDb` is also available for tests
//! that only care about the lifecycle of transactions.

use crate::env::get_optional_var;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

#[cfg(any(test, feature = "testutils"))]
pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Database errors.  Any unexpected errors that come from the database are classified as
/// `BackendError`, but errors we know about have more specific types.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DbError {
    /// Indicates that a request to create an entry failed because it already exists.
    #[error("Already exists")]
    AlreadyExists,

    /// Catch-all error type for unexpected database errors.
    #[error("Database error: {0}")]
    BackendError(String),

    /// Indicates a failure processing the data that already exists in the database.
    #[error("Data integrity error: {0}")]
    DataIntegrityError(String),

    /// Indicates that a requested entry does not exist.
    #[error("Entity not found")]
    NotFound,

    /// Indicates that an open transaction was accessed by two callers at once.  Transactions
    /// cannot be shared across concurrent tasks.
    #[error("Transaction is already in use by another task")]
    TxInUse,

    /// Indicates that the database is not available (maybe because of too many active concurrent
    /// connections).
    #[error("Unavailable")]
    Unavailable,
}

/// Result type for this module.
pub type DbResult<T> = Result<T, DbError>;

/// Isolation levels that can be requested when beginning a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsolationLevel {
    /// Allows dirty reads.
    ReadUncommitted,

    /// Only sees data committed before each statement began.
    ReadCommitted,

    /// Only sees data committed before the transaction began.
    RepeatableRead,

    /// Behaves as if transactions ran one after the other.
    Serializable,
}

impl IsolationLevel {
    /// Returns the SQL fragment that names this isolation level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read-uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read-committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("Unknown isolation level '{}'", s)),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Options to apply when beginning a transaction.
///
/// The default options leave every setting up to the database.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxOptions {
    /// Isolation level to request, or `None` to use the database's default.
    pub isolation: Option<IsolationLevel>,

    /// Whether the transaction is restricted to reads.
    pub read_only: bool,
}

impl TxOptions {
    /// Initializes a set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use the optional variables `<prefix>_ISOLATION` and `<prefix>_READ_ONLY`.
    pub fn from_env(prefix: &str) -> Result<TxOptions, String> {
        Ok(TxOptions {
            isolation: get_optional_var::<IsolationLevel>(prefix, "ISOLATION")?,
            read_only: get_optional_var::<bool>(prefix, "READ_ONLY")?.unwrap_or(false),
        })
    }

    /// Sets the isolation level to request.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Restricts the transaction to reads.
    pub fn with_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Returns the `SET TRANSACTION` statement that applies these options, if any.
    pub fn to_sql(&self) -> Option<String> {
        let mut clauses = vec![];
        if let Some(isolation) = self.isolation {
            clauses.push(format!("ISOLATION LEVEL {}", isolation.as_sql()));
        }
        if self.read_only {
            clauses.push("READ ONLY".to_owned());
        }
        if clauses.is_empty() { None } else { Some(format!("SET TRANSACTION {}", clauses.join(" "))) }
    }
}

/// A database executor that can talk to multiple database implementations.
///
/// This type provides a generic mechanism to access a typed instance of a database, which is needed
/// by sqlx to offer type safety guarantees during query compilation.  Users of this type are forced
/// to destructure it and issue different calls for each database.
///
/// Note that this can wrap an executor that talks directly to a pool or to an open transaction.
#[derive(Debug)]
pub enum Executor {
    /// A PostgreSQL executor that can be used in `sqlx` operations.
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresExecutor),

    /// A SQLite executor that can be used in `sqlx` operations.
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqliteExecutor),
}

/// Operations on an open transaction.
///
/// Dropping a transaction without calling `commit` or `rollback` rolls it back.
#[async_trait]
pub trait BareTx: Send + 'static {
    /// Type of the executor used to issue statements within the transaction.
    type Executor: Send;

    /// Returns the executor wrapped by this transaction.
    ///
    /// This would be better called `executor` but this method is used so frequently that it makes
    /// call sites too verbose.
    fn ex(&mut self) -> &mut Self::Executor;

    /// Commits the transaction.
    async fn commit(self) -> DbResult<()>;

    /// Rolls back the transaction.
    async fn rollback(self) -> DbResult<()>;
}

/// A wrapper for a database executor backed by an open transaction.
#[derive(Debug)]
pub struct TxExecutor(Executor);

#[async_trait]
impl BareTx for TxExecutor {
    type Executor = Executor;

    fn ex(&mut self) -> &mut Executor {
        &mut self.0
    }

    async fn commit(self) -> DbResult<()> {
        match self.0 {
            #[cfg(feature = "postgres")]
            Executor::Postgres(e) => e.commit().await,

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(e) => e.commit().await,
        }
    }

    async fn rollback(self) -> DbResult<()> {
        match self.0 {
            #[cfg(feature = "postgres")]
            Executor::Postgres(e) => e.rollback().await,

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(e) => e.rollback().await,
        }
    }
}

/// Abstraction over the database connection.
#[async_trait]
pub trait Db: Send + Sync {
    /// Type of the executors handed out for direct access to the database.
    type Executor: Send;

    /// Type of the open transactions returned by `begin`.
    type Tx: BareTx<Executor = Self::Executor>;

    /// Obtains an executor for direct access to the pool.
    ///
    /// This would be better called `executor` but this method is used so frequently that it makes
    /// call sites too verbose.
    async fn ex(&self) -> DbResult<Self::Executor>;

    /// Begins a transaction configured with `opts`.
    ///
    /// It is the responsibility of the caller to call `commit` on the returned transaction.
    /// Otherwise the transaction is rolled back on drop.
    async fn begin(&self, opts: &TxOptions) -> DbResult<Self::Tx>;

    /// Closes the connection to the database.
    async fn close(&self);
}

/// Macros to help instantiate tests for multiple database systems.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    pub use paste::paste;

    /// Instantiates the `module::name` test for the database configured by `setup`.
    ///
    /// The `extra` metadata parameter can be used to tag the generated tests.
    #[macro_export]
    macro_rules! generate_one_test [
        ( $name:ident, $setup:expr, $module:path $(, #[$extra:meta] )? ) => {
            #[tokio::test]
            $(#[$extra])?
            async fn $name() {
                $crate::db::testutils::paste! {
                    $module :: [< $name >]($setup).await;
                }
            }
        }
    ];

    pub use generate_one_test;

    /// Instantiates a collection of tests for a specific database system.
    ///
    /// The database implementation to run the tests against is determined by the `setup`
    /// expression, which needs to return a database object.  The returned database should also
    /// have been initialized with the desired schema.
    ///
    /// The `extra` metadata parameter can be used to tag the generated tests.
    #[macro_export]
    macro_rules! generate_tests [
        ( #[$extra:meta], $setup:expr, $module:path $(, $name:ident)+ ) => {
            $(
                $crate::db::testutils::generate_one_test!($name, $setup, $module, #[$extra]);
            )+
        };

        ( $setup:expr, $module:path $(, $name:ident)+ ) => {
            $(
                $crate::db::testutils::generate_one_test!($name, $setup, $module);
            )+
        };
    ];

    pub use generate_tests;
}

#[cfg(all(test, any(feature = "postgres", feature = "sqlite")))]
pub(crate) mod tests {
    use super::*;
    use sqlx::Row;

    /// Runs a `query` on `ex` and does not care about its results.  The `query` must be valid for
    /// all possible database implementations.
    pub(crate) async fn exec(ex: &mut Executor, query: &str) {
        match ex {
            #[cfg(feature = "postgres")]
            Executor::Postgres(ex) => {
                let _result = sqlx::query(query).execute(ex.conn()).await.unwrap();
            }

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(ex) => {
                let _result = sqlx::query(query).execute(ex.conn()).await.unwrap();
            }
        }
    }

    /// Runs a `query` on `ex` that fetches a single row with an `i64` value on `column` and returns
    /// that value.  The `query` must be valid for all possible database implementations.
    pub(crate) async fn query_i64(ex: &mut Executor, column: &str, query: &str) -> i64 {
        match ex {
            #[cfg(feature = "postgres")]
            Executor::Postgres(ex) => {
                let row = sqlx::query(query).fetch_one(ex.conn()).await.unwrap();
                row.try_get(column).unwrap()
            }

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(ex) => {
                let row = sqlx::query(query).fetch_one(ex.conn()).await.unwrap();
                row.try_get(column).unwrap()
            }
        }
    }

    /// Counts the rows in the `test` table using a direct executor.
    pub(crate) async fn count_rows<D>(db: &D) -> i64
    where
        D: Db<Executor = Executor>,
    {
        query_i64(&mut db.ex().await.unwrap(), "count", "SELECT COUNT(*) AS count FROM test").await
    }

    pub(crate) async fn test_direct_execution<D>(db: D)
    where
        D: Db<Executor = Executor, Tx = TxExecutor>,
    {
        exec(&mut db.ex().await.unwrap(), "CREATE TABLE test (i INTEGER)").await;
        exec(&mut db.ex().await.unwrap(), "INSERT INTO test (i) VALUES (3)").await;
        assert_eq!(1, count_rows(&db).await);
        db.close().await;
    }

    pub(crate) async fn test_tx_commit<D>(db: D)
    where
        D: Db<Executor = Executor, Tx = TxExecutor>,
    {
        exec(&mut db.ex().await.unwrap(), "CREATE TABLE test (i INTEGER)").await;

        let mut tx = db.begin(&TxOptions::default()).await.unwrap();
        exec(tx.ex(), "INSERT INTO test (i) VALUES (3)").await;
        tx.commit().await.unwrap();

        assert_eq!(1, count_rows(&db).await);
        db.close().await;
    }

    pub(crate) async fn test_tx_rollback_explicit<D>(db: D)
    where
        D: Db<Executor = Executor, Tx = TxExecutor>,
    {
        exec(&mut db.ex().await.unwrap(), "CREATE TABLE test (i INTEGER)").await;

        let mut tx = db.begin(&TxOptions::default()).await.unwrap();
        exec(tx.ex(), "INSERT INTO test (i) VALUES (3)").await;
        tx.rollback().await.unwrap();

        assert_eq!(0, count_rows(&db).await);
        db.close().await;
    }

    pub(crate) async fn test_tx_rollback_on_drop<D>(db: D)
    where
        D: Db<Executor = Executor, Tx = TxExecutor>,
    {
        exec(&mut db.ex().await.unwrap(), "CREATE TABLE test (i INTEGER)").await;

        {
            let mut tx = db.begin(&TxOptions::default()).await.unwrap();
            exec(tx.ex(), "INSERT INTO test (i) VALUES (3)").await;
        }

        assert_eq!(0, count_rows(&db).await);
        db.close().await;
    }

    pub(crate) async fn test_tx_with_options<D>(db: D)
    where
        D: Db<Executor = Executor, Tx = TxExecutor>,
    {
        exec(&mut db.ex().await.unwrap(), "CREATE TABLE test (i INTEGER)").await;

        let opts = TxOptions::default().with_isolation(IsolationLevel::Serializable);
        let mut tx = db.begin(&opts).await.unwrap();
        exec(tx.ex(), "INSERT INTO test (i) VALUES (3)").await;
        tx.commit().await.unwrap();

        assert_eq!(1, count_rows(&db).await);
        db.close().await;
    }

    pub(crate) async fn test_multiple_txs<D>(db: D)
    where
        D: Db<Executor = Executor, Tx = TxExecutor>,
    {
        let tx1 = db.begin(&TxOptions::default()).await.unwrap();
        let tx2 = db.begin(&TxOptions::default()).await.unwrap();
        tx1.commit().await.unwrap();
        tx2.commit().await.unwrap();
        db.close().await;
    }

    /// Instantiates tests that need concurrent access to the database.  These tests cannot write
    /// to the database.
    #[macro_export]
    macro_rules! generate_db_ro_concurrent_tests [
        ( $setup:expr $(, #[$extra:meta])? ) => {
            $crate::db::testutils::generate_tests!(
                $( #[$extra], )?
                $setup,
                $crate::db::tests,
                test_multiple_txs
            );
        }
    ];

    pub(crate) use generate_db_ro_concurrent_tests;

    /// Instantiates tests that need write access to the test database.
    #[macro_export]
    macro_rules! generate_db_rw_tests [
        ( $setup:expr $(, #[$extra:meta])? ) => {
            $crate::db::testutils::generate_tests!(
                $( #[$extra], )?
                $setup,
                $crate::db::tests,
                test_direct_execution,
                test_tx_commit,
                test_tx_rollback_explicit,
                test_tx_rollback_on_drop,
                test_tx_with_options
            );
        }
    ];

    pub(crate) use generate_db_rw_tests;
}
