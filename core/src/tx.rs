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

//! Execution of units of work inside database transactions.
//!
//! A unit of work is an async function that receives a `Context` and performs one logical
//! business operation.  `TxRunner` begins a transaction, stores it in a child of the caller's
//! context under a well-known key, and runs the unit of work with that child context.  Data-access
//! code deep in the call chain then uses `resolve_executor` to issue its statements against the
//! ambient transaction if there is one, or directly against the database otherwise, without
//! having to be told which case applies.
//!
//! The transaction is committed if the unit of work succeeds and rolled back if it fails or
//! panics.  Panics never escape `TxRunner::run`: they are converted into `TxError::Execution`.
//!
//! An open transaction can only be used by one caller at a time.  Sharing the context that holds
//! it with concurrent tasks is unsupported and such accesses fail with `DbError::TxInUse`.
//!
//! Dropping the future returned by `run` before it completes drops the transaction, which rolls
//! it back.

use crate::context::Context;
use crate::db::{BareTx, Db, DbError, DbResult, TxOptions};
use derivative::Derivative;
use futures::FutureExt;
use log::{debug, error, warn};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};

/// Key under which transactions are stored in the context unless configured otherwise.
pub const DEFAULT_TX_KEY: &str = "tx";

/// Container of the transaction stored in a context.  Holds `None` once the transaction has been
/// committed or rolled back.
type TxSlot<T> = Arc<Mutex<Option<T>>>;

/// Callback invoked with a description of any failure observed by the runner.
pub type ErrorHook = Arc<dyn Fn(&Context, &str) + Send + Sync>;

/// Errors returned by the transaction runner.  `E` is the error type of the unit of work.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TxError<E> {
    /// The context already carries an open transaction under the runner's key.
    #[error("Transaction already active under key '{0}'")]
    AlreadyActive(String),

    /// The unit of work succeeded but its transaction could not be committed.  The state of the
    /// data is whatever the database decided upon the failed commit.
    #[error("Failed to commit transaction: {0}")]
    Commit(DbError),

    /// The unit of work panicked, or leaked the transaction to a task that was still using it
    /// once the unit of work finished.  The transaction was rolled back.
    #[error("Transaction execution failed: {0}")]
    Execution(String),

    /// The transaction could not be started.  The unit of work did not run.
    #[error("Failed to start transaction: {0}")]
    Start(DbError),

    /// The unit of work returned an error.  The transaction was rolled back.
    #[error("{0}")]
    UnitOfWork(E),
}

/// Result type for this module.
pub type TxResult<T, E> = Result<T, TxError<E>>;

/// Executor obtained by `resolve_executor`.
pub enum ResolvedExecutor<D: Db> {
    /// Direct access to the database, outside of any transaction.
    Direct(D::Executor),

    /// Exclusive access to the ambient transaction found in the context.
    Ambient(OwnedMappedMutexGuard<Option<D::Tx>, D::Tx>),
}

impl<D: Db> ResolvedExecutor<D> {
    /// Returns the executor to issue statements against.
    pub fn ex(&mut self) -> &mut D::Executor {
        match self {
            ResolvedExecutor::Direct(ex) => ex,
            ResolvedExecutor::Ambient(tx) => tx.ex(),
        }
    }

    /// Returns true if this executor is backed by the ambient transaction.
    pub fn is_ambient(&self) -> bool {
        matches!(self, ResolvedExecutor::Ambient(_))
    }
}

/// Returns an executor for the transaction stored in `ctx` under `key`, or a direct executor
/// obtained from `db` if `ctx` has no live transaction of the right type under that key.
///
/// The returned executor holds exclusive access to the ambient transaction until it is dropped.
/// Resolving the same transaction again while a previous executor is alive fails with
/// `DbError::TxInUse`.
pub async fn resolve_executor<D: Db>(
    ctx: &Context,
    db: &D,
    key: &str,
) -> DbResult<ResolvedExecutor<D>> {
    if let Some(slot) = ctx.value::<TxSlot<D::Tx>>(key) {
        let guard = slot.clone().try_lock_owned().map_err(|_| DbError::TxInUse)?;
        if let Ok(tx) = OwnedMutexGuard::try_map(guard, Option::as_mut) {
            return Ok(ResolvedExecutor::Ambient(tx));
        }
    }
    Ok(ResolvedExecutor::Direct(db.ex().await?))
}

/// Returns true if `ctx` carries a transaction under `key` that has not finished yet.
fn is_active<T: Send + 'static>(ctx: &Context, key: &str) -> bool {
    match ctx.value::<TxSlot<T>>(key) {
        Some(slot) => match slot.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => true,
        },
        None => false,
    }
}

/// Takes the transaction out of `slot` so that it can be finished.
fn take_tx<T>(slot: &TxSlot<T>) -> Result<T, String> {
    match slot.try_lock() {
        Ok(mut guard) => guard.take().ok_or_else(|| "Transaction was already finished".to_owned()),
        Err(_) => Err("Transaction is still in use after the unit of work completed".to_owned()),
    }
}

/// Extracts a human-readable message from a panic `payload`.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unit of work panicked with a non-string payload".to_owned()
    }
}

/// Runs units of work inside transactions.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct TxRunner {
    /// Key under which the transaction is stored in the context passed to the unit of work.
    key: Cow<'static, str>,

    /// Options to begin transactions with.
    options: TxOptions,

    /// Optional callback to report failures to.
    #[derivative(Debug = "ignore")]
    hook: Option<ErrorHook>,
}

impl Default for TxRunner {
    fn default() -> Self {
        Self { key: Cow::Borrowed(DEFAULT_TX_KEY), options: TxOptions::default(), hook: None }
    }
}

impl TxRunner {
    /// Stores transactions under `key` instead of `DEFAULT_TX_KEY`.
    pub fn with_key(mut self, key: impl Into<Cow<'static, str>>) -> Self {
        self.key = key.into();
        self
    }

    /// Begins transactions with `options` instead of the database defaults.
    pub fn with_options(mut self, options: TxOptions) -> Self {
        self.options = options;
        self
    }

    /// Reports failures to `hook` in addition to returning them.
    pub fn with_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&Context, &str) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Returns the key under which transactions are stored.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Invokes the hook, if any, with `message`.
    fn report(&self, ctx: &Context, message: &str) {
        if let Some(hook) = &self.hook {
            hook(ctx, message);
        }
    }

    /// Rolls back `tx`.  Failures are reported but otherwise ignored because the caller is
    /// already returning a more relevant error.
    async fn rollback<T: BareTx>(&self, ctx: &Context, tx: T) {
        match tx.rollback().await {
            Ok(()) => debug!("Rolled back transaction under key '{}'", self.key),
            Err(e) => {
                warn!("Failed to roll back transaction under key '{}': {}", self.key, e);
                self.report(ctx, &format!("Failed to roll back transaction: {}", e));
            }
        }
    }

    /// Runs `uow` inside a new transaction on `db`.
    ///
    /// See `run_and_return` for details.
    pub async fn run<D, F, Fut, E>(&self, ctx: &Context, db: &D, uow: F) -> TxResult<(), E>
    where
        D: Db,
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        self.run_and_return(ctx, db, uow).await
    }

    /// Runs `uow` inside a new transaction on `db` and returns the value it yields.
    ///
    /// The unit of work receives a child of `ctx` that carries the transaction, which it can
    /// access with `resolve_executor` using this runner's key.  The transaction is committed if
    /// the unit of work returns `Ok` and rolled back otherwise, including if it panics.
    pub async fn run_and_return<D, F, Fut, T, E>(
        &self,
        ctx: &Context,
        db: &D,
        uow: F,
    ) -> TxResult<T, E>
    where
        D: Db,
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if is_active::<D::Tx>(ctx, &self.key) {
            return Err(TxError::AlreadyActive(self.key.to_string()));
        }

        let tx = match db.begin(&self.options).await {
            Ok(tx) => tx,
            Err(e) => {
                self.report(ctx, &format!("Failed to start transaction: {}", e));
                return Err(TxError::Start(e));
            }
        };
        debug!("Began transaction under key '{}'", self.key);

        let slot: TxSlot<D::Tx> = Arc::new(Mutex::new(Some(tx)));
        let child = ctx.with_value(self.key.clone(), slot.clone());
        let outcome = AssertUnwindSafe(async move { uow(child).await }).catch_unwind().await;

        let tx = match take_tx(&slot) {
            Ok(tx) => tx,
            Err(message) => {
                error!("{}", message);
                self.report(ctx, &message);
                return Err(TxError::Execution(message));
            }
        };

        match outcome {
            Ok(Ok(value)) => match tx.commit().await {
                Ok(()) => {
                    debug!("Committed transaction under key '{}'", self.key);
                    Ok(value)
                }
                Err(e) => {
                    self.report(ctx, &format!("Failed to commit transaction: {}", e));
                    Err(TxError::Commit(e))
                }
            },

            Ok(Err(e)) => {
                self.report(ctx, &format!("Unit of work failed: {}", e));
                self.rollback(ctx, tx).await;
                Err(TxError::UnitOfWork(e))
            }

            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Recovered from panic in unit of work: {}", message);
                self.report(ctx, &format!("Unit of work panicked: {}", message));
                self.rollback(ctx, tx).await;
                Err(TxError::Execution(message))
            }
        }
    }
}

/// Runs `uow` inside a new transaction on `db` using the default runner configuration.
pub async fn run<D, F, Fut, E>(ctx: &Context, db: &D, uow: F) -> TxResult<(), E>
where
    D: Db,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    TxRunner::default().run(ctx, db, uow).await
}

/// Runs `uow` inside a new transaction on `db` using the default runner configuration and returns
/// the value it yields.
pub async fn run_and_return<D, F, Fut, T, E>(ctx: &Context, db: &D, uow: F) -> TxResult<T, E>
where
    D: Db,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    TxRunner::default().run_and_return(ctx, db, uow).await
}

#[cfg(test)]
mod mock_tests {
    use super::*;
    use crate::db::IsolationLevel;
    use crate::db::mock::{MockDb, Statement};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Unit of work that panics with a non-string payload.
    async fn explode(value: i32) -> DbResult<()> {
        std::panic::panic_any(value)
    }

    /// Returns a hook that records all messages it receives, and the storage for them.
    fn recording_hook() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&Context, &str) + Send + Sync) {
        let messages = Arc::new(StdMutex::new(vec![]));
        let messages2 = messages.clone();
        let hook = move |_ctx: &Context, message: &str| {
            messages2.lock().unwrap().push(message.to_owned());
        };
        (messages, hook)
    }

    #[tokio::test]
    async fn test_run_ok_commits_once() {
        let db = &MockDb::default();

        run(&Context::background(), db, |ctx| async move {
            let mut ex = resolve_executor(&ctx, db, DEFAULT_TX_KEY).await?;
            assert!(ex.is_ambient());
            ex.ex().exec("INSERT")
        })
        .await
        .unwrap();

        assert_eq!(1, db.begins());
        assert_eq!(1, db.commits());
        assert_eq!(0, db.rollbacks());
        assert_eq!(0, db.abandoned());
        assert_eq!(vec![Statement { tx: Some(1), sql: "INSERT".to_owned() }], db.statements());
    }

    #[tokio::test]
    async fn test_run_tx_only_visible_during_execution() {
        let db = &MockDb::default();
        let root = Context::background();

        assert!(!resolve_executor(&root, db, DEFAULT_TX_KEY).await.unwrap().is_ambient());

        let mut leaked = None;
        run(&root, db, |ctx| {
            let leaked = &mut leaked;
            async move {
                *leaked = Some(ctx);
                Ok::<(), DbError>(())
            }
        })
        .await
        .unwrap();

        let leaked = leaked.unwrap();
        assert!(!resolve_executor(&root, db, DEFAULT_TX_KEY).await.unwrap().is_ambient());
        assert!(!resolve_executor(&leaked, db, DEFAULT_TX_KEY).await.unwrap().is_ambient());
    }

    #[tokio::test]
    async fn test_run_error_rolls_back_once() {
        let db = &MockDb::default();

        let err = run(&Context::background(), db, |ctx| async move {
            let mut ex = resolve_executor(&ctx, db, DEFAULT_TX_KEY).await?;
            ex.ex().exec("INSERT")?;
            Err(DbError::BackendError("insert failed".to_owned()))
        })
        .await
        .unwrap_err();

        assert_eq!(TxError::UnitOfWork(DbError::BackendError("insert failed".to_owned())), err);
        assert!(err.to_string().contains("insert failed"));
        assert_eq!(1, db.begins());
        assert_eq!(0, db.commits());
        assert_eq!(1, db.rollbacks());
    }

    #[tokio::test]
    async fn test_run_panic_is_recovered() {
        let db = &MockDb::default();

        let err = run(&Context::background(), db, |_ctx| explode(42)).await.unwrap_err();

        assert_eq!(
            TxError::Execution("Unit of work panicked with a non-string payload".to_owned()),
            err
        );
        assert_eq!(1, db.begins());
        assert_eq!(0, db.commits());
        assert_eq!(1, db.rollbacks());
    }

    #[tokio::test]
    async fn test_run_panic_message_is_preserved() {
        let db = &MockDb::default();

        let err = run(&Context::background(), db, |ctx| async move {
            let mut ex = resolve_executor(&ctx, db, DEFAULT_TX_KEY).await?;
            ex.ex().exec("INSERT")?;
            let values: Vec<i32> = vec![];
            if values.is_empty() {
                panic!("Oops: {}", values.len());
            }
            Ok::<(), DbError>(())
        })
        .await
        .unwrap_err();

        assert_eq!(TxError::Execution("Oops: 0".to_owned()), err);
        assert_eq!(1, db.rollbacks());
        assert_eq!(0, db.abandoned());
    }

    #[tokio::test]
    async fn test_run_panic_before_future_is_recovered() {
        let db = &MockDb::default();

        let err = run(&Context::background(), db, |_ctx| -> futures::future::Ready<DbResult<()>> {
            panic!("Synchronous failure")
        })
        .await
        .unwrap_err();

        assert_eq!(TxError::Execution("Synchronous failure".to_owned()), err);
        assert_eq!(1, db.rollbacks());
    }

    #[tokio::test]
    async fn test_run_begin_failure_skips_unit_of_work() {
        let db = &MockDb::default();
        db.set_fail_begin(true);

        let called = AtomicBool::new(false);
        let err = run(&Context::background(), db, |_ctx| async {
            called.store(true, Ordering::SeqCst);
            Ok::<(), DbError>(())
        })
        .await
        .unwrap_err();

        assert_eq!(TxError::Start(DbError::Unavailable), err);
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(0, db.commits());
        assert_eq!(0, db.rollbacks());
    }

    #[tokio::test]
    async fn test_run_commit_failure_is_returned_without_rollback() {
        let db = &MockDb::default();
        db.set_fail_commit(true);

        let err = run(&Context::background(), db, |_ctx| async { Ok::<(), DbError>(()) })
            .await
            .unwrap_err();

        assert_eq!(TxError::Commit(DbError::BackendError("Commit failed".to_owned())), err);
        assert_eq!(0, db.rollbacks());
    }

    #[tokio::test]
    async fn test_run_rollback_failure_keeps_original_error() {
        let db = &MockDb::default();
        db.set_fail_rollback(true);
        let (messages, hook) = recording_hook();
        let runner = TxRunner::default().with_hook(hook);

        let err = runner
            .run(&Context::background(), db, |_ctx| async { Err(DbError::NotFound) })
            .await
            .unwrap_err();

        assert_eq!(TxError::UnitOfWork(DbError::NotFound), err);
        assert_eq!(1, db.rollbacks());
        assert_eq!(
            vec![
                "Unit of work failed: Entity not found".to_owned(),
                "Failed to roll back transaction: Database error: Rollback failed".to_owned(),
            ],
            *messages.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_and_return_yields_value() {
        let db = &MockDb::default();

        let affected = run_and_return(&Context::background(), db, |ctx| async move {
            let mut ex = resolve_executor(&ctx, db, DEFAULT_TX_KEY).await?;
            ex.ex().exec("UPDATE")?;
            Ok::<i64, DbError>(3)
        })
        .await
        .unwrap();

        assert_eq!(3, affected);
        assert_eq!(1, db.commits());
    }

    #[tokio::test]
    async fn test_run_and_return_error_discards_value() {
        let db = &MockDb::default();

        let err = run_and_return::<_, _, _, i64, _>(&Context::background(), db, |_ctx| async {
            Err(DbError::AlreadyExists)
        })
        .await
        .unwrap_err();

        assert_eq!(TxError::UnitOfWork(DbError::AlreadyExists), err);
        assert_eq!(1, db.rollbacks());
    }

    #[tokio::test]
    async fn test_run_nested_same_key_is_rejected() {
        let db = &MockDb::default();

        let mut nested = None;
        run(&Context::background(), db, |ctx| {
            let nested = &mut nested;
            async move {
                *nested = Some(run(&ctx, db, |_ctx| async { Ok::<(), DbError>(()) }).await);
                Ok::<(), DbError>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(Some(Err(TxError::AlreadyActive("tx".to_owned()))), nested);
        assert_eq!(1, db.begins());
        assert_eq!(1, db.commits());
    }

    #[tokio::test]
    async fn test_run_nested_different_key_is_independent() {
        let db = &MockDb::default();
        let inner = TxRunner::default().with_key("audit");
        assert_eq!("audit", inner.key());

        run(&Context::background(), db, |ctx| {
            let inner = &inner;
            async move {
                resolve_executor(&ctx, db, DEFAULT_TX_KEY).await?.ex().exec("OUTER")?;
                inner
                    .run(&ctx, db, |ctx| async move {
                        resolve_executor(&ctx, db, "audit").await?.ex().exec("INNER")
                    })
                    .await
                    .map_err(|e| DbError::BackendError(e.to_string()))?;
                Ok::<(), DbError>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(2, db.begins());
        assert_eq!(2, db.commits());
        assert_eq!(
            vec![
                Statement { tx: Some(1), sql: "OUTER".to_owned() },
                Statement { tx: Some(2), sql: "INNER".to_owned() },
            ],
            db.statements()
        );
    }

    #[tokio::test]
    async fn test_run_uses_configured_options() {
        let db = &MockDb::default();
        let opts = TxOptions::default().with_isolation(IsolationLevel::Serializable);
        let runner = TxRunner::default().with_options(opts.clone());

        runner.run(&Context::background(), db, |_ctx| async { Ok::<(), DbError>(()) }).await.unwrap();

        assert_eq!(Some(opts), db.last_options());
    }

    #[tokio::test]
    async fn test_hook_sees_panics_and_begin_failures() {
        let db = &MockDb::default();
        let (messages, hook) = recording_hook();
        let runner = TxRunner::default().with_hook(hook);

        let _ = runner.run(&Context::background(), db, |_ctx| explode(1)).await;
        db.set_fail_begin(true);
        let _ = runner.run(&Context::background(), db, |_ctx| async { Ok::<(), DbError>(()) }).await;

        assert_eq!(
            vec![
                "Unit of work panicked: Unit of work panicked with a non-string payload".to_owned(),
                "Failed to start transaction: Unavailable".to_owned(),
            ],
            *messages.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_executor_ignores_other_types() {
        let db = &MockDb::default();
        let ctx = Context::background().with_value(DEFAULT_TX_KEY, 5u32);

        let mut ex = resolve_executor(&ctx, db, DEFAULT_TX_KEY).await.unwrap();
        assert!(!ex.is_ambient());
        ex.ex().exec("SELECT").unwrap();
        assert_eq!(vec![Statement { tx: None, sql: "SELECT".to_owned() }], db.statements());
    }

    #[tokio::test]
    async fn test_resolve_executor_other_key_is_direct() {
        let db = &MockDb::default();

        run(&Context::background(), db, |ctx| async move {
            let ex = resolve_executor(&ctx, db, "other").await?;
            assert!(!ex.is_ambient());
            Ok::<(), DbError>(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_executor_concurrent_use_fails() {
        let db = &MockDb::default();

        run(&Context::background(), db, |ctx| async move {
            let _first = resolve_executor(&ctx, db, DEFAULT_TX_KEY).await?;
            match resolve_executor(&ctx, db, DEFAULT_TX_KEY).await {
                Err(DbError::TxInUse) => (),
                Err(e) => panic!("Unexpected error {:?}", e),
                Ok(_) => panic!("Second resolution must have failed"),
            }
            Ok::<(), DbError>(())
        })
        .await
        .unwrap();

        assert_eq!(1, db.commits());
    }

    #[tokio::test]
    async fn test_run_tx_leaked_past_unit_of_work() {
        let db = &MockDb::default();

        let mut leaked = None;
        let err = run(&Context::background(), db, |ctx| {
            let leaked = &mut leaked;
            async move {
                *leaked = Some(resolve_executor(&ctx, db, DEFAULT_TX_KEY).await?);
                Ok::<(), DbError>(())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(
            TxError::Execution(
                "Transaction is still in use after the unit of work completed".to_owned()
            ),
            err
        );
        assert_eq!(0, db.commits());
        assert_eq!(0, db.rollbacks());

        drop(leaked);
        assert_eq!(1, db.abandoned());
    }

    #[tokio::test]
    async fn test_run_cancellation_abandons_tx() {
        let db = &MockDb::default();

        let result = tokio::time::timeout(
            Duration::from_millis(10),
            run(&Context::background(), db, |_ctx| futures::future::pending::<DbResult<()>>()),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(1, db.begins());
        assert_eq!(0, db.commits());
        assert_eq!(0, db.rollbacks());
        assert_eq!(1, db.abandoned());
    }
}
