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

//! Database implementation backed by in-memory counters for testing purposes.
//!
//! `MockDb` does not store any data.  Instead, it records which statements were issued through
//! which executors and how many transactions were begun, committed and rolled back, so that tests
//! can verify the lifecycle of transactions without a real database.

use crate::db::{BareTx, Db, DbError, DbResult, TxOptions};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A statement recorded by a `MockExecutor`.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    /// Sequence number of the transaction the statement ran in, or `None` for direct execution.
    pub tx: Option<usize>,

    /// The statement text.
    pub sql: String,
}

/// Shared state of a `MockDb` and all of its executors.
#[derive(Default)]
struct MockState {
    /// Number of transactions begun so far.  Also used to number transactions.
    begins: AtomicUsize,

    /// Number of successful commits.
    commits: AtomicUsize,

    /// Number of rollbacks, whether they failed or not.
    rollbacks: AtomicUsize,

    /// Number of transactions dropped without being committed or rolled back.
    abandoned: AtomicUsize,

    /// Whether `begin` should fail.
    fail_begin: AtomicBool,

    /// Whether `commit` should fail.
    fail_commit: AtomicBool,

    /// Whether `rollback` should fail.
    fail_rollback: AtomicBool,

    /// Options passed to the most recent call to `begin`.
    last_options: Mutex<Option<TxOptions>>,

    /// Statements issued so far, in order.
    statements: Mutex<Vec<Statement>>,
}

/// Executor that records the statements issued through it.
pub struct MockExecutor {
    /// State of the database this executor belongs to.
    state: Arc<MockState>,

    /// Sequence number of the transaction backing this executor, if any.
    tx: Option<usize>,
}

impl MockExecutor {
    /// Records the execution of `sql`.
    pub fn exec(&mut self, sql: &str) -> DbResult<()> {
        let mut statements = self.state.statements.lock().unwrap();
        statements.push(Statement { tx: self.tx, sql: sql.to_owned() });
        Ok(())
    }

    /// Returns the sequence number of the transaction backing this executor, if any.
    pub fn tx(&self) -> Option<usize> {
        self.tx
    }
}

/// Transaction handed out by `MockDb::begin`.
pub struct MockTx {
    /// Executor to issue statements within the transaction.
    ex: MockExecutor,

    /// Whether the transaction was committed or rolled back.
    finished: bool,
}

impl Drop for MockTx {
    fn drop(&mut self) {
        if !self.finished {
            self.ex.state.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BareTx for MockTx {
    type Executor = MockExecutor;

    fn ex(&mut self) -> &mut MockExecutor {
        &mut self.ex
    }

    async fn commit(mut self) -> DbResult<()> {
        self.finished = true;
        if self.ex.state.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::BackendError("Commit failed".to_owned()));
        }
        self.ex.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self) -> DbResult<()> {
        self.finished = true;
        self.ex.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.ex.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::BackendError("Rollback failed".to_owned()));
        }
        Ok(())
    }
}

/// Database that records transaction activity instead of storing data.
#[derive(Clone, Default)]
pub struct MockDb {
    /// State shared with all executors and transactions of this database.
    state: Arc<MockState>,
}

impl MockDb {
    /// Configures whether subsequent calls to `begin` fail.
    pub fn set_fail_begin(&self, fail: bool) {
        self.state.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Configures whether subsequent commits fail.
    pub fn set_fail_commit(&self, fail: bool) {
        self.state.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Configures whether subsequent rollbacks fail.
    pub fn set_fail_rollback(&self, fail: bool) {
        self.state.fail_rollback.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of transactions begun so far.
    pub fn begins(&self) -> usize {
        self.state.begins.load(Ordering::SeqCst)
    }

    /// Returns the number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// Returns the number of rollbacks attempted so far.
    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Returns the number of transactions that were dropped while still open.
    pub fn abandoned(&self) -> usize {
        self.state.abandoned.load(Ordering::SeqCst)
    }

    /// Returns the options given to the most recent `begin` call.
    pub fn last_options(&self) -> Option<TxOptions> {
        self.state.last_options.lock().unwrap().clone()
    }

    /// Returns all statements issued so far.
    pub fn statements(&self) -> Vec<Statement> {
        self.state.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl Db for MockDb {
    type Executor = MockExecutor;
    type Tx = MockTx;

    async fn ex(&self) -> DbResult<MockExecutor> {
        Ok(MockExecutor { state: self.state.clone(), tx: None })
    }

    async fn begin(&self, opts: &TxOptions) -> DbResult<MockTx> {
        *self.state.last_options.lock().unwrap() = Some(opts.clone());
        if self.state.fail_begin.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable);
        }
        let id = self.state.begins.fetch_add(1, Ordering::SeqCst) + 1;
        let ex = MockExecutor { state: self.state.clone(), tx: Some(id) };
        Ok(MockTx { ex, finished: false })
    }

    async fn close(&self) {}
}
