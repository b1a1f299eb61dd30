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

//! Building blocks for the persistence layer of web services.
//!
//! Services built on top of this crate structure their data access in three pieces:
//!
//! 1.  `db`: The abstraction over the database system.  A `Db` hands out direct executors and
//!     begins transactions, and concrete backends live in the `postgres` and `sqlite` submodules.
//!
//! 1.  `service`: Repositories implement the `Repository` port for each of their entity types and
//!     are exposed to callers through the thin `RepositoryService` façade, which forwards every
//!     operation unchanged.
//!
//! 1.  `tx`: The `TxRunner` executes a unit of work inside a transaction.  The transaction travels
//!     down the call chain inside a `context::Context`, and repositories call `resolve_executor`
//!     to transparently join it or, if there is none, to talk to the database directly.
//!
//! Errors float up with the `?` operator: repositories return `DbError`s, which the transaction
//! runner wraps in `TxError` along with the failures of the transaction itself.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod context;
pub mod db;
pub mod env;
pub mod paging;
pub mod service;
pub mod tx;
