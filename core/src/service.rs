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

//! Generic repository services.
//!
//! A repository is a storage adapter for one entity type and implements the `Repository` port
//! (and optionally `SearchRepository`).  Repositories obtain their executor from the context they
//! receive via `tx::resolve_executor` so that they transparently join any ambient transaction.
//!
//! `RepositoryService` is the façade that callers depend on.  It forwards every operation to its
//! repository without retries, caching, locking or validation, and returns the repository's
//! results unchanged.

use crate::context::Context;
use crate::db::DbResult;
use crate::paging::{Page, PageRequest};
use async_trait::async_trait;
use derivative::Derivative;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Partial representation of an entity used by `patch`, keyed by field name.  The map must carry
/// the entity's identity fields.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Storage operations for entities of type `T` identified by keys of type `K`.
///
/// Counts returned by the mutating operations are the number of entities affected, as reported
/// by the store.
#[async_trait]
pub trait Repository<T, K>: Send + Sync
where
    T: Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    /// Loads the entity identified by `id`.  A missing entity is not an error.
    async fn load(&self, ctx: &Context, id: &K) -> DbResult<Option<T>>;

    /// Stores a new entity.
    async fn create(&self, ctx: &Context, model: &T) -> DbResult<i64>;

    /// Replaces an existing entity with `model`.
    async fn update(&self, ctx: &Context, model: &T) -> DbResult<i64>;

    /// Updates only the given `fields` of an existing entity.
    async fn patch(&self, ctx: &Context, fields: &Fields) -> DbResult<i64>;

    /// Deletes the entity identified by `id`.
    async fn delete(&self, ctx: &Context, id: &K) -> DbResult<i64>;
}

/// Repositories that can also look up entities matching filters of type `F`.
#[async_trait]
pub trait SearchRepository<T, K, F>: Repository<T, K>
where
    T: Send + Sync + 'static,
    K: Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    /// Returns at most `limit` entities matching `filter` after skipping `offset` of them, along
    /// with the total number of matches.
    async fn search(
        &self,
        ctx: &Context,
        filter: &F,
        limit: i64,
        offset: i64,
    ) -> DbResult<Page<T>>;
}

/// Façade over a single repository `R` for entities of type `T` identified by keys of type `K`.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct RepositoryService<T, K, R: ?Sized> {
    /// The repository all operations are forwarded to.
    #[derivative(Debug = "ignore")]
    repository: Arc<R>,

    /// Marker for the types this service handles.
    #[derivative(Debug = "ignore")]
    _types: PhantomData<fn(&K) -> T>,
}

impl<T, K, R> RepositoryService<T, K, R>
where
    T: Send + Sync + 'static,
    K: Send + Sync + 'static,
    R: Repository<T, K> + ?Sized,
{
    /// Creates a new service backed by `repository`.
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository, _types: PhantomData }
    }

    /// Returns the repository backing this service.
    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Loads the entity identified by `id`, returning `None` if it does not exist.
    pub async fn load(&self, ctx: &Context, id: &K) -> DbResult<Option<T>> {
        self.repository.load(ctx, id).await
    }

    /// Stores a new entity.
    pub async fn create(&self, ctx: &Context, model: &T) -> DbResult<i64> {
        self.repository.create(ctx, model).await
    }

    /// Replaces an existing entity.
    pub async fn update(&self, ctx: &Context, model: &T) -> DbResult<i64> {
        self.repository.update(ctx, model).await
    }

    /// Updates some `fields` of an existing entity.
    pub async fn patch(&self, ctx: &Context, fields: &Fields) -> DbResult<i64> {
        self.repository.patch(ctx, fields).await
    }

    /// Deletes the entity identified by `id`.
    pub async fn delete(&self, ctx: &Context, id: &K) -> DbResult<i64> {
        self.repository.delete(ctx, id).await
    }

    /// Searches for entities matching `filter`.  `limit` and `offset` are passed through as given.
    pub async fn search<F>(
        &self,
        ctx: &Context,
        filter: &F,
        limit: i64,
        offset: i64,
    ) -> DbResult<Page<T>>
    where
        F: Send + Sync + 'static,
        R: SearchRepository<T, K, F>,
    {
        self.repository.search(ctx, filter, limit, offset).await
    }

    /// Searches for entities matching `filter` within the window described by `page`.
    pub async fn search_page<F>(
        &self,
        ctx: &Context,
        filter: &F,
        page: PageRequest,
    ) -> DbResult<Page<T>>
    where
        F: Send + Sync + 'static,
        R: SearchRepository<T, K, F>,
    {
        self.search(ctx, filter, page.limit, page.offset).await
    }
}
