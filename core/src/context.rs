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

//! Request-scoped carrier of typed values.
//!
//! A `Context` is an immutable chain of key/value pairs.  Deriving a child context with
//! `with_value` never modifies the parent, so a context can be freely cloned and handed to
//! concurrent tasks without synchronization.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// A single key/value association in a context chain.
struct Node {
    /// Name under which `value` was stored.
    key: Cow<'static, str>,

    /// The stored value, type-erased.
    value: Arc<dyn Any + Send + Sync>,

    /// Context from which this node was derived.
    parent: Option<Arc<Node>>,
}

/// Immutable, cheaply-cloneable set of values scoped to a single request or call chain.
#[derive(Clone, Default)]
pub struct Context {
    /// Most recently added association, or `None` for the empty context.
    head: Option<Arc<Node>>,
}

impl Context {
    /// Returns the empty root context.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a new context that associates `key` with `value` and inherits all other
    /// associations from `self`.
    ///
    /// A previous association of `key` is shadowed in the new context but remains visible in
    /// `self`.
    pub fn with_value<V>(&self, key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        let node = Node { key: key.into(), value: Arc::new(value), parent: self.head.clone() };
        Self { head: Some(Arc::new(node)) }
    }

    /// Finds the nearest node associated with `key`.
    fn find(&self, key: &str) -> Option<&Node> {
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            if n.key == key {
                return Some(n);
            }
            node = n.parent.as_deref();
        }
        None
    }

    /// Returns the value associated with `key` if it exists and is of type `V`.
    ///
    /// Only the nearest association of `key` is considered: if it holds a value of a different
    /// type, this returns `None` even if an older association has the requested type.
    pub fn value<V>(&self, key: &str) -> Option<&V>
    where
        V: Any + Send + Sync,
    {
        self.find(key).and_then(|node| node.value.downcast_ref::<V>())
    }

    /// Returns true if there is any value associated with `key`, regardless of its type.
    pub fn contains_key(&self, key: &str) -> bool {
        self.find(key).is_some()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = vec![];
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            keys.push(n.key.as_ref());
            node = n.parent.as_deref();
        }
        f.debug_struct("Context").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_empty() {
        let ctx = Context::background();
        assert!(!ctx.contains_key("tx"));
        assert_eq!(None, ctx.value::<u32>("tx"));
    }

    #[test]
    fn test_with_value_does_not_modify_parent() {
        let parent = Context::background().with_value("a", 1u32);
        let child = parent.with_value("b", "two".to_owned());

        assert_eq!(Some(&1u32), parent.value::<u32>("a"));
        assert!(!parent.contains_key("b"));

        assert_eq!(Some(&1u32), child.value::<u32>("a"));
        assert_eq!(Some(&"two".to_owned()), child.value::<String>("b"));
    }

    #[test]
    fn test_nearest_value_shadows_older_ones() {
        let parent = Context::background().with_value("key", 1u32);
        let child = parent.with_value("key", 2u32);

        assert_eq!(Some(&1u32), parent.value::<u32>("key"));
        assert_eq!(Some(&2u32), child.value::<u32>("key"));
    }

    #[test]
    fn test_type_mismatch_hides_value() {
        let ctx = Context::background().with_value("key", 1u32).with_value("key", "text");

        assert!(ctx.contains_key("key"));
        assert_eq!(None, ctx.value::<u32>("key"));
        assert_eq!(Some(&"text"), ctx.value::<&'static str>("key"));
    }

    #[test]
    fn test_owned_keys() {
        let key = format!("tx-{}", 3);
        let ctx = Context::background().with_value(key.clone(), 5i64);
        assert_eq!(Some(&5i64), ctx.value::<i64>(&key));
        assert_eq!(None, ctx.value::<i64>("tx"));
    }

    #[test]
    fn test_debug_lists_keys() {
        let ctx = Context::background().with_value("first", 1u8).with_value("second", 2u8);
        assert_eq!(r#"Context { keys: ["second", "first"] }"#, format!("{:?}", ctx));
    }
}
