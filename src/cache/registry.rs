//! Declarative operation registry.
//!
//! Every query and mutation is declared once at startup with its resolver,
//! the tags it provides or invalidates, and (for mutations) an optional
//! optimistic patch. The cache looks operations up by name.

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::CacheError;
use crate::store::RemoteStore;

use super::key::Tag;
use super::patch::QueryPatch;

pub type FetchResult = BoxFuture<'static, Result<Value, CacheError>>;

/// Type-erased resolver: arguments in, JSON result out.
pub type Resolver = Arc<dyn Fn(Arc<dyn RemoteStore>, Value) -> FetchResult + Send + Sync>;

/// Computes the optimistic patches of a mutation from its arguments.
pub type PatchFn = Arc<dyn Fn(&Value) -> Vec<QueryPatch> + Send + Sync>;

pub struct QueryDef {
  pub name: &'static str,
  pub provides: Vec<Tag>,
  pub(crate) resolver: Resolver,
}

pub struct MutationDef {
  pub name: &'static str,
  pub invalidates: Vec<Tag>,
  pub(crate) resolver: Resolver,
  pub(crate) optimistic: Option<PatchFn>,
}

pub enum Operation {
  Query(QueryDef),
  Mutation(MutationDef),
}

impl Operation {
  pub fn name(&self) -> &'static str {
    match self {
      Operation::Query(q) => q.name,
      Operation::Mutation(m) => m.name,
    }
  }
}

#[derive(Default)]
pub struct OperationRegistry {
  operations: HashMap<&'static str, Operation>,
}

impl OperationRegistry {
  pub fn builder() -> RegistryBuilder {
    RegistryBuilder::default()
  }

  pub fn get(&self, name: &str) -> Option<&Operation> {
    self.operations.get(name)
  }

  pub fn query(&self, name: &str) -> Result<&QueryDef, CacheError> {
    match self.operations.get(name) {
      Some(Operation::Query(def)) => Ok(def),
      Some(Operation::Mutation(_)) => Err(CacheError::WrongKind {
        name: name.to_string(),
        expected: "query",
      }),
      None => Err(CacheError::UnknownOperation(name.to_string())),
    }
  }

  pub fn mutation(&self, name: &str) -> Result<&MutationDef, CacheError> {
    match self.operations.get(name) {
      Some(Operation::Mutation(def)) => Ok(def),
      Some(Operation::Query(_)) => Err(CacheError::WrongKind {
        name: name.to_string(),
        expected: "mutation",
      }),
      None => Err(CacheError::UnknownOperation(name.to_string())),
    }
  }

  /// Registered operation names, sorted.
  pub fn names(&self) -> Vec<&'static str> {
    let mut names: Vec<_> = self.operations.keys().copied().collect();
    names.sort_unstable();
    names
  }
}

#[derive(Default)]
pub struct RegistryBuilder {
  operations: HashMap<&'static str, Operation>,
}

impl RegistryBuilder {
  /// Declare a query providing `tags`.
  pub fn query<A, T, F, Fut>(mut self, name: &'static str, tags: &[Tag], resolver: F) -> Self
  where
    A: DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(Arc<dyn RemoteStore>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
  {
    self.operations.insert(
      name,
      Operation::Query(QueryDef {
        name,
        provides: tags.to_vec(),
        resolver: erase(name, resolver),
      }),
    );
    self
  }

  /// Declare a mutation invalidating `tags`.
  pub fn mutation<A, T, F, Fut>(self, name: &'static str, tags: &[Tag], resolver: F) -> Self
  where
    A: DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(Arc<dyn RemoteStore>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
  {
    self.insert_mutation(name, tags, erase(name, resolver), None)
  }

  /// Declare a mutation that also patches cached queries before the write.
  pub fn optimistic_mutation<A, T, F, Fut, P>(
    self,
    name: &'static str,
    tags: &[Tag],
    resolver: F,
    patch: P,
  ) -> Self
  where
    A: DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(Arc<dyn RemoteStore>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    P: Fn(&A) -> Vec<QueryPatch> + Send + Sync + 'static,
  {
    let patch_fn: PatchFn = Arc::new(move |args: &Value| {
      // Bad arguments produce no patch; the resolver reports the error.
      match serde_json::from_value::<A>(args.clone()) {
        Ok(args) => patch(&args),
        Err(_) => Vec::new(),
      }
    });
    self.insert_mutation(name, tags, erase(name, resolver), Some(patch_fn))
  }

  fn insert_mutation(
    mut self,
    name: &'static str,
    tags: &[Tag],
    resolver: Resolver,
    optimistic: Option<PatchFn>,
  ) -> Self {
    self.operations.insert(
      name,
      Operation::Mutation(MutationDef {
        name,
        invalidates: tags.to_vec(),
        resolver,
        optimistic,
      }),
    );
    self
  }

  pub fn build(self) -> OperationRegistry {
    OperationRegistry {
      operations: self.operations,
    }
  }
}

/// Wrap a typed resolver so it takes and returns JSON.
fn erase<A, T, F, Fut>(name: &'static str, resolver: F) -> Resolver
where
  A: DeserializeOwned + Send + 'static,
  T: Serialize + Send + 'static,
  F: Fn(Arc<dyn RemoteStore>, A) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
{
  Arc::new(move |store: Arc<dyn RemoteStore>, args: Value| -> FetchResult {
    let args: A = match serde_json::from_value(args) {
      Ok(args) => args,
      Err(e) => {
        let err = CacheError::InvalidArgs {
          operation: name.to_string(),
          message: e.to_string(),
        };
        return futures::future::ready(Err(err)).boxed();
      }
    };
    let fut = resolver(store, args);
    async move {
      let output = fut.await?;
      serde_json::to_value(output).map_err(|e| CacheError::Decode {
        operation: name.to_string(),
        message: e.to_string(),
      })
    }
    .boxed()
  })
}

/// Serialize call-site arguments into the JSON form the cache keys on.
pub(crate) fn to_args<A: Serialize + ?Sized>(
  operation: &str,
  args: &A,
) -> Result<Value, CacheError> {
  serde_json::to_value(args).map_err(|e| CacheError::InvalidArgs {
    operation: operation.to_string(),
    message: e.to_string(),
  })
}

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(operation: &str, value: Value) -> Result<T, CacheError> {
  serde_json::from_value(value).map_err(|e| CacheError::Decode {
    operation: operation.to_string(),
    message: e.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use serde::Deserialize;

  #[derive(Deserialize)]
  struct Echo {
    word: String,
  }

  fn registry() -> OperationRegistry {
    OperationRegistry::builder()
      .query("echo", &[Tag::from_static("Echo")], |_store, args: Echo| async move {
        Ok(args.word)
      })
      .mutation("shout", &[Tag::from_static("Echo")], |_store, args: Echo| async move {
        Ok(args.word.to_uppercase())
      })
      .build()
  }

  #[test]
  fn test_lookup_by_kind() {
    let registry = registry();
    assert!(registry.query("echo").is_ok());
    assert!(registry.mutation("shout").is_ok());
    assert!(matches!(
      registry.query("shout"),
      Err(CacheError::WrongKind { .. })
    ));
    assert!(matches!(
      registry.mutation("nope"),
      Err(CacheError::UnknownOperation(_))
    ));
    assert_eq!(registry.names(), vec!["echo", "shout"]);
  }

  #[tokio::test]
  async fn test_erased_resolver_round_trips_json() {
    let registry = registry();
    let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
    let def = registry.query("echo").unwrap();

    let out = (def.resolver)(store.clone(), serde_json::json!({"word": "hi"}))
      .await
      .unwrap();
    assert_eq!(out, Value::String("hi".into()));

    let err = (def.resolver)(store, serde_json::json!({"nope": 1}))
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::InvalidArgs { .. }));
  }
}
