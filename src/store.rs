//! The object-store capability the reconciler runs against.
//!
//! All state lives in the control plane; the reconciler re-reads before every
//! decision and never caches. The trait carries exactly the four primitives
//! the reconciler needs, so tests can swap in [`memory::MemoryStore`] instead
//! of a live cluster.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::consts;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("api error: {0}")]
    Api(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn not_found<K: StoreObject>(namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Namespaced object the store can round-trip.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Serialize
    + DeserializeOwned
    + Clone
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug
        + Send
        + Sync
        + 'static
{
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> StoreResult<K>;

    /// Server-side merge with forced field ownership: fields this operator
    /// owns always win over concurrent external edits.
    async fn apply_forced<K: StoreObject>(&self, object: &K) -> StoreResult<K>;

    /// Merge-patch the stored object with `object`. Lists are replaced
    /// wholesale, maps are merged. Read-modify-write provenance comes from
    /// the `get` that produced `object`.
    async fn patch_merge<K: StoreObject>(&self, object: &K) -> StoreResult<K>;

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

/// Store backed by the real control-plane apiserver.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_err<K: StoreObject>(namespace: &str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::not_found::<K>(namespace, name),
        other => StoreError::Api(Box::new(other)),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> StoreResult<K> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|err| map_kube_err::<K>(namespace, name, err))
    }

    async fn apply_forced<K: StoreObject>(&self, object: &K) -> StoreResult<K> {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let params = PatchParams::apply(consts::FIELD_OWNER).force();
        self.api::<K>(&namespace)
            .patch(&name, &params, &Patch::Apply(object))
            .await
            .map_err(|err| map_kube_err::<K>(&namespace, &name, err))
    }

    async fn patch_merge<K: StoreObject>(&self, object: &K) -> StoreResult<K> {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        self.api::<K>(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(object))
            .await
            .map_err(|err| map_kube_err::<K>(&namespace, &name, err))
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| map_kube_err::<K>(namespace, name, err))
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory store used by the test suite. Mirrors the apiserver
    //! behaviors the reconciler relies on: merge semantics, server-owned
    //! `status` and `metadata.uid`, and a distinguished not-found signal.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use serde_json::{Map, Value};

    use super::*;

    type Key = (String, String, String);

    #[derive(Default)]
    struct Inner {
        objects: HashMap<Key, Value>,
        uid_counter: u64,
    }

    #[derive(Clone, Default)]
    pub struct MemoryStore {
        inner: Arc<Mutex<Inner>>,
    }

    fn key<K: StoreObject>(namespace: &str, name: &str) -> Key {
        (
            K::kind(&()).into_owned(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    /// RFC 7386 style merge: objects merge recursively, `null` removes,
    /// everything else (lists included) replaces.
    fn merge_value(base: &mut Value, patch: &Value) {
        match (base, patch) {
            (Value::Object(base_map), Value::Object(patch_map)) => {
                for (field, patch_field) in patch_map {
                    if patch_field.is_null() {
                        base_map.remove(field);
                    } else {
                        merge_value(
                            base_map.entry(field.clone()).or_insert(Value::Null),
                            patch_field,
                        );
                    }
                }
            }
            (base, patch) => *base = patch.clone(),
        }
    }

    fn set_uid(object: &mut Value, uid: String) {
        if let Some(metadata) = object
            .as_object_mut()
            .map(|map| map.entry("metadata").or_insert_with(|| Value::Object(Map::new())))
        {
            if let Some(metadata) = metadata.as_object_mut() {
                metadata.insert("uid".to_string(), Value::String(uid));
            }
        }
    }

    impl MemoryStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed an object as-is, assigning a UID when the caller left it out.
        pub fn insert<K: StoreObject>(&self, object: &K) {
            let namespace = object.namespace().unwrap_or_default();
            let name = object.name_any();
            let mut value = serde_json::to_value(object).expect("object serializes");
            let mut inner = self.inner.lock().unwrap();
            if object.uid().is_none() {
                inner.uid_counter += 1;
                let uid = format!("uid-{:04}", inner.uid_counter);
                set_uid(&mut value, uid);
            }
            inner.objects.insert(key::<K>(&namespace, &name), value);
        }

        /// Raw view of a stored object, for assertions.
        #[must_use]
        pub fn get_raw(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
            let inner = self.inner.lock().unwrap();
            inner
                .objects
                .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Set the server-owned `status` of a stored object. Returns false
        /// while the object does not exist yet.
        pub fn put_status(&self, kind: &str, namespace: &str, name: &str, status: Value) -> bool {
            let mut inner = self.inner.lock().unwrap();
            let Some(object) = inner.objects.get_mut(&(
                kind.to_string(),
                namespace.to_string(),
                name.to_string(),
            )) else {
                return false;
            };
            if let Some(map) = object.as_object_mut() {
                map.insert("status".to_string(), status);
            }
            true
        }

        #[must_use]
        pub fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
            self.get_raw(kind, namespace, name).is_some()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> StoreResult<K> {
            let value = self
                .get_raw(&K::kind(&()), namespace, name)
                .ok_or_else(|| StoreError::not_found::<K>(namespace, name))?;
            serde_json::from_value(value).map_err(|err| StoreError::Api(Box::new(err)))
        }

        async fn apply_forced<K: StoreObject>(&self, object: &K) -> StoreResult<K> {
            let namespace = object.namespace().unwrap_or_default();
            let name = object.name_any();
            let incoming =
                serde_json::to_value(object).map_err(|err| StoreError::Api(Box::new(err)))?;

            let mut inner = self.inner.lock().unwrap();
            let entry_key = key::<K>(&namespace, &name);
            let merged = match inner.objects.get(&entry_key) {
                Some(existing) => {
                    // Fields the operator sends win; server-owned fields
                    // (status, uid) survive because the apply never sends
                    // them.
                    let existing_uid = existing["metadata"]["uid"].clone();
                    let mut merged = existing.clone();
                    merge_value(&mut merged, &incoming);
                    if let Some(map) = merged["metadata"].as_object_mut() {
                        map.insert("uid".to_string(), existing_uid);
                    }
                    merged
                }
                None => {
                    inner.uid_counter += 1;
                    let uid = format!("uid-{:04}", inner.uid_counter);
                    let mut created = incoming;
                    set_uid(&mut created, uid);
                    created
                }
            };
            inner.objects.insert(entry_key, merged.clone());
            drop(inner);
            serde_json::from_value(merged).map_err(|err| StoreError::Api(Box::new(err)))
        }

        async fn patch_merge<K: StoreObject>(&self, object: &K) -> StoreResult<K> {
            let namespace = object.namespace().unwrap_or_default();
            let name = object.name_any();
            let patch =
                serde_json::to_value(object).map_err(|err| StoreError::Api(Box::new(err)))?;

            let mut inner = self.inner.lock().unwrap();
            let entry_key = key::<K>(&namespace, &name);
            let Some(existing) = inner.objects.get(&entry_key) else {
                return Err(StoreError::not_found::<K>(&namespace, &name));
            };
            let mut merged = existing.clone();
            merge_value(&mut merged, &patch);
            inner.objects.insert(entry_key, merged.clone());
            drop(inner);
            serde_json::from_value(merged).map_err(|err| StoreError::Api(Box::new(err)))
        }

        async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> StoreResult<()> {
            let mut inner = self.inner.lock().unwrap();
            inner
                .objects
                .remove(&key::<K>(namespace, name))
                .map(|_| ())
                .ok_or_else(|| StoreError::not_found::<K>(namespace, name))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::api::{LoadBalancer, LoadBalancerSpec, LoadBalancerStatus, LoadBalancerType};
        use kube::ResourceExt;

        fn lb(name: &str) -> LoadBalancer {
            let mut lb = LoadBalancer::new(name, LoadBalancerSpec::default());
            lb.metadata.namespace = Some("ns".to_string());
            lb
        }

        #[tokio::test]
        async fn apply_preserves_status_and_uid() {
            let store = MemoryStore::new();
            let first: LoadBalancer = store.apply_forced(&lb("a")).await.unwrap();
            let uid = first.uid().unwrap();
            assert!(store.put_status("LoadBalancer", "ns", "a", serde_json::json!({"ips": ["10.0.0.1"]})));

            let mut updated = lb("a");
            updated.spec.type_ = LoadBalancerType::Internal;
            let second = store.apply_forced(&updated).await.unwrap();

            assert_eq!(second.uid().unwrap(), uid);
            assert_eq!(second.spec.type_, LoadBalancerType::Internal);
            assert_eq!(
                second.status,
                Some(LoadBalancerStatus {
                    ips: vec!["10.0.0.1".to_string()]
                })
            );
        }

        #[tokio::test]
        async fn patch_merge_requires_existing_object() {
            let store = MemoryStore::new();
            let err = store.patch_merge(&lb("missing")).await.unwrap_err();
            assert!(err.is_not_found());
        }

        #[tokio::test]
        async fn delete_of_absent_object_is_not_found() {
            let store = MemoryStore::new();
            let err = store
                .delete::<LoadBalancer>("ns", "missing")
                .await
                .unwrap_err();
            assert!(err.is_not_found());
        }
    }
}
