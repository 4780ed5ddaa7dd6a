use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{Bytes, ObjectStore};
use crate::Error;

/// In-process object store.
///
/// Buckets and objects only live as long as the store itself.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// List the keys of `bucket` in lexicographic order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .unwrap()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace an existing object in place, returning the previous content.
    pub fn replace_object(&self, bucket: &str, key: &str, data: Bytes) -> Option<Bytes> {
        self.buckets.write().unwrap().get_mut(bucket)?.get_mut(key).map(|object| std::mem::replace(object, data))
    }

    pub fn remove_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets.write().unwrap().get_mut(bucket)?.remove(key)
    }
}

impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error> {
        Ok(self.buckets.read().unwrap().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), Error> {
        self.buckets.write().unwrap().entry(bucket.to_owned()).or_default();

        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), Error> {
        let mut buckets = self.buckets.write().unwrap();

        let objects = buckets.get_mut(bucket).ok_or_else(|| Error::NotFound {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        })?;
        objects.insert(key.to_owned(), data);

        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, Error> {
        self.buckets
            .read()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }
}
