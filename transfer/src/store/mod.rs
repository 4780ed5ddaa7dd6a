//! Object store access.
//!
//! The transfer pipeline only ever talks to an object store through the [`ObjectStore`] trait. Implementations are shared by
//! every worker of a job and must not rely on per-call mutable state.

use std::future::Future;

pub use bytes::Bytes;

use crate::Error;

mod http;
pub use http::*;

mod memory;
pub use memory::*;

mod sign;

/// Object store interface.
pub trait ObjectStore: Send + Sync + 'static {
    /// Check whether `bucket` exists.
    fn bucket_exists(&self, bucket: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Create `bucket`, succeeding when it already exists.
    fn create_bucket(&self, bucket: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Store `data` as `key` in `bucket`, replacing any existing object.
    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Fetch the whole object `key` from `bucket`.
    ///
    /// Fails with [`Error::NotFound`] when there is no such object.
    fn get_object(&self, bucket: &str, key: &str) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Create `bucket` unless it already exists.
    fn ensure_bucket(&self, bucket: &str) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            if !self.bucket_exists(bucket).await? {
                tracing::info!("Creating bucket `{bucket}`...");

                self.create_bucket(bucket).await?;
            }

            Ok(())
        }
    }
}

impl<S: ObjectStore> ObjectStore for std::sync::Arc<S> {
    #[inline]
    fn bucket_exists(&self, bucket: &str) -> impl Future<Output = Result<bool, Error>> + Send {
        (**self).bucket_exists(bucket)
    }

    #[inline]
    fn create_bucket(&self, bucket: &str) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).create_bucket(bucket)
    }

    #[inline]
    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).put_object(bucket, key, data)
    }

    #[inline]
    fn get_object(&self, bucket: &str, key: &str) -> impl Future<Output = Result<Bytes, Error>> + Send {
        (**self).get_object(bucket, key)
    }
}
