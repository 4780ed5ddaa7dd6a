use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, StatusCode};
use tokio::sync::Semaphore;
use url::Url;

pub use reqwest::Client;

use super::sign::Signer;
use super::{Bytes, ObjectStore};
use crate::config::StoreConfig;
use crate::Error;

const MAX_HTTP_REQUESTS: usize = 50;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Bytes escaped in a path segment: everything but the SigV4 unreserved characters.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// S3-compatible object store over HTTP.
///
/// Objects are addressed path-style (`{endpoint}/{bucket}/{key}`) and every request is signed with the configured credentials.
/// Cloning is cheap, clones share the same connection pool and in-flight request limit.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base: Url,
    signer: Arc<Signer>,
    requests: Arc<Semaphore>,
}

impl HttpStore {
    /// Create a store for a validated `config`.
    pub fn new(config: &StoreConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Self::with_client(config, client)
    }

    /// Create a store for a validated `config`, sending requests through `client`.
    pub fn with_client(config: &StoreConfig, client: Client) -> Result<Self, Error> {
        let (access_key, secret_key) = config.credentials()?;

        Ok(Self {
            client,
            base: config.base_url()?,
            signer: Arc::new(Signer::new(access_key.to_owned(), secret_key.to_owned(), config.region.clone())),
            requests: Arc::new(Semaphore::new(MAX_HTTP_REQUESTS)),
        })
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Return the URL of `key` in `bucket`, or of `bucket` itself without key.
    ///
    /// The URL path is already in canonical form, ready to be signed.
    fn url(&self, bucket: &str, key: Option<&str>) -> Result<Url, Error> {
        if self.base.cannot_be_a_base() {
            return Err(Error::Config(format!("endpoint `{}` cannot be a base URL", self.base)));
        }

        let mut path = self.base.path().trim_end_matches('/').to_owned();
        for segment in std::iter::once(bucket).chain(key.into_iter().flat_map(|key| key.split('/'))) {
            path.push('/');
            path.extend(utf8_percent_encode(segment, SEGMENT));
        }

        let mut url = self.base.clone();
        url.set_path(&path);

        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Bytes) -> Result<reqwest::Response, Error> {
        let _permit = self.requests.acquire().await.map_err(|_| std::io::Error::other("HTTP store is closed"))?;

        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_owned(),
        };
        let signed = self.signer.sign(method.as_str(), &host, url.path(), &body, chrono::Utc::now());

        tracing::trace!("{method} {url}");

        let resp = self
            .client
            .request(method, url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header(reqwest::header::AUTHORIZATION, signed.authorization)
            .body(body)
            .send()
            .await?;

        Ok(resp)
    }
}

fn status_error(status: StatusCode, resource: String) -> Error {
    Error::Status {
        status: status.as_u16(),
        resource,
    }
}

impl ObjectStore for HttpStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error> {
        let resp = self.send(Method::HEAD, self.url(bucket, None)?, Bytes::new()).await?;

        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(status, bucket.to_owned())),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), Error> {
        let resp = self.send(Method::PUT, self.url(bucket, None)?, Bytes::new()).await?;

        match resp.status() {
            status if status.is_success() => Ok(()),
            // owned by us already, or created concurrently
            StatusCode::CONFLICT => Ok(()),
            status => Err(status_error(status, bucket.to_owned())),
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), Error> {
        let resp = self.send(Method::PUT, self.url(bucket, Some(key))?, data).await?;

        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            }),
            status => Err(status_error(status, format!("{bucket}/{key}"))),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, Error> {
        let mut resp = self.send(Method::GET, self.url(bucket, Some(key))?, Bytes::new()).await?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::NotFound {
                    bucket: bucket.to_owned(),
                    key: key.to_owned(),
                })
            }
            status => return Err(status_error(status, format!("{bucket}/{key}"))),
        }

        let capacity = resp.content_length().unwrap_or_default().try_into().unwrap_or_default();
        let mut data = BytesMut::with_capacity(capacity);

        while let Some(chunk) = resp.chunk().await? {
            data.extend_from_slice(&chunk);
        }

        Ok(data.freeze())
    }
}
