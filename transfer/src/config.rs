//! Transfer and object store configuration.
//!
//! Both configurations are plain values, built once (from the environment or by hand) and handed over to the components that
//! need them. Nothing falls back to a default endpoint or credentials: a missing value is a configuration error.

use std::num::{NonZeroU32, NonZeroU64, NonZeroUsize};
use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::pool::{FailurePolicy, RetryPolicy};
use crate::Error;

pub const DEFAULT_CHUNK_SIZE: NonZeroU64 = unsafe { NonZeroU64::new_unchecked(20 * 1_024 * 1_024) };
pub const DEFAULT_WORKERS: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(16) };
pub const DEFAULT_BUCKET: &str = "transfers";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Which set of object store variables to read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Publicly exposed server, always reached over TLS.
    Public,
    /// Private server, reached over plain HTTP.
    Private,
}

impl Profile {
    /// Names of the endpoint, user and password variables.
    fn variables(self) -> [&'static str; 3] {
        match self {
            Self::Public => ["MINIO_PUBLIC_SERVER", "MINIO_PUBLIC_USER", "MINIO_PUBLIC_PASSWORD"],
            Self::Private => ["MINIO_SERVER", "MINIO_ROOT_USER", "MINIO_ROOT_PASSWORD"],
        }
    }
}

/// Object store connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Server address, either `host[:port]` or a full URL.
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Use TLS when the endpoint does not specify a scheme.
    pub secure: bool,
    pub region: String,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("secure", &self.secure)
            .field("region", &self.region)
            .finish()
    }
}

impl StoreConfig {
    /// Read the settings of `profile` from the process environment.
    pub fn from_env(profile: Profile) -> Self {
        Self::from_lookup(profile, |name| std::env::var(name).ok())
    }

    /// Read the settings of `profile` through `lookup`.
    ///
    /// Empty values are treated as missing ones.
    pub fn from_lookup(profile: Profile, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let [endpoint, user, password] = profile.variables().map(|name| lookup(name).filter(|value| !value.is_empty()));

        Self {
            endpoint,
            access_key: user,
            secret_key: password,
            secure: profile == Profile::Public,
            region: lookup("MINIO_REGION").filter(|value| !value.is_empty()).unwrap_or_else(|| DEFAULT_REGION.into()),
        }
    }

    /// Check that every required value is present and usable.
    pub fn validate(&self) -> Result<(), Error> {
        self.base_url()?;
        self.credentials()?;

        Ok(())
    }

    /// Return the endpoint as a base URL.
    pub fn base_url(&self) -> Result<Url, Error> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| Error::Config("missing object store endpoint".into()))?;

        let url = if endpoint.contains("://") {
            endpoint.to_owned()
        } else {
            format!("{}://{endpoint}", if self.secure { "https" } else { "http" })
        };

        let url = Url::parse(&url).map_err(|err| Error::Config(format!("invalid object store endpoint `{endpoint}`: {err}")))?;

        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::Config(format!("invalid object store endpoint `{endpoint}`")));
        }

        Ok(url)
    }

    /// Return the access and secret keys.
    pub fn credentials(&self) -> Result<(&str, &str), Error> {
        match (self.access_key.as_deref(), self.secret_key.as_deref()) {
            (Some(access_key), Some(secret_key)) => Ok((access_key, secret_key)),
            (None, _) => Err(Error::Config("missing object store access key".into())),
            (_, None) => Err(Error::Config("missing object store secret key".into())),
        }
    }
}

/// Transfer job settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bucket holding manifests and chunks.
    pub bucket: String,
    pub chunk_size: NonZeroU64,
    /// Number of chunks transferred concurrently.
    pub workers: NonZeroUsize,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    /// Root directory of the per-job work areas.
    pub work_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            work_dir: std::env::temp_dir(),
        }
    }
}

impl Config {
    /// Read the settings from the process environment, on top of the defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the settings through `lookup`, on top of the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        fn parse<T: FromStr>(name: &str, value: Option<String>) -> Result<Option<T>, Error> {
            value
                .map(|value| value.parse().map_err(|_| Error::Config(format!("invalid value `{value}` for {name}"))))
                .transpose()
        }

        let mut config = Self::default();

        if let Some(bucket) = lookup("TRANSFER_BUCKET") {
            config.bucket = bucket;
        }
        if let Some(chunk_size) = parse::<NonZeroU64>("TRANSFER_CHUNK_SIZE", lookup("TRANSFER_CHUNK_SIZE"))? {
            config.chunk_size = chunk_size;
        }
        if let Some(workers) = parse::<NonZeroUsize>("TRANSFER_WORKERS", lookup("TRANSFER_WORKERS"))? {
            config.workers = workers;
        }
        if let Some(retries) = parse::<NonZeroU32>("TRANSFER_RETRIES", lookup("TRANSFER_RETRIES"))? {
            config.retry.max_attempts = retries;
        }
        if let Some(work_dir) = lookup("TRANSFER_WORK_DIR") {
            config.work_dir = work_dir.into();
        }

        config.validate()?;

        Ok(config)
    }

    #[inline]
    pub fn with_bucket(self, bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..self
        }
    }

    #[inline]
    pub fn with_chunk_size(self, chunk_size: NonZeroU64) -> Self {
        Self { chunk_size, ..self }
    }

    #[inline]
    pub fn with_workers(self, workers: NonZeroUsize) -> Self {
        Self { workers, ..self }
    }

    #[inline]
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    #[inline]
    pub fn with_failure_policy(self, failure_policy: FailurePolicy) -> Self {
        Self { failure_policy, ..self }
    }

    #[inline]
    pub fn with_work_dir(self, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..self
        }
    }

    /// Check the bucket name against S3 naming rules.
    pub fn validate(&self) -> Result<(), Error> {
        let bucket = self.bucket.as_str();

        let valid = (3..=63).contains(&bucket.len())
            && bucket.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
            && bucket.starts_with(|c: char| c.is_ascii_alphanumeric())
            && bucket.ends_with(|c: char| c.is_ascii_alphanumeric());

        if !valid {
            return Err(Error::Config(format!("invalid bucket name `{bucket}`")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_store_config_profiles() {
        let vars = lookup(&[
            ("MINIO_PUBLIC_SERVER", "play.example.com"),
            ("MINIO_PUBLIC_USER", "public"),
            ("MINIO_PUBLIC_PASSWORD", "secret"),
            ("MINIO_SERVER", "10.0.0.2:9000"),
            ("MINIO_ROOT_USER", "root"),
            ("MINIO_ROOT_PASSWORD", "rootsecret"),
        ]);

        let public = StoreConfig::from_lookup(Profile::Public, &vars);
        public.validate().unwrap();
        assert!(public.secure);
        assert_eq!(public.base_url().unwrap().as_str(), "https://play.example.com/");
        assert_eq!(public.credentials().unwrap(), ("public", "secret"));
        assert_eq!(public.region, DEFAULT_REGION);

        let private = StoreConfig::from_lookup(Profile::Private, &vars);
        private.validate().unwrap();
        assert!(!private.secure);
        assert_eq!(private.base_url().unwrap().as_str(), "http://10.0.0.2:9000/");
        assert_eq!(private.credentials().unwrap(), ("root", "rootsecret"));
    }

    #[test]
    fn test_store_config_fails_fast() {
        let missing_endpoint = StoreConfig::from_lookup(Profile::Private, lookup(&[("MINIO_ROOT_USER", "root"), ("MINIO_ROOT_PASSWORD", "pw")]));
        let err = missing_endpoint.validate().unwrap_err();
        assert!(err.to_string().contains("endpoint"), "{err}");

        let empty_secret = StoreConfig::from_lookup(
            Profile::Private,
            lookup(&[("MINIO_SERVER", "localhost:9000"), ("MINIO_ROOT_USER", "root"), ("MINIO_ROOT_PASSWORD", "")]),
        );
        let err = empty_secret.validate().unwrap_err();
        assert!(err.to_string().contains("secret key"), "{err}");

        let bad_scheme = StoreConfig {
            endpoint: Some("ftp://localhost".into()),
            ..empty_secret
        };
        assert!(matches!(bad_scheme.base_url(), Err(Error::Config(_))));
    }

    #[test]
    fn test_store_config_hides_secret() {
        let config = StoreConfig::from_lookup(Profile::Private, lookup(&[("MINIO_ROOT_PASSWORD", "hunter2")]));

        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_config_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("TRANSFER_BUCKET", "video-analytics-dev"),
            ("TRANSFER_CHUNK_SIZE", "8388608"),
            ("TRANSFER_WORKERS", "8"),
            ("TRANSFER_RETRIES", "5"),
            ("TRANSFER_WORK_DIR", "/var/tmp/transfers"),
        ]))
        .unwrap();

        assert_eq!(config.bucket, "video-analytics-dev");
        assert_eq!(config.chunk_size.get(), 8 * 1_024 * 1_024);
        assert_eq!(config.workers.get(), 8);
        assert_eq!(config.retry.max_attempts.get(), 5);
        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/transfers"));

        let defaults = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(defaults, Config::default());
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        for vars in [
            &[("TRANSFER_CHUNK_SIZE", "0")][..],
            &[("TRANSFER_WORKERS", "many")],
            &[("TRANSFER_RETRIES", "-1")],
            &[("TRANSFER_BUCKET", "Videos")],
            &[("TRANSFER_BUCKET", "ab")],
            &[("TRANSFER_BUCKET", "-videos")],
        ] {
            assert!(matches!(Config::from_lookup(lookup(vars)), Err(Error::Config(_))), "{vars:?}");
        }
    }
}
