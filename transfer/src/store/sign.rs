//! AWS Signature Version 4 request signing, as required by S3-compatible stores.

use chrono::{DateTime, Utc};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Headers to add to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

#[derive(Debug, Clone)]
pub(super) struct Signer {
    access_key: String,
    secret_key: String,
    region: String,
}

impl Signer {
    pub fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
        }
    }

    /// Sign a request without query string.
    ///
    /// `path` must already be URI-encoded and `host` must include the port when it is not the scheme default.
    pub fn sign(&self, method: &str, host: &str, path: &str, payload: &[u8], now: DateTime<Utc>) -> SignedHeaders {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let content_sha256 = hex::encode(Sha256::digest(payload));

        let canonical_headers = format!("host:{host}\nx-amz-content-sha256:{content_sha256}\nx-amz-date:{amz_date}\n");
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!("{method}\n{path}\n\n{canonical_headers}\n{signed_headers}\n{content_sha256}");

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(&self.secret_key, &date, &self.region, SERVICE);
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        SignedHeaders {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key
            ),
            amz_date,
            content_sha256,
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> [u8; 32] {
    let key = hmac(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let key = hmac(&key, region.as_bytes());
    let key = hmac(&key, service.as_bytes());
    hmac(&key, b"aws4_request")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const SECRET_KEY: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    #[test]
    fn test_signing_key() {
        let key = signing_key(SECRET_KEY, "20120215", "us-east-1", "iam");

        assert_eq!(hex::encode(key), "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d");
    }

    #[test]
    fn test_hmac_accepts_any_key_length() {
        // RFC 4231 test case 6, with a key longer than the SHA-256 block
        let key = [0xaa; 131];

        assert_eq!(
            hex::encode(hmac(&key, b"Test Using Larger Than Block-Size Key - Hash Key First")),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
        assert_eq!(hmac(b"", b"").len(), 32);
    }

    #[test]
    fn test_sign() {
        let signer = Signer::new("AKIDEXAMPLE".into(), SECRET_KEY.into(), "us-east-1".into());
        let now = Utc.with_ymd_and_hms(2013, 5, 24, 0, 0, 0).unwrap();

        let headers = signer.sign("PUT", "localhost:9000", "/videos/yt_md/part0", b"payload", now);

        assert_eq!(headers.amz_date, "20130524T000000Z");
        assert_eq!(headers.content_sha256, hex::encode(Sha256::digest(b"payload")));
        assert!(headers.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20130524/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));

        let signature = headers.authorization.rsplit_once("Signature=").unwrap().1;
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| b.is_ascii_hexdigit()));

        assert_eq!(signer.sign("PUT", "localhost:9000", "/videos/yt_md/part0", b"payload", now), headers);
        assert_ne!(signer.sign("PUT", "localhost:9000", "/videos/yt_md/part1", b"payload", now), headers);
        assert_ne!(signer.sign("GET", "localhost:9000", "/videos/yt_md/part0", b"payload", now), headers);
    }
}
