use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::{fmt, time::Duration};
use tracing::{debug, trace};
use url::Url;

use super::{ObjectStore, StorageError, StorageResult};

const SERVICE: &str = "s3";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";
const ERROR_BODY_LIMIT: usize = 512;

type HmacSha256 = Hmac<Sha256>;

/// Static access key pair. The secret is redacted from `Debug` output.
#[derive(Clone)]
pub struct S3Credentials {
    /// Access key id, sent in the clear.
    pub access_key_id: String,
    /// Secret used to derive signing keys.
    pub secret_access_key: String,
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Connection settings for [`S3ObjectStore`].
#[derive(Clone, Debug)]
pub struct S3Config {
    /// Base URL; buckets are addressed as its first path segment.
    pub endpoint: Url,
    /// Region used in the signature scope.
    pub region: String,
    /// Key pair used to sign every request.
    pub credentials: S3Credentials,
    /// Per-request limit, connect included.
    pub request_timeout: Duration,
}

/// S3-compatible client using path-style addressing and SigV4 signing.
#[derive(Clone)]
pub struct S3ObjectStore {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    credentials: S3Credentials,
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .finish()
    }
}

struct SignedRequest {
    url: Url,
    authorization: String,
    amz_date: String,
    content_sha256: String,
}

impl S3ObjectStore {
    /// Builds the HTTP client. Fails when the endpoint has no host.
    pub fn new(config: S3Config) -> StorageResult<Self> {
        if config.endpoint.cannot_be_a_base() || config.endpoint.host_str().is_none()
        {
            return Err(StorageError::InvalidEndpoint(
                config.endpoint.to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint,
            region: config.region,
            credentials: config.credentials,
        })
    }

    /// Builds the URI-encoded `/<bucket>/<key>` path under the endpoint's
    /// own base path.
    fn canonical_uri(&self, bucket: &str, key: &str) -> StorageResult<String> {
        if bucket.is_empty() || bucket.contains('/') {
            return Err(StorageError::InvalidKey(bucket.to_string()));
        }
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        let mut uri = self.endpoint.path().trim_end_matches('/').to_string();
        uri.push('/');
        uri.push_str(&urlencoding::encode(bucket));
        for segment in key.split('/') {
            uri.push('/');
            uri.push_str(&urlencoding::encode(segment));
        }
        Ok(uri)
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn sign(
        &self,
        method: &Method,
        bucket: &str,
        key: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> StorageResult<SignedRequest> {
        let canonical_uri = self.canonical_uri(bucket, key)?;
        let mut url = self.endpoint.clone();
        url.set_path(&canonical_uri);
        url.set_query(None);

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let content_sha256 = hex::encode(Sha256::digest(payload));

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n\nhost:{host}\nx-amz-content-sha256:{content_sha256}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{content_sha256}",
            method = method.as_str(),
            host = self.host_header(),
        );
        trace!(%canonical_request, "s3 canonical request");

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(
            &self.credentials.secret_access_key,
            &date,
            &self.region,
            SERVICE,
        );
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            self.credentials.access_key_id
        );

        Ok(SignedRequest {
            url,
            authorization,
            amz_date,
            content_sha256,
        })
    }

    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> StorageResult<reqwest::Response> {
        let signed = self.sign(&method, bucket, key, &body, Utc::now())?;
        let mut request = self
            .http
            .request(method, signed.url)
            .header("authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256);
        if !body.is_empty() {
            request = request.body(body);
        }
        Ok(request.send().await?)
    }
}

async fn status_error(
    response: reqwest::Response,
    bucket: &str,
    key: &str,
) -> StorageError {
    let status = response.status();
    match status {
        StatusCode::NOT_FOUND => StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::Unauthorized {
                bucket: bucket.to_string(),
                key: key.to_string(),
                status: status.as_u16(),
            }
        }
        _ => {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            StorageError::Status {
                bucket: bucket.to_string(),
                key: key.to_string(),
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
        let response = self.send(Method::GET, bucket, key, Vec::new()).await?;
        if !response.status().is_success() {
            return Err(status_error(response, bucket, key).await);
        }
        let bytes = response.bytes().await?;
        debug!(bucket, key, size = bytes.len(), "blob downloaded");
        Ok(bytes.to_vec())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> StorageResult<()> {
        let size = bytes.len();
        let response = self.send(Method::PUT, bucket, key, bytes).await?;
        if !response.status().is_success() {
            return Err(status_error(response, bucket, key).await);
        }
        debug!(bucket, key, size, "blob uploaded");
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key)
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derives the SigV4 signing key for one day, region and service.
pub fn signing_key(
    secret_access_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{secret_access_key}").as_bytes(),
        date.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}
