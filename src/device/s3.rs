//! S3 object store
//!
//! The `s3` profile backend talks to Amazon S3 or any S3-compatible service
//! through `aws-sdk-s3`. The device layer is synchronous, so every client
//! owns a current-thread runtime and blocks on each request.
//!
//! S3 objects cannot be modified in place: a write downloads the object,
//! splices the new bytes in and uploads the result.
//!
//! ```text
//! backend = s3
//! host = minio.example.com:9000
//! use_https = false
//! access_key = ...
//! secret_key = ...
//! region = eu-west-1
//! ```

use super::object_store::{ObjectStoreClient, ObjectStoreConnector};
use super::profile::ObjectStoreProfile;
use super::status::ObjectStoreStatus;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::runtime::{Builder, Runtime};

const DEFAULT_REGION: &str = "us-east-1";

/// Connector for profiles with `backend = s3`
pub struct S3Connector;

impl ObjectStoreConnector for S3Connector {
    fn connect(
        &self,
        profile: &ObjectStoreProfile,
    ) -> Result<Box<dyn ObjectStoreClient>, ObjectStoreStatus> {
        let settings = S3Settings::from_profile(profile);
        Ok(Box::new(S3ObjectStore::connect(&settings)?))
    }
}

/// Connection settings taken from a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// `None` means the default AWS endpoint for the region
    pub endpoint: Option<String>,
    pub region: String,
    /// Static key pair; without one the default credential chain is used
    pub credentials: Option<(String, String)>,
}

impl S3Settings {
    pub fn from_profile(profile: &ObjectStoreProfile) -> Self {
        let scheme = if profile.use_https { "https" } else { "http" };
        let endpoint = profile.host.as_ref().map(|host| {
            if host.contains("://") {
                host.clone()
            } else {
                format!("{}://{}", scheme, host)
            }
        });
        let region = profile
            .extra
            .get("region")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let credentials = match (&profile.access_key, &profile.secret_key) {
            (Some(access), Some(secret)) => Some((access.clone(), secret.clone())),
            _ => None,
        };
        Self {
            endpoint,
            region,
            credentials,
        }
    }
}

pub struct S3ObjectStore {
    runtime: Runtime,
    client: Client,
}

impl S3ObjectStore {
    pub fn connect(settings: &S3Settings) -> Result<Self, ObjectStoreStatus> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                log::error!("cannot start S3 client runtime: {}", e);
                ObjectStoreStatus::Sys
            })?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        if let Some((access, secret)) = &settings.credentials {
            loader = loader.credentials_provider(Credentials::new(
                access.as_str(),
                secret.as_str(),
                None,
                None,
                "stordev-profile",
            ));
        }
        let sdk_config = runtime.block_on(loader.load());
        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        log::info!(
            "S3 client for {} in {}",
            settings.endpoint.as_deref().unwrap_or("AWS"),
            settings.region
        );
        Ok(Self {
            runtime,
            client: Client::from_conf(config),
        })
    }

    /// Whole object, or `None` if it does not exist
    fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreStatus> {
        self.runtime.block_on(async {
            match self.client.get_object().bucket(bucket).key(key).send().await {
                Ok(output) => {
                    let body = output.body.collect().await.map_err(|e| {
                        log::warn!("reading s3://{}/{} failed: {}", bucket, key, e);
                        ObjectStoreStatus::Io
                    })?;
                    Ok(Some(body.into_bytes().to_vec()))
                }
                Err(e) => match status_of(&e) {
                    ObjectStoreStatus::NoEnt => Ok(None),
                    status => {
                        log::warn!("get s3://{}/{}: {}", bucket, key, e);
                        Err(status)
                    }
                },
            }
        })
    }

    fn store(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), ObjectStoreStatus> {
        self.runtime.block_on(async {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| {
                    log::warn!("put s3://{}/{}: {}", bucket, key, e);
                    status_of(&e)
                })
        })
    }
}

/// Object key for a `/`-separated object path
fn object_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// HTTP range covering `len` bytes from `offset`
fn byte_range(offset: u64, len: usize) -> String {
    format!("bytes={}-{}", offset, offset + len as u64 - 1)
}

/// Status for an S3 error code
pub fn status_for_code(code: Option<&str>) -> ObjectStoreStatus {
    match code {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => ObjectStoreStatus::NoEnt,
        Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
            ObjectStoreStatus::Perm
        }
        Some("KeyTooLongError") => ObjectStoreStatus::NameTooLong,
        Some("InvalidRange") | Some("InvalidArgument") => ObjectStoreStatus::Inval,
        Some("RequestTimeout") | Some("SlowDown") => ObjectStoreStatus::Timeout,
        Some("PermanentRedirect") | Some("TemporaryRedirect") => ObjectStoreStatus::Redirect,
        Some("EntityTooLarge") => ObjectStoreStatus::Limit,
        Some("OperationAborted") => ObjectStoreStatus::Conflict,
        Some("NotImplemented") => ObjectStoreStatus::NotSupp,
        _ => ObjectStoreStatus::Failure,
    }
}

fn status_of<E, R>(err: &SdkError<E, R>) -> ObjectStoreStatus
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) => ObjectStoreStatus::Timeout,
        SdkError::DispatchFailure(_) => ObjectStoreStatus::Connect,
        SdkError::ServiceError(service) => status_for_code(service.err().code()),
        _ => ObjectStoreStatus::Failure,
    }
}

impl ObjectStoreClient for S3ObjectStore {
    fn stat(&self, bucket: &str, path: &str) -> Result<u64, ObjectStoreStatus> {
        let key = object_key(path);
        self.runtime.block_on(async {
            match self.client.head_object().bucket(bucket).key(key).send().await {
                Ok(output) => Ok(output.content_length().unwrap_or(0).max(0) as u64),
                Err(SdkError::ServiceError(service)) if service.err().is_not_found() => {
                    Err(ObjectStoreStatus::NoEnt)
                }
                Err(e) => Err(status_of(&e)),
            }
        })
    }

    /// S3 has no directories; prefixes exist implicitly.
    fn mkdir(&self, _bucket: &str, _path: &str) -> Result<(), ObjectStoreStatus> {
        Ok(())
    }

    fn create(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus> {
        self.store(bucket, object_key(path), Vec::new())
    }

    fn read_at(
        &self,
        bucket: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ObjectStoreStatus> {
        if buf.is_empty() {
            return Ok(0);
        }
        let key = object_key(path);
        let range = byte_range(offset, buf.len());
        self.runtime.block_on(async {
            let output = match self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .range(range)
                .send()
                .await
            {
                Ok(output) => output,
                // offset at or past the end of the object
                Err(e) if e.code() == Some("InvalidRange") => return Ok(0),
                Err(e) => return Err(status_of(&e)),
            };
            let body = output
                .body
                .collect()
                .await
                .map_err(|_| ObjectStoreStatus::Io)?
                .into_bytes();
            let n = body.len().min(buf.len());
            buf[..n].copy_from_slice(&body[..n]);
            Ok(n)
        })
    }

    fn write_at(
        &self,
        bucket: &str,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ObjectStoreStatus> {
        let key = object_key(path);
        let mut object = self
            .fetch(bucket, key)?
            .ok_or(ObjectStoreStatus::NoEnt)?;
        let start = usize::try_from(offset).map_err(|_| ObjectStoreStatus::Limit)?;
        splice(&mut object, start, data);
        self.store(bucket, key, object)?;
        Ok(data.len())
    }

    fn unlink(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus> {
        // delete_object succeeds for missing keys
        self.stat(bucket, path)?;
        let key = object_key(path);
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| status_of(&e))
        })
    }
}

/// Overwrite `object` at `start` with `data`, zero-filling any gap.
fn splice(object: &mut Vec<u8>, start: usize, data: &[u8]) {
    let end = start + data.len();
    if object.len() < end {
        object.resize(end, 0);
    }
    object[start..end].copy_from_slice(data);
}
