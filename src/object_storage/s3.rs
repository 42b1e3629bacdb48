use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rusoto_core::credential::{AwsCredentials, StaticProvider};
use rusoto_core::{Client, HttpClient, Region, RusotoError};
use rusoto_s3::util::{PreSignedRequest, PreSignedRequestOption};
use rusoto_s3::{GetObjectRequest, PutObjectRequest, S3 as RusotoS3, S3Client};
use tokio::io::AsyncReadExt;
use url::Url;

use crate::object_storage::{ObjectStorage, ObjectStorageError, validate_key};

/// Client-side bound on each store call.
const STORE_CALL_TIMEOUT: Duration = Duration::from_secs(60);

async fn bounded<T, F>(key: &str, call: F) -> Result<T, ObjectStorageError>
where
    F: std::future::Future<Output = Result<T, ObjectStorageError>>,
{
    match tokio::time::timeout(STORE_CALL_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => Err(ObjectStorageError::StorageUnavailable {
            key: key.to_string(),
            raw_error_message: format!("deadline of {STORE_CALL_TIMEOUT:?} expired"),
        }),
    }
}

/// S3-compatible implementation of the object store gateway. The temp bucket
/// carries a TTL lifecycle rule; this code never deletes.
pub struct S3ObjectStorage {
    bucket: String,
    region: Region,
    access_key_id: String,
    secret_access_key: String,
}

impl S3ObjectStorage {
    pub fn new(bucket: String, region_name: String, endpoint: Option<String>, access_key_id: String, secret_access_key: String) -> Self {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                name: region_name,
                endpoint,
            },
            None => Region::from_str(&region_name).unwrap_or(Region::UsEast1),
        };

        S3ObjectStorage {
            bucket,
            region,
            access_key_id,
            secret_access_key,
        }
    }

    fn credentials(&self) -> AwsCredentials {
        AwsCredentials::new(self.access_key_id.clone(), self.secret_access_key.clone(), None, None)
    }

    fn client(&self) -> Result<S3Client, ObjectStorageError> {
        let http_client = HttpClient::new().map_err(|err| ObjectStorageError::StorageUnavailable {
            key: String::new(),
            raw_error_message: format!("cannot create http client: {err}"),
        })?;
        let provider = StaticProvider::new(self.access_key_id.clone(), self.secret_access_key.clone(), None, None);

        Ok(S3Client::new_with_client(
            Client::new_with(provider, http_client),
            self.region.clone(),
        ))
    }

    fn map_error<E: std::error::Error + 'static>(key: &str, err: RusotoError<E>) -> ObjectStorageError {
        match err {
            RusotoError::Unknown(response) => {
                let body = String::from_utf8_lossy(&response.body).to_string();
                if response.status.as_u16() == 404 {
                    ObjectStorageError::ObjectNotFound { key: key.to_string() }
                } else if body.contains("QuotaExceeded") || response.status.as_u16() == 507 {
                    ObjectStorageError::QuotaExceeded {
                        key: key.to_string(),
                        raw_error_message: body,
                    }
                } else {
                    ObjectStorageError::StorageUnavailable {
                        key: key.to_string(),
                        raw_error_message: format!("status {}: {}", response.status, body),
                    }
                }
            }
            other => ObjectStorageError::StorageUnavailable {
                key: key.to_string(),
                raw_error_message: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStorageError> {
        validate_key(key)?;

        let client = self.client()?;
        info!("uploading {} bytes to s3://{}/{}", body.len(), self.bucket, key);

        bounded(key, async {
            client
                .put_object(PutObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    body: Some(body.into()),
                    ..Default::default()
                })
                .await
                .map_err(|err| Self::map_error(key, err))
        })
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStorageError> {
        validate_key(key)?;

        let client = self.client()?;

        bounded(key, async {
            let output = client
                .get_object(GetObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(|err| Self::map_error(key, err))?;

            let body = output
                .body
                .ok_or_else(|| ObjectStorageError::ObjectNotFound { key: key.to_string() })?;

            let mut bytes = Vec::new();
            body.into_async_read()
                .read_to_end(&mut bytes)
                .await
                .map_err(|err| ObjectStorageError::StorageUnavailable {
                    key: key.to_string(),
                    raw_error_message: err.to_string(),
                })?;

            Ok(bytes)
        })
        .await
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<Url, ObjectStorageError> {
        validate_key(key)?;

        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            ..Default::default()
        };

        let raw = request.get_presigned_url(
            &self.region,
            &self.credentials(),
            &PreSignedRequestOption { expires_in: ttl },
        );

        Url::parse(&raw).map_err(|err| ObjectStorageError::CannotPresign {
            key: key.to_string(),
            raw_error_message: err.to_string(),
        })
    }
}
