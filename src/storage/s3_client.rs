//! S3-compatible storage client
//!
//! Wraps the AWS SDK. The bucket comes from each canonical path, so one client
//! serves every bucket the credentials can read.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use bytes::{Bytes, BytesMut};

use super::too_large;
use crate::config::S3Config;
use crate::error::{ConfigError, PublicationError};

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
}

impl S3Client {
    /// Create a new S3 client from configuration.
    ///
    /// Static credentials are used when both keys are set, otherwise the
    /// default AWS provider chain (environment, profile, instance metadata).
    pub async fn new(config: &S3Config) -> Result<Self, ConfigError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "webpub-server",
            ));
        }

        let sdk_config = loader.load().await;
        if sdk_config.credentials_provider().is_none() {
            return Err(ConfigError::S3Credentials(
                "no credentials provider available".to_string(),
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.use_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        tracing::info!(
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            path_style = config.use_path_style,
            "S3 client ready"
        );

        Ok(Self { client })
    }

    /// Get an object's data, refusing objects over `limit` bytes
    pub async fn get_object(&self, bucket: &str, key: &str, limit: u64) -> Result<Bytes, PublicationError> {
        let mut response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false)
                    || e.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if missing {
                    PublicationError::NotFound(format!("s3://{}/{}", bucket, key))
                } else {
                    PublicationError::Backend(format!("failed to get s3://{}/{}: {}", bucket, key, e))
                }
            })?;

        let location = format!("s3://{}/{}", bucket, key);
        let declared = response.content_length().and_then(|length| u64::try_from(length).ok());
        if declared.is_some_and(|length| length > limit) {
            return Err(too_large(&location, limit));
        }

        let mut data = BytesMut::new();
        while let Some(chunk) = response
            .body
            .try_next()
            .await
            .map_err(|e| PublicationError::Backend(format!("failed to read {}: {}", location, e)))?
        {
            if (data.len() + chunk.len()) as u64 > limit {
                return Err(too_large(&location, limit));
            }
            data.extend_from_slice(&chunk);
        }

        Ok(data.freeze())
    }
}
