//! S3-compatible backend (AWS S3, Cloudflare R2) built on `aws-sdk-s3`.
//!
//! Compiled only with the `backend-s3` feature.

use crate::{
    models::object::{ObjectBody, ObjectMeta},
    services::gateway::{
        ListPage, ObjectGateway, PresignMethod, PresignedUrl, StorageError, StorageResult,
    },
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{Region, http::HttpResponse},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::{ByteStream, DateTime as SmithyDateTime},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the ambient AWS credential chain. R2 needs an
    /// explicit endpoint and region `auto`.
    pub async fn connect(bucket: &str, region: &str, endpoint: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        Self::new(Client::from_conf(config), bucket)
    }

    fn sanitize_etag(etag: Option<&str>) -> Option<String> {
        etag.map(|value| value.trim_matches('"').to_string())
    }

    fn copy_source(&self, key: &str) -> String {
        let encoded = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.bucket, encoded)
    }
}

fn to_chrono(value: Option<&SmithyDateTime>) -> DateTime<Utc> {
    value
        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

type S3Error<E> = SdkError<E, HttpResponse>;

fn status_of<E>(err: &S3Error<E>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

fn backend_error<E>(operation: &str, err: S3Error<E>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let code = err.code().unwrap_or("unknown").to_string();
    StorageError::Backend(format!(
        "{operation} failed ({code}): {}",
        DisplayErrorContext(&err)
    ))
}

#[async_trait]
impl ObjectGateway for S3ObjectStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StorageResult<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_string))
            .set_continuation_token(continuation_token.map(str::to_string))
            .send()
            .await
            .map_err(|err| backend_error("list_objects_v2", err))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectMeta {
                    key: object.key()?.to_string(),
                    content_type: None,
                    size_bytes: object.size().unwrap_or_default(),
                    etag: Self::sanitize_etag(object.e_tag()),
                    last_modified: to_chrono(object.last_modified()),
                })
            })
            .collect();
        let common_prefixes = output
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();
        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            common_prefixes,
            next_token,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Option<ObjectBody>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Ok(None);
            }
            Err(err) => return Err(backend_error("get_object", err)),
        };

        let meta = ObjectMeta {
            key: key.to_string(),
            content_type: response.content_type().map(str::to_string),
            size_bytes: response.content_length().unwrap_or_default(),
            etag: Self::sanitize_etag(response.e_tag()),
            last_modified: to_chrono(response.last_modified()),
        };
        let collected = response
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Backend(format!("read body failed: {err}")))?;
        Ok(Some(ObjectBody {
            meta,
            bytes: collected.into_bytes(),
        }))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                content_type: response.content_type().map(str::to_string),
                size_bytes: response.content_length().unwrap_or_default(),
                etag: Self::sanitize_etag(response.e_tag()),
                last_modified: to_chrono(response.last_modified()),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(backend_error("head_object", err)),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        let size_bytes = body.len() as i64;
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|err| backend_error("put_object", err))?;
        debug!(key, size_bytes, "stored object");
        Ok(ObjectMeta {
            key: key.to_string(),
            content_type: content_type.map(str::to_string),
            size_bytes,
            etag: Self::sanitize_etag(output.e_tag()),
            last_modified: Utc::now(),
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| backend_error("delete_object", err))?;
        Ok(())
    }

    async fn delete_if_match(&self, key: &str, etag: &str) -> StorageResult<()> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .if_match(format!("\"{etag}\""))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if matches!(status_of(&err), Some(404 | 412)) => {
                Err(StorageError::PreconditionFailed {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(backend_error("delete_object", err)),
        }
    }

    async fn copy(
        &self,
        src: &str,
        dst: &str,
        if_match: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        let result = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(src))
            .key(dst)
            .set_copy_source_if_match(if_match.map(|etag| format!("\"{etag}\"")))
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(err) if status_of(&err) == Some(404) => {
                return Err(StorageError::NotFound(src.to_string()));
            }
            Err(err) if status_of(&err) == Some(412) => {
                return Err(StorageError::PreconditionFailed {
                    key: src.to_string(),
                });
            }
            Err(err) => return Err(backend_error("copy_object", err)),
        };
        let etag = output
            .copy_object_result()
            .and_then(|r| Self::sanitize_etag(r.e_tag()));
        Ok(ObjectMeta {
            key: dst.to_string(),
            content_type: None,
            size_bytes: 0,
            etag,
            last_modified: Utc::now(),
        })
    }

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
        content_type: Option<&str>,
    ) -> StorageResult<PresignedUrl> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|err| StorageError::Backend(format!("invalid presign config: {err}")))?;
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        let request = match method {
            PresignMethod::Get => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(|err| backend_error("presign get_object", err))?,
            PresignMethod::Put => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .set_content_type(content_type.map(str::to_string))
                .presigned(config)
                .await
                .map_err(|err| backend_error("presign put_object", err))?,
        };
        Ok(PresignedUrl {
            url: request.uri().to_string(),
            expires_at,
        })
    }
}
