// Copyright 2024 The Tempstash Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cmp;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures::stream::unfold;
use rand::Rng;
use tempstash_config::stores::{Retry, S3BlobStore as S3BlobStoreConfig};
use tempstash_error::{make_err, Code, Error, ResultExt};
use tempstash_util::buf_channel::{DropCloserReadHalf, DropCloserWriteHalf};
use tempstash_util::retry::{ExponentialBackoff, Retrier, RetryResult};
use tempstash_util::store_trait::{BlobHead, BlobStore, UploadSizeInfo};
use tokio::time::sleep;
use tracing::{event, Level};

// S3 parts cannot be smaller than this number. See:
// https://docs.aws.amazon.com/AmazonS3/latest/userguide/qfacts.html
const MIN_MULTIPART_SIZE: u64 = 5 * 1024 * 1024; // 5mb.

// S3 rejects uploads with more than this many parts.
const MAX_UPLOAD_PARTS: u64 = 10_000;

const LIST_PAGE_SIZE: i32 = 1000;

pub struct S3Store {
    s3_client: Client,
    bucket: String,
    key_prefix: String,
    retry: Retry,
    retrier: Retrier,
    jitter_fn: Box<dyn Fn(Duration) -> Duration + Send + Sync>,
}

impl S3Store {
    pub async fn new(config: &S3BlobStoreConfig) -> Result<Self, Error> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if !config.region.is_empty() {
            loader = loader.region(aws_config::Region::new(config.region.clone()));
        }
        let sdk_config = loader.load().await;
        let jitter_amt = config.retry.jitter;
        Ok(Self::new_with_client_and_jitter(
            config,
            Client::new(&sdk_config),
            Box::new(move |delay: Duration| {
                if jitter_amt == 0. {
                    return delay;
                }
                let min = 1. - (jitter_amt / 2.);
                let max = 1. + (jitter_amt / 2.);
                delay.mul_f32(rand::thread_rng().gen_range(min..max))
            }),
        ))
    }

    pub fn new_with_client_and_jitter(
        config: &S3BlobStoreConfig,
        s3_client: Client,
        jitter_fn: Box<dyn Fn(Duration) -> Duration + Send + Sync>,
    ) -> Self {
        S3Store {
            s3_client,
            bucket: config.bucket.clone(),
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
            retry: config.retry.clone(),
            retrier: Retrier::new(Box::new(|duration| Box::pin(sleep(duration)))),
            jitter_fn,
        }
    }

    fn make_s3_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn retry_config(&self) -> impl Iterator<Item = Duration> + Send + '_ {
        ExponentialBackoff::new(Duration::from_secs_f32(self.retry.delay.max(0.001)))
            .map(|d| (self.jitter_fn)(d))
            .take(self.retry.max_retries) // Remember this is number of retries, so will run max_retries + 1.
    }

    async fn put_multipart(
        &self,
        s3_key: &str,
        reader: &mut DropCloserReadHalf,
        first_part: bytes::Bytes,
        content_type: &str,
        max_size: u64,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let response = self
            .s3_client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(s3_key)
            .content_type(content_type)
            .set_metadata(Some(
                metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
            .send()
            .await
            .map_err(|e| {
                make_err!(
                    Code::Unavailable,
                    "Failed to create multipart upload to s3: {e:?}"
                )
            })?;
        let upload_id = response
            .upload_id
            .err_tip(|| "Expected upload_id to be set by s3 response")?;

        let bytes_per_upload_part =
            cmp::max(MIN_MULTIPART_SIZE, max_size / (MAX_UPLOAD_PARTS - 1)) as usize;

        let complete_result = async {
            let mut part_number: i32 = 1;
            let mut completed_parts = Vec::new();
            let mut chunk = first_part;
            loop {
                if chunk.is_empty() {
                    break; // Reached EOF.
                }
                let upload = self
                    .s3_client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(s3_key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(|e| {
                        make_err!(Code::Unavailable, "Failed to upload part to s3: {e:?}")
                    })?;
                completed_parts.push(
                    CompletedPart::builder()
                        .set_e_tag(upload.e_tag)
                        .part_number(part_number)
                        .build(),
                );
                part_number += 1;
                // Parts are uploaded one at a time so memory stays bounded and
                // backpressure reaches the producer.
                chunk = reader
                    .take(bytes_per_upload_part)
                    .await
                    .err_tip(|| "Failed to read chunk in S3Store::put")?;
            }
            self.s3_client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(s3_key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed_parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| {
                    make_err!(Code::Unavailable, "Failed to complete multipart to s3: {e:?}")
                })?;
            Ok(())
        }
        .await;

        if complete_result.is_err() {
            let abort_result = self
                .s3_client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(s3_key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(err) = abort_result {
                event!(
                    Level::WARN,
                    ?err,
                    "Failed to abort_multipart_upload in s3 store"
                );
            }
        }
        complete_result
    }
}

/// Transport level failures can be retried; service rejections cannot.
fn is_retryable<E, R>(e: &SdkError<E, R>) -> bool {
    matches!(
        e,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_)
    )
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl BlobStore for S3Store {
    async fn put(
        &self,
        key: &str,
        mut reader: DropCloserReadHalf,
        content_type: &str,
        size_info: UploadSizeInfo,
        user_meta: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let s3_key = self.make_s3_key(key);
        let max_size = size_info.max_size();

        // Anything going down this if-statement has the advantage of a
        // single network request instead of the minimum of 3 required for
        // multipart uploads.
        if max_size < MIN_MULTIPART_SIZE {
            let data = reader
                .collect_all_with_size_hint(max_size as usize)
                .await
                .err_tip(|| "Failed to read stream in S3Store::put")?;
            let content_length = data.len() as i64;
            return self
                .s3_client
                .put_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .content_type(content_type)
                .content_length(content_length)
                .set_metadata(Some(
                    user_meta
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ))
                .body(ByteStream::from(data))
                .send()
                .await
                .map_or_else(
                    |e| Err(make_err!(Code::Unavailable, "{e:?}")),
                    |_| Ok(()),
                )
                .err_tip(|| "Failed to upload file to s3 in single chunk");
        }

        let bytes_per_upload_part =
            cmp::max(MIN_MULTIPART_SIZE, max_size / (MAX_UPLOAD_PARTS - 1)) as usize;
        let first_part = reader
            .take(bytes_per_upload_part)
            .await
            .err_tip(|| "Failed to read first chunk in S3Store::put")?;
        if first_part.len() < bytes_per_upload_part {
            // The whole payload fit into one buffer after all, so skip the
            // multipart protocol.
            let content_length = first_part.len() as i64;
            return self
                .s3_client
                .put_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .content_type(content_type)
                .content_length(content_length)
                .set_metadata(Some(
                    user_meta
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ))
                .body(ByteStream::from(first_part))
                .send()
                .await
                .map_or_else(
                    |e| Err(make_err!(Code::Unavailable, "{e:?}")),
                    |_| Ok(()),
                )
                .err_tip(|| "Failed to upload file to s3 in single chunk");
        }
        self.put_multipart(
            &s3_key,
            &mut reader,
            first_part,
            content_type,
            max_size,
            user_meta,
        )
        .await
    }

    async fn get(&self, key: &str, mut writer: DropCloserWriteHalf) -> Result<(), Error> {
        let s3_key = self.make_s3_key(key);
        let output = self
            .s3_client
            .get_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err) if service_err.err().is_no_such_key() => {
                    make_err!(Code::NotFound, "Key {key} not found in S3")
                }
                _ => make_err!(Code::Unavailable, "Error reading from S3: {e:?}"),
            })?;
        let mut body = output.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "Failed to download from s3: {e:?}"))?
        {
            if chunk.is_empty() {
                continue;
            }
            writer
                .send(chunk)
                .await
                .err_tip(|| "Failed to forward chunk in S3Store::get")?;
        }
        writer
            .send_eof()
            .err_tip(|| "Failed to send EOF in S3Store::get")
    }

    async fn head(&self, key: &str) -> Result<Option<BlobHead>, Error> {
        let retry_config = self.retry_config();
        let s3_key = self.make_s3_key(key);
        // Capture by reference so the FnMut closure can be called again on
        // every retry.
        let s3_key = &s3_key;
        Pin::new(&self.retrier)
            .retry(
                retry_config,
                Box::pin(unfold((), move |state| async move {
                    let result = self
                        .s3_client
                        .head_object()
                        .bucket(&self.bucket)
                        .key(s3_key)
                        .send()
                        .await;
                    let ret = match result {
                        Ok(output) => {
                            let user_meta = output
                                .metadata()
                                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                                .unwrap_or_default();
                            RetryResult::Ok(Some(BlobHead {
                                size: output.content_length().unwrap_or(0).max(0) as u64,
                                content_type: output.content_type().map(str::to_string),
                                modified: output.last_modified().and_then(to_chrono),
                                user_meta,
                            }))
                        }
                        Err(SdkError::ServiceError(service_err))
                            if service_err.err().is_not_found() =>
                        {
                            RetryResult::Ok(None)
                        }
                        Err(e) if is_retryable(&e) => RetryResult::Retry(make_err!(
                            Code::Unavailable,
                            "Error attempting to head s3 object: {e:?}"
                        )),
                        Err(e) => RetryResult::Err(make_err!(
                            Code::Unavailable,
                            "Non-retryable error heading s3 object: {e:?}"
                        )),
                    };
                    Some((ret, state))
                })),
            )
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let retry_config = self.retry_config();
        let s3_key = self.make_s3_key(key);
        let s3_key = &s3_key;
        Pin::new(&self.retrier)
            .retry(
                retry_config,
                Box::pin(unfold((), move |state| async move {
                    let result = self
                        .s3_client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(s3_key)
                        .send()
                        .await;
                    let ret = match result {
                        // Deleting a missing key is a success in S3 semantics too.
                        Ok(_) => RetryResult::Ok(()),
                        Err(e) if is_retryable(&e) => RetryResult::Retry(make_err!(
                            Code::Unavailable,
                            "Error attempting to delete s3 object: {e:?}"
                        )),
                        Err(e) => RetryResult::Err(make_err!(
                            Code::Unavailable,
                            "Non-retryable error deleting s3 object: {e:?}"
                        )),
                    };
                    Some((ret, state))
                })),
            )
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let list_prefix = self.make_s3_key(prefix);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let output = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .max_keys(LIST_PAGE_SIZE)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| {
                    make_err!(Code::Unavailable, "Failed to list s3 objects: {e:?}")
                })?;
            for object in output.contents() {
                let Some(full_key) = object.key() else {
                    continue;
                };
                if let Some(key) = full_key.strip_prefix(&self.key_prefix) {
                    keys.push(key.to_string());
                }
            }
            match output.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }
        // S3 returns keys in lexicographic order per page; the sort keeps
        // that guarantee across page boundaries.
        keys.sort();
        Ok(keys)
    }

    async fn healthy(&self) -> bool {
        self.s3_client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }
}
