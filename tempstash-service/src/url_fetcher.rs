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

use std::time::Duration;

use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::redirect::Policy;
use tempstash_config::server::UrlFetchConfig;
use tempstash_error::{make_err, make_input_err, Code, Error};
use tempstash_util::buf_channel::make_buf_channel_pair;
use tempstash_util::file_record::UploadedFile;
use url::Url;

const FALLBACK_FILE_NAME: &str = "file";

/// Fetches a remote URL and presents the response as a normal
/// [`UploadedFile`], so the ingest pipeline treats it exactly like a
/// client-streamed upload. Dropping the returned reader cancels the
/// remote transfer.
pub struct UrlFetcher {
    client: reqwest::Client,
    max_file_size: u64,
}

impl UrlFetcher {
    pub fn new(config: &UrlFetchConfig, max_file_size: u64) -> Result<Self, Error> {
        let mut builder =
            reqwest::Client::builder().redirect(Policy::limited(config.max_redirects));
        if config.connect_timeout_seconds > 0 {
            builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_seconds));
        }
        Ok(UrlFetcher {
            client: builder
                .build()
                .map_err(|e| make_err!(Code::Internal, "Failed to build http client: {e}"))?,
            max_file_size,
        })
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<UploadedFile, Error> {
        let url = Url::parse(raw_url).map_err(|e| make_input_err!("Invalid url: {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(make_input_err!(
                "Only http(s) URLs are supported, got scheme '{}'",
                url.scheme()
            ));
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_redirect() {
                make_input_err!("Too many redirects while fetching url")
            } else {
                make_err!(Code::Unavailable, "Failed to fetch url: {e}")
            }
        })?;
        if !response.status().is_success() {
            return Err(make_err!(
                Code::Unavailable,
                "Remote server returned status {}",
                response.status()
            ));
        }

        // A declared length over the cap is rejected without reading a
        // single body byte; an undeclared length is caught by the ingest
        // counter instead.
        let size_hint = response.content_length();
        if let Some(length) = size_hint {
            if length > self.max_file_size {
                return Err(make_err!(
                    Code::ResourceExhausted,
                    "Remote file is {length} bytes, maximum is {} bytes",
                    self.max_file_size
                ));
            }
        }

        let original_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(file_name_from_content_disposition)
            .or_else(|| file_name_from_url(response.url()))
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        let declared_mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                // Servers that send no Content-Type still often name the
                // file; the extension is a better hint than nothing.
                mime_guess::from_path(&original_name)
                    .first()
                    .map(|mime| mime.to_string())
            });

        let (mut tx, rx) = make_buf_channel_pair();
        let body_stream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        tokio::spawn(async move {
            // A forward failure (remote died, or the consumer hung up)
            // drops tx without EOF, which surfaces as a stream error on the
            // ingest side and tears the transfer down.
            let _ = tx.forward(body_stream, true).await;
        });

        Ok(UploadedFile {
            original_name,
            declared_mime,
            size_hint,
            reader: rx,
        })
    }
}

/// RFC 6266 parsing, reduced to what ingest needs: `filename*` (RFC 5987)
/// wins over plain `filename`.
fn file_name_from_content_disposition(header: &str) -> Option<String> {
    let mut plain: Option<String> = None;
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            let value = value.trim_matches('"');
            if let Some((charset, encoded)) = value.split_once("''") {
                if charset.eq_ignore_ascii_case("utf-8") {
                    if let Ok(decoded) = percent_decode_str(encoded).decode_utf8() {
                        if !decoded.is_empty() {
                            return Some(decoded.into_owned());
                        }
                    }
                }
            }
        } else if let Some(value) = part.strip_prefix("filename=") {
            let value = value.trim_matches('"').trim();
            if !value.is_empty() {
                plain = Some(value.to_string());
            }
        }
    }
    plain
}

/// Last non-empty path segment of the final (post-redirect) URL.
fn file_name_from_url(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?;
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    if decoded.is_empty() {
        return None;
    }
    Some(decoded.into_owned())
}

#[cfg(test)]
mod file_name_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[test]
    fn rfc5987_filename_star_is_preferred() {
        assert_eq!(
            file_name_from_content_disposition(
                "attachment; filename=\"fallback.txt\"; filename*=UTF-8''na%C3%AFve%20file.txt"
            ),
            Some("naïve file.txt".to_string())
        );
    }

    #[test]
    fn plain_filename_is_used_without_the_extended_form() {
        assert_eq!(
            file_name_from_content_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            file_name_from_content_disposition("attachment; filename=report.pdf"),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn missing_filenames_yield_none() {
        assert_eq!(file_name_from_content_disposition("inline"), None);
        assert_eq!(file_name_from_content_disposition("attachment; filename=\"\""), None);
    }

    #[test]
    fn url_segment_fallback() {
        let url = Url::parse("https://example.com/downloads/archive.tar.gz?token=x").unwrap();
        assert_eq!(
            file_name_from_url(&url),
            Some("archive.tar.gz".to_string())
        );
        let bare = Url::parse("https://example.com/").unwrap();
        assert_eq!(file_name_from_url(&bare), None);
    }

    #[test]
    fn url_segments_are_percent_decoded() {
        let url = Url::parse("https://example.com/files/my%20doc.txt").unwrap();
        assert_eq!(file_name_from_url(&url), Some("my doc.txt".to_string()));
    }
}
