use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use url::Url;

use super::ByteSource;
use crate::error::IoError;

/// Read/write deadline for remote requests. Local reads have no timeout.
pub const REMOTE_TIMEOUT_SECS: u64 = 5;

/// HTTPS range-endpoint implementation of [`ByteSource`].
///
/// The server exposes one slide per path segment:
///
/// ```text
/// /slide/<filename>/header                      serialised TIFF metadata
/// /slide/<filename>/<off1>/<len1>/<off2>/...    concatenated byte ranges
/// /slide_set/<filename>                         case-list JSON
/// ```
///
/// A batch of N ranges therefore costs exactly one request; the response body
/// is the ranges concatenated in URL order.
#[derive(Clone)]
pub struct RemoteSource {
    client: reqwest::Client,
    base: Url,
    filename: String,
    size: u64,
    identifier: String,
}

/// One case in a remote case list.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCase {
    pub name: String,
    #[serde(default)]
    pub filenames: Vec<String>,
}

/// Case-list document returned by `/slide_set/<filename>`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCaseList {
    #[serde(default)]
    pub cases: Vec<RemoteCase>,
}

impl RemoteSource {
    /// Connect to a remote slide, learning its size from the server.
    ///
    /// `base` is the endpoint origin (e.g. `https://host:2000`). The size is
    /// taken from a `Content-Length`-bearing HEAD of the whole-file resource;
    /// servers that do not answer HEAD report size 0 and rely on callers
    /// never validating against it (the serialised header carries the real
    /// geometry).
    pub async fn connect(base: Url, filename: impl Into<String>) -> Result<Self, IoError> {
        let filename = filename.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REMOTE_TIMEOUT_SECS))
            .build()
            .map_err(|e| IoError::Unavailable(e.to_string()))?;

        let head_url = Self::join(&base, &["slide", &filename])?;
        let size = match client.head(head_url).send().await {
            Ok(resp) => resp.content_length().unwrap_or(0),
            Err(e) if e.is_timeout() => {
                return Err(IoError::Timeout {
                    seconds: REMOTE_TIMEOUT_SECS,
                    context: format!("HEAD {filename}"),
                })
            }
            Err(_) => 0,
        };

        let identifier = format!("{}slide/{}", base, filename);
        Ok(Self {
            client,
            base,
            filename,
            size,
            identifier,
        })
    }

    /// Build the URL for a batch of ranges: `/slide/<name>/<off>/<len>/...`.
    pub fn ranges_url(&self, requests: &[(u64, usize)]) -> Result<Url, IoError> {
        let mut segments: Vec<String> = vec!["slide".to_string(), self.filename.clone()];
        for &(offset, len) in requests {
            segments.push(offset.to_string());
            segments.push(len.to_string());
        }
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        Self::join(&self.base, &refs)
    }

    /// Fetch the serialised TIFF metadata from `/slide/<name>/header`.
    pub async fn fetch_header(&self) -> Result<Bytes, IoError> {
        let url = Self::join(&self.base, &["slide", &self.filename, "header"])?;
        self.get(url).await
    }

    /// Fetch the case list from `/slide_set/<name>`.
    pub async fn fetch_case_list(&self) -> Result<RemoteCaseList, IoError> {
        let url = Self::join(&self.base, &["slide_set", &self.filename])?;
        let body = self.get(url).await?;
        serde_json::from_slice(&body)
            .map_err(|e| IoError::Unavailable(format!("case list parse: {e}")))
    }

    async fn get(&self, url: Url) -> Result<Bytes, IoError> {
        let resp = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                IoError::Timeout {
                    seconds: REMOTE_TIMEOUT_SECS,
                    context: url.to_string(),
                }
            } else {
                IoError::Unavailable(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            return Err(IoError::Unavailable(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }

        resp.bytes()
            .await
            .map_err(|e| IoError::Unavailable(e.to_string()))
    }

    fn join(base: &Url, segments: &[&str]) -> Result<Url, IoError> {
        let mut url = base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| IoError::Unavailable("endpoint URL cannot be a base".to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ByteSource for RemoteSource {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let bytes = self.read_batch(&[(offset, len)]).await?;
        Ok(bytes)
    }

    async fn read_batch(&self, requests: &[(u64, usize)]) -> Result<Bytes, IoError> {
        if requests.is_empty() {
            return Ok(Bytes::new());
        }

        let url = self.ranges_url(requests)?;
        let body = self.get(url).await?;

        let expected: usize = requests.iter().map(|r| r.1).sum();
        if body.len() < expected {
            return Err(IoError::Short {
                offset: requests[0].0,
                requested: expected as u64,
                actual: body.len() as u64,
            });
        }
        Ok(body.slice(..expected))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_source() -> RemoteSource {
        RemoteSource {
            client: reqwest::Client::new(),
            base: Url::parse("https://example.org:2000").unwrap(),
            filename: "case_01.tiff".to_string(),
            size: 0,
            identifier: "https://example.org:2000/slide/case_01.tiff".to_string(),
        }
    }

    #[test]
    fn test_ranges_url_encodes_all_pairs_in_order() {
        let source = make_source();
        let url = source
            .ranges_url(&[(1024, 512), (9000, 20), (0, 16)])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.org:2000/slide/case_01.tiff/1024/512/9000/20/0/16"
        );
    }

    #[test]
    fn test_ranges_url_single_pair() {
        let source = make_source();
        let url = source.ranges_url(&[(0, 8)]).unwrap();
        assert_eq!(url.as_str(), "https://example.org:2000/slide/case_01.tiff/0/8");
    }

    #[test]
    fn test_case_list_parse() {
        let json = br#"{"cases": [{"name": "case 1", "filenames": ["a.tiff", "b.tiff"]}]}"#;
        let list: RemoteCaseList = serde_json::from_slice(json).unwrap();
        assert_eq!(list.cases.len(), 1);
        assert_eq!(list.cases[0].filenames, vec!["a.tiff", "b.tiff"]);
    }
}
