//! Per-item fetch stage: download into memory, verify the hash, write the
//! content (resized when over the threshold), stamp file times and write
//! the sidecar.

use std::path::PathBuf;

use futures_util::StreamExt;
use reqwest::Client;

use super::error::{FetchError, ItemFailure};
use super::plan::PlannedItem;
use super::resize::{self, ResizeConfig};
use crate::catalog::{Credentials, Item};
use crate::retry::{self, Attempt, RetryConfig};
use crate::store::hash::md5_bytes;
use crate::store::{self, Layout};

/// Executes plans one item at a time: download, verify, materialize, stamp,
/// and write the sidecar.
pub struct Fetcher<'a> {
    http: &'a Client,
    credentials: Option<&'a Credentials>,
    layout: &'a Layout,
    resize: Option<ResizeConfig>,
    retry: RetryConfig,
    max_content_bytes: u64,
}

impl<'a> Fetcher<'a> {
    pub fn new(
        http: &'a Client,
        credentials: Option<&'a Credentials>,
        layout: &'a Layout,
        resize: Option<ResizeConfig>,
        retry: RetryConfig,
        max_content_bytes: u64,
    ) -> Self {
        Self {
            http,
            credentials,
            layout,
            resize,
            retry,
            max_content_bytes,
        }
    }

    /// Carry out one plan. Returns whether content was written.
    ///
    /// On error the item must not be committed.
    pub async fn execute(&self, planned: &PlannedItem) -> Result<bool, ItemFailure> {
        let item = &planned.item;
        let mut downloaded = false;

        if planned.plan.download {
            let result = retry::retry_with_delay(&self.retry, || self.attempt(item)).await;
            let path = match result {
                Ok(path) => path,
                Err(e) => {
                    if e.is_terminal() {
                        self.purge_sidecar(item).await;
                    }
                    return Err(e.into());
                }
            };
            downloaded = true;

            let (created, updated) = (item.created_at, item.updated_at);
            let stamp_path = path.clone();
            match tokio::task::spawn_blocking(move || {
                store::set_file_times(&stamp_path, &created, &updated)
            })
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Could not set file times on {}: {}", path.display(), e)
                }
                Err(e) => tracing::warn!("Timestamp task panicked: {}", e),
            }
            tracing::debug!(id = item.id, path = %path.display(), "Stored content");
        }

        // A mismatching attempt removes the sidecar, so a successful download
        // always writes it back.
        if planned.plan.write_metadata || downloaded {
            let layout = self.layout.clone();
            let sidecar_item = item.clone();
            tokio::task::spawn_blocking(move || store::write_sidecar(&layout, &sidecar_item))
                .await
                .map_err(|e| ItemFailure::Sidecar(std::io::Error::other(e)))?
                .map_err(ItemFailure::Sidecar)?;
        }

        Ok(downloaded)
    }

    /// One download-verify-materialize attempt.
    async fn attempt(&self, item: &Item) -> Attempt<PathBuf, FetchError> {
        let result = match self.fetch_body(&item.content_url).await {
            Ok(body) => {
                let layout = self.layout.clone();
                let item = item.clone();
                let resize = self.resize;
                tokio::task::spawn_blocking(move || store_body(&layout, &item, body, resize))
                    .await
                    .unwrap_or_else(|e| Err(FetchError::Disk(std::io::Error::other(e))))
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(path) => Attempt::Success(path),
            Err(e) if e.is_terminal() => Attempt::Terminal(e),
            Err(e) => Attempt::Transient(e),
        }
    }

    /// Fetch the whole body into memory, bounded by `max_content_bytes`.
    async fn fetch_body(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut request = self.http.get(url);
        if let Some(credentials) = self.credentials {
            request = credentials.apply(request);
        }

        let response = request.send().await.map_err(|e| FetchError::Http {
            source: e,
            url: url.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit: self.max_content_bytes,
        };
        let content_length = response.content_length();
        if content_length.is_some_and(|len| len > self.max_content_bytes) {
            return Err(too_large());
        }

        let mut body = Vec::with_capacity(content_length.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                tracing::warn!(
                    "Body error for {} (content_length={:?}, bytes_so_far={}): {}",
                    url,
                    content_length,
                    body.len(),
                    e
                );
                FetchError::Http {
                    source: e,
                    url: url.to_string(),
                }
            })?;
            if (body.len() + chunk.len()) as u64 > self.max_content_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn purge_sidecar(&self, item: &Item) {
        let path = self.layout.sidecar_path(&item.md5);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(id = item.id, "Removed stale sidecar"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}

/// Verify a fetched body against the item's hash and write it to its
/// content path, resized if it is over the threshold.
///
/// A mismatching body leaves content untouched but removes the sidecar, so
/// an aborted run never leaves a sidecar vouching for content it does not
/// have.
fn store_body(
    layout: &Layout,
    item: &Item,
    body: Vec<u8>,
    resize: Option<ResizeConfig>,
) -> Result<PathBuf, FetchError> {
    let actual = md5_bytes(&body);
    if actual != item.md5 {
        store::remove_if_exists(&layout.sidecar_path(&item.md5))?;
        return Err(FetchError::ChecksumMismatch {
            expected: item.md5.clone(),
            actual,
        });
    }

    let (path, data) = match resize {
        Some(r) if r.applies_to(body.len() as u64) => (
            layout.resized_path(&item.md5),
            resize::pad_to_png(&body, r.width, r.height)?,
        ),
        _ => (layout.content_path(&item.md5, &item.extension), body),
    };

    // One hash, one physical file: drop whichever variant an earlier run
    // (with different resize settings) may have left.
    store::remove_if_exists(&layout.content_path(&item.md5, &item.extension))?;
    store::remove_if_exists(&layout.resized_path(&item.md5))?;

    store::write_atomic(&path, &layout.part_path(&item.md5), &data)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::plan::Plan;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &[u8] = b"the real bytes";

    fn planned(url: &str, body: &[u8], plan: Plan) -> PlannedItem {
        let item = Item::from_record(json!({
            "id": 1,
            "md5": md5_bytes(body),
            "file_ext": "jpg",
            "file_url": url,
            "created_at": "2020-01-01T00:00:00Z",
            "updated_at": "2021-01-01T00:00:00Z"
        }))
        .unwrap();
        PlannedItem { item, plan }
    }

    fn full() -> Plan {
        Plan {
            download: true,
            write_metadata: true,
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_download_writes_content_and_sidecar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/c.jpg"))
            .and(query_param("login", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let http = Client::new();
        let credentials = Credentials {
            login: "alice".into(),
            api_key: "k".into(),
        };
        let fetcher = Fetcher::new(&http, Some(&credentials), &layout, None, retry(3), 1 << 20);
        let p = planned(&format!("{}/c.jpg", server.uri()), BODY, full());

        assert!(fetcher.execute(&p).await.unwrap());
        let content = layout.content_path(&p.item.md5, "jpg");
        assert_eq!(std::fs::read(&content).unwrap(), BODY);
        assert!(layout.sidecar_path(&p.item.md5).exists());
        assert!(!layout.part_path(&p.item.md5).exists());

        let mtime = std::fs::metadata(&content).unwrap().modified().unwrap();
        let expected = std::time::UNIX_EPOCH
            + Duration::from_secs(p.item.updated_at.timestamp() as u64);
        assert_eq!(mtime, expected);
    }

    #[tokio::test]
    async fn test_metadata_only_plan_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let http = Client::new();
        let fetcher = Fetcher::new(&http, None, &layout, None, retry(3), 1 << 20);
        let p = planned(
            &format!("{}/c.jpg", server.uri()),
            BODY,
            Plan {
                download: false,
                write_metadata: true,
            },
        );

        assert!(!fetcher.execute(&p).await.unwrap());
        assert!(layout.sidecar_path(&p.item.md5).exists());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried_and_purges_sidecar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let p = planned(&format!("{}/gone.jpg", server.uri()), BODY, full());
        store::write_sidecar(&layout, &p.item).unwrap();

        let http = Client::new();
        let fetcher = Fetcher::new(&http, None, &layout, None, retry(5), 1 << 20);
        let err = fetcher.execute(&p).await.unwrap_err();
        assert!(matches!(err, ItemFailure::Download(ref e) if e.is_terminal()));
        assert!(!layout.sidecar_path(&p.item.md5).exists());
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let http = Client::new();
        let fetcher = Fetcher::new(&http, None, &layout, None, retry(3), 1 << 20);
        let p = planned(&format!("{}/c.jpg", server.uri()), BODY, full());
        assert!(fetcher.execute(&p).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatch_then_success_restores_sidecar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"junk".as_slice()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        // Content corrupted on disk, metadata current.
        let p = planned(
            &format!("{}/c.jpg", server.uri()),
            BODY,
            Plan {
                download: true,
                write_metadata: false,
            },
        );
        store::write_sidecar(&layout, &p.item).unwrap();

        let http = Client::new();
        let fetcher = Fetcher::new(&http, None, &layout, None, retry(3), 1 << 20);
        assert!(fetcher.execute(&p).await.unwrap());
        assert!(layout.sidecar_path(&p.item.md5).exists());
        assert_eq!(
            std::fs::read(layout.content_path(&p.item.md5, "jpg")).unwrap(),
            BODY
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_exhausts_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"truncated".as_slice()))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let p = planned(&format!("{}/c.jpg", server.uri()), BODY, full());
        store::write_sidecar(&layout, &p.item).unwrap();

        let http = Client::new();
        let fetcher = Fetcher::new(&http, None, &layout, None, retry(3), 1 << 20);
        let err = fetcher.execute(&p).await.unwrap_err();
        match err {
            ItemFailure::Download(e) => {
                assert!(!e.is_terminal());
                assert!(matches!(e.cause(), FetchError::ChecksumMismatch { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!layout.sidecar_path(&p.item.md5).exists());
        assert!(!layout.content_path(&p.item.md5, "jpg").exists());
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let http = Client::new();
        let fetcher = Fetcher::new(&http, None, &layout, None, retry(1), 4);
        let p = planned(&format!("{}/c.jpg", server.uri()), BODY, full());
        let err = fetcher.execute(&p).await.unwrap_err();
        match err {
            ItemFailure::Download(e) => {
                assert!(matches!(e.cause(), FetchError::TooLarge { limit: 4, .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_store_body_replaces_other_variant() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let item = planned("http://unused", BODY, full()).item;
        // Left behind by an earlier run that resized.
        let stale = layout.resized_path(&item.md5);
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old png").unwrap();

        let path = store_body(&layout, &item, BODY.to_vec(), None).unwrap();
        assert_eq!(path, layout.content_path(&item.md5, "jpg"));
        assert!(!stale.exists());
    }

    #[test]
    fn test_store_body_undecodable_over_threshold_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let item = planned("http://unused", BODY, full()).item;
        let resize = ResizeConfig {
            width: 8,
            height: 8,
            threshold_bytes: 1,
        };
        let err = store_body(&layout, &item, BODY.to_vec(), Some(resize)).unwrap_err();
        assert!(err.is_terminal());
    }
}
