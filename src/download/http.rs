//! HTTP transport
//!
//! A transport starts one network fetch per call and hands back a
//! [`FetchHandle`]: a cancel switch plus an ordered stream of progress events
//! that ends with exactly one completion or failure.

use futures_util::StreamExt;
use reqwest::{
    Client,
    header::{self, HeaderMap, HeaderValue},
};
use std::path::{Path, PathBuf};
use tokio::{fs::File, io::AsyncWriteExt, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, instrument, span, trace};
use url::Url;

use crate::config::HttpConfig;
use crate::error::TransferError;

/// Event emitted by a running fetch
#[derive(Debug)]
pub enum FetchEvent {
    /// Bytes written so far; `total` is 0 while the length is unknown
    Progress { transferred: u64, total: u64 },
    /// Payload fully written to a temporary file the receiver now owns
    Completed(PathBuf),
    Failed(TransferError),
}

impl FetchEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Handle returned by [`Transport::begin`] for tracking and cancelling a fetch
#[derive(Debug)]
pub struct FetchHandle {
    events: mpsc::Receiver<FetchEvent>,
    cancellation_token: CancellationToken,
}

impl FetchHandle {
    pub fn new(events: mpsc::Receiver<FetchEvent>, token: CancellationToken) -> Self {
        Self {
            events,
            cancellation_token: token,
        }
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Next event, `None` once the terminal event has been consumed or the
    /// transport went away
    pub async fn next_event(&mut self) -> Option<FetchEvent> {
        self.events.recv().await
    }
}

/// Something that can fetch a URL into a temporary file
pub trait Transport: Send + Sync + 'static {
    fn begin(&self, url: &Url) -> FetchHandle;
}

/// reqwest-backed transport writing payloads into a staging directory
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    staging_dir: PathBuf,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig, staging_dir: impl Into<PathBuf>) -> reqwest::Result<Self> {
        Ok(Self::with_client(build_client(config)?, staging_dir))
    }

    pub fn with_client(client: Client, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}

/// Builds the shared HTTP client
pub fn build_client(config: &HttpConfig) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

    Client::builder()
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .default_headers(headers)
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout())
        .timeout(config.timeout())
        .build()
}

impl Transport for HttpTransport {
    fn begin(&self, url: &Url) -> FetchHandle {
        let (tx, rx) = mpsc::channel(32);
        let token = CancellationToken::new();

        let client = self.client.clone();
        let staging_dir = self.staging_dir.clone();
        let task_token = token.clone();
        let url = url.clone();

        let fetch_span = span!(Level::DEBUG, "fetch_task", url = %url);
        tokio::spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => Err(TransferError::Cancelled),
                    result = fetch_to_file(&client, &url, &staging_dir, &tx) => result,
                };

                let event = match result {
                    Ok(path) => FetchEvent::Completed(path),
                    Err(e) => {
                        if e.is_cancellation() {
                            debug!("Fetch cancelled");
                        } else {
                            error!(error = %e, "Fetch failed");
                        }
                        FetchEvent::Failed(e)
                    }
                };
                // Receiver gone means nobody tracks this fetch anymore
                if let Err(mpsc::error::SendError(FetchEvent::Completed(path))) = tx.send(event).await
                {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
            .instrument(fetch_span),
        );

        FetchHandle::new(rx, token)
    }
}

/// Streams the response body of `url` into a fresh temporary file.
///
/// The temporary file is deleted if this future fails or is dropped before
/// completing.
#[instrument(name = "fetch", level = "debug", skip(client, staging_dir, progress_tx), fields(url = %url))]
async fn fetch_to_file(
    client: &Client,
    url: &Url,
    staging_dir: &Path,
    progress_tx: &mpsc::Sender<FetchEvent>,
) -> Result<PathBuf, TransferError> {
    let response = client.get(url.clone()).send().await?;
    trace!(status = %response.status(), "Got response");

    if !response.status().is_success() {
        return Err(TransferError::HttpStatus(response.status()));
    }

    let total = response.content_length().unwrap_or(0);
    if total > 0 {
        info!(bytes = total, "Starting download");
    } else {
        info!("Starting download of unknown size");
    }

    tokio::fs::create_dir_all(staging_dir).await?;
    let temp = tempfile::Builder::new()
        .prefix(".transfer-")
        .suffix(".part")
        .tempfile_in(staging_dir)?;
    let (std_file, temp_path) = temp.into_parts();
    let mut file = File::from_std(std_file);
    debug!(path = ?temp_path, "Writing to temporary file");

    let send_progress = |transferred: u64| async move {
        progress_tx
            .send(FetchEvent::Progress { transferred, total })
            .await
            .map_err(|_| TransferError::Cancelled)
    };

    send_progress(0).await?;

    let mut stream = response.bytes_stream();
    let mut transferred: u64 = 0;
    let mut milestone = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        transferred += chunk.len() as u64;

        trace!(bytes = transferred, chunk_size = chunk.len(), "Received chunk");
        if total > 0 {
            let quarter = (transferred.saturating_mul(4) / total).min(4);
            if quarter > milestone {
                milestone = quarter;
                info!(
                    percentage = format_args!("{}%", quarter * 25),
                    bytes = transferred,
                    total = total,
                    "Download milestone"
                );
            }
        }

        send_progress(transferred).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    info!(bytes = transferred, "Download completed");
    temp_path.keep().map_err(|e| TransferError::Io(e.error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    async fn drain(handle: &mut FetchHandle) -> (Vec<(u64, u64)>, FetchEvent) {
        let mut progress = Vec::new();
        while let Some(event) = handle.next_event().await {
            match event {
                FetchEvent::Progress { transferred, total } => progress.push((transferred, total)),
                terminal => return (progress, terminal),
            }
        }
        panic!("Fetch ended without a terminal event");
    }

    #[tokio::test]
    async fn test_fetch_writes_payload() {
        let payload = vec![7u8; 64 * 1024];
        let body = payload.clone();
        let base = serve(Router::new().route(
            "/app.ipa",
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        ))
        .await;

        let staging = tempfile::tempdir().unwrap();
        let transport = HttpTransport::new(&HttpConfig::default(), staging.path()).unwrap();
        let url = Url::parse(&format!("{base}/app.ipa")).unwrap();

        let mut handle = transport.begin(&url);
        let (progress, terminal) = drain(&mut handle).await;

        assert_eq!(progress.first(), Some(&(0, payload.len() as u64)));
        assert_eq!(
            progress.last(),
            Some(&(payload.len() as u64, payload.len() as u64))
        );
        assert!(
            progress.windows(2).all(|w| w[0].0 <= w[1].0),
            "Progress must be ordered"
        );

        match terminal {
            FetchEvent::Completed(path) => {
                assert!(path.starts_with(staging.path()));
                assert_eq!(std::fs::read(&path).unwrap(), payload);
            }
            other => panic!("Expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_error_status_fails() {
        let base = serve(Router::new().route(
            "/missing.ipa",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        ))
        .await;

        let staging = tempfile::tempdir().unwrap();
        let transport = HttpTransport::new(&HttpConfig::default(), staging.path()).unwrap();
        let url = Url::parse(&format!("{base}/missing.ipa")).unwrap();

        let mut handle = transport.begin(&url);
        let (progress, terminal) = drain(&mut handle).await;

        assert!(progress.is_empty());
        assert!(matches!(
            terminal,
            FetchEvent::Failed(TransferError::HttpStatus(status)) if status == StatusCode::NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_response() {
        let base = serve(Router::new().route(
            "/slow.ipa",
            get(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                "late"
            }),
        ))
        .await;

        let staging = tempfile::tempdir().unwrap();
        let transport = HttpTransport::new(&HttpConfig::default(), staging.path()).unwrap();
        let url = Url::parse(&format!("{base}/slow.ipa")).unwrap();

        let mut handle = transport.begin(&url);
        handle.cancel();
        assert!(handle.is_cancelled());

        let (_, terminal) = drain(&mut handle).await;
        assert!(matches!(terminal, FetchEvent::Failed(TransferError::Cancelled)));

        // No partial files left behind
        let leftovers = std::fs::read_dir(staging.path())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}
