//! Active-speaker roster.
//!
//! The relay exposes `GET /active_users` returning every room's connected
//! participants. Clients poll it to show who sits in a channel before
//! joining. Presentation only: nothing in the voice path depends on it.
//!
//! ```text
//! {"general": [{"user_id": "3f2c...", "username": "Alice"}]}
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::signaling::RelayRoster;

/// Path served by the relay
pub const ACTIVE_USERS_PATH: &str = "/active_users";

/// One connected participant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Ephemeral session id of the participant
    #[serde(rename = "user_id")]
    pub participant_id: String,
    #[serde(rename = "username")]
    pub display_name: String,
}

/// Roster of every room, keyed by room id
pub type Roster = BTreeMap<String, Vec<RosterEntry>>;

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the roster endpoint
#[derive(Clone)]
pub struct RosterClient {
    url: String,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl RosterClient {
    /// `base_url` is the roster's HTTP base, e.g. `http://localhost:8001`.
    ///
    /// A base with a path keeps it: `http://host/api` polls `/api/active_users`.
    pub fn new(base_url: &str) -> Result<Self, VoiceError> {
        let mut base = url::Url::parse(base_url).map_err(|e| VoiceError::Config(format!("roster_url: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let url = base
            .join(ACTIVE_USERS_PATH.trim_start_matches('/'))
            .map_err(|e| VoiceError::Config(format!("roster_url: {}", e)))?;

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the roster of every room
    pub async fn fetch_all(&self) -> Result<Roster, VoiceError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(&self.url)
            .header("Accept", "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| VoiceError::Roster(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| VoiceError::Roster(format!("Request to {} failed: {}", self.url, e)))?;

        let status = response.status();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| VoiceError::Roster(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(VoiceError::Roster(format!(
                "{} returned {}: {}",
                self.url,
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        parse(&body)
    }

    /// Fetch the participants of one channel; an unknown channel is empty
    pub async fn fetch(&self, channel_id: &str) -> Result<Vec<RosterEntry>, VoiceError> {
        let mut roster = self.fetch_all().await?;
        Ok(roster.remove(channel_id).unwrap_or_default())
    }
}

/// Decode an `/active_users` body
pub fn parse(body: &[u8]) -> Result<Roster, VoiceError> {
    Ok(serde_json::from_slice(body)?)
}

// ============================================================================
// Poller
// ============================================================================

/// Polls one channel's roster and publishes it through a watch channel.
///
/// Failed polls are logged and the last roster stays published.
pub struct RosterPoller {
    roster: watch::Receiver<Vec<RosterEntry>>,
    task: Option<JoinHandle<()>>,
}

impl RosterPoller {
    /// Poll `channel_id` at `config.roster_url` every `config.roster_poll_ms`
    pub fn from_config(config: &VoiceConfig, channel_id: impl Into<String>) -> Result<Self, VoiceError> {
        config.validate()?;
        let client = RosterClient::new(&config.roster_url)?;
        Ok(Self::spawn(client, channel_id, config.roster_poll_interval()))
    }

    pub fn spawn(client: RosterClient, channel_id: impl Into<String>, period: Duration) -> Self {
        let channel_id = channel_id.into();
        let (tx, roster) = watch::channel(Vec::new());

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                match client.fetch(&channel_id).await {
                    Ok(entries) => {
                        tx.send_if_modified(|current| {
                            if *current == entries {
                                false
                            } else {
                                log::debug!("[Roster] '{}' now has {} participant(s)", channel_id, entries.len());
                                *current = entries;
                                true
                            }
                        });
                    }
                    Err(e) => log::warn!("[Roster] Poll for '{}' failed: {}", channel_id, e),
                }
                if tx.is_closed() {
                    break;
                }
            }
        });

        Self {
            roster,
            task: Some(task),
        }
    }

    /// Latest roster
    pub fn current(&self) -> Vec<RosterEntry> {
        self.roster.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<RosterEntry>> {
        self.roster.clone()
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RosterPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// HTTP server answering `GET /active_users` from a running relay
pub struct RosterEndpoint {
    roster: RelayRoster,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl RosterEndpoint {
    pub fn new(roster: RelayRoster) -> Self {
        Self {
            roster,
            shutdown_tx: None,
        }
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr, VoiceError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| VoiceError::Transport(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| VoiceError::Transport(format!("Failed to read bound address: {}", e)))?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let roster = self.roster.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let roster = roster.clone();

                                tokio::spawn(async move {
                                    let service = service_fn(move |req| {
                                        let roster = roster.clone();
                                        async move { handle_request(req, roster).await }
                                    });

                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        log::debug!("[Roster] Connection error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                log::warn!("[Roster] Accept error: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        log::info!("[Roster] Serving {} on http://{}", ACTIVE_USERS_PATH, local_addr);
        Ok(local_addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    roster: RelayRoster,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, ACTIVE_USERS_PATH) => match serde_json::to_vec(&roster.active_users()) {
            Ok(body) => Ok(respond(StatusCode::OK, "application/json", body)),
            Err(e) => Ok(respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string().into_bytes(),
            )),
        },
        (&Method::GET, _) => Ok(respond(StatusCode::NOT_FOUND, "text/plain", b"Not Found".to_vec())),
        _ => Ok(respond(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            b"Method Not Allowed".to_vec(),
        )),
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
