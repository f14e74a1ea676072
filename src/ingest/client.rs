//! `IngestClient` — the protocol core (spec §4.7).
//!
//! Owns exactly one [`Channel`] and issues the four HTTPS endpoints against
//! it. Callers (the [`crate::scheduler::BatchScheduler`]) never touch the
//! channel directly; they call [`IngestClient::append_batch`] once per
//! batch and trust the classification table below to decide retry/backoff/
//! reopen on their behalf.

use crate::config::AccountConfig;
use crate::ingest::channel::{Channel, ChannelState};
use crate::ingest::retry::{BackoffPolicy, MAX_THROTTLE_ATTEMPTS};
use crate::reading::Reading;
use crate::token::TokenSource;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The one documented `{code, message}` value (spec §7) that makes a 400
/// response channel-level rather than a plain client error.
const CHANNEL_ERROR_CODE: &str = "ERR_CHANNEL_DOES_NOT_EXIST_OR_IS_NOT_AUTHORIZED";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error (attempts exhausted): {0}")]
    Server(String),
    #[error("channel invalidated and reopen failed: {0}")]
    Channel(String),
    #[error("client error ({status}): {body}")]
    Client { status: u16, body: String },
    #[error("authentication failed after retry")]
    Auth,
}

/// Outcome of one [`IngestClient::append_batch`] call, carried up to the
/// scheduler for counter bookkeeping.
#[derive(Debug)]
pub struct AppendOutcome {
    pub rows_sent: usize,
    pub bytes_sent: usize,
    pub last_offset: u64,
}

pub struct IngestClient {
    http: reqwest::Client,
    account: AccountConfig,
    token: TokenSource,
    ingest_base: String,
    channel: Mutex<Channel>,
}

impl IngestClient {
    /// Performs host discovery and the initial `:open` inline (spec §4.9).
    pub async fn connect(account: AccountConfig, token: TokenSource) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Network(e.to_string()))?;

        let control_base = account.url.trim_end_matches('/');
        let ingest_host = discover_ingest_host(&http, control_base, &token).await?;
        let ingest_base = format!("https://{ingest_host}");

        let channel_name = account.channel_name.clone();
        let client = IngestClient {
            http,
            account,
            token,
            ingest_base,
            channel: Mutex::new(Channel::new(channel_name)),
        };

        let mut channel = client.channel.lock().expect("channel mutex poisoned").clone();
        client.open_channel(&mut channel).await?;
        *client.channel.lock().expect("channel mutex poisoned") = channel;
        Ok(client)
    }

    fn channels_base(&self) -> String {
        format!(
            "{}/v2/streaming/databases/{}/schemas/{}/pipes/{}/channels/{}",
            self.ingest_base, self.account.database, self.account.schema, self.account.pipe, self.account.channel_name
        )
    }

    fn data_base(&self) -> String {
        format!(
            "{}/v2/streaming/data/databases/{}/schemas/{}/pipes/{}/channels/{}/rows",
            self.ingest_base, self.account.database, self.account.schema, self.account.pipe, self.account.channel_name
        )
    }

    /// `PUT .../channels/{channel}:open`. Idempotent; used both for the
    /// initial open and for `Broken -> Opening` recovery.
    async fn open_channel(&self, channel: &mut Channel) -> Result<(), IngestError> {
        channel.begin_reopen();
        let url = format!("{}:open", self.channels_base());
        let bearer = self.token.get().await.map_err(|_| IngestError::Auth)?;

        let response = self
            .http
            .put(&url)
            .bearer_auth(bearer)
            .json(&OpenRequest {
                write_mode: "CLOUD_STORAGE",
                role: self.account.role.clone(),
            })
            .send()
            .await
            .map_err(|e| {
                channel.mark_open_failed();
                IngestError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            channel.mark_open_failed();
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Channel(format!("{status}: {body}")));
        }

        let body: OpenResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Network(e.to_string()))?;

        channel.mark_opened(body.next_continuation_token);
        info!(channel = %channel.name, state = ?channel.state, "channel opened");
        Ok(())
    }

    /// Appends one NDJSON-encoded batch, implementing the full response
    /// classification table in spec §4.7. Never submits the same offset
    /// with a different body: on retry the exact same serialized bytes and
    /// query parameters are resent.
    pub async fn append_batch(&self, rows: &[Reading]) -> Result<AppendOutcome, IngestError> {
        let body = encode_ndjson(rows)?;
        let bytes_sent = body.len();

        let (channel_name, state) = {
            let channel = self.channel.lock().expect("channel mutex poisoned");
            (channel.name.clone(), channel.state)
        };

        if state != ChannelState::Open {
            self.reopen_current_channel().await?;
        }

        let mut auth_retry_used = false;
        let mut channel_retry_used = false;
        let mut attempt = 1u32;
        loop {
            let continuation_token = {
                let channel = self.channel.lock().expect("channel mutex poisoned");
                channel.continuation_token.clone().unwrap_or_default()
            };
            let offset = {
                let channel = self.channel.lock().expect("channel mutex poisoned");
                channel.next_offset
            };

            let bearer = self.token.get().await.map_err(|_| IngestError::Auth)?;

            let send_result = self
                .http
                .post(self.data_base())
                .query(&[("continuationToken", continuation_token.as_str()), ("offsetToken", &offset.to_string())])
                .bearer_auth(bearer)
                .header("Content-Type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            let response = match send_result {
                Ok(r) => r,
                Err(e) => {
                    debug!(attempt, error = %e, "append transport error");
                    if attempt >= MAX_THROTTLE_ATTEMPTS {
                        self.mark_server_error();
                        return Err(IngestError::Network(e.to_string()));
                    }
                    if self.mark_server_error() {
                        // broke on two consecutive failures; surface immediately
                        return Err(IngestError::Network(e.to_string()));
                    }
                    BackoffPolicy::sleep_for_attempt(attempt).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                let parsed: AppendResponse = response
                    .json()
                    .await
                    .map_err(|e| IngestError::Network(e.to_string()))?;
                let mut channel = self.channel.lock().expect("channel mutex poisoned");
                channel.record_success(parsed.next_continuation_token);
                let last_offset = offset;
                return Ok(AppendOutcome {
                    rows_sent: rows.len(),
                    bytes_sent,
                    last_offset,
                });
            }

            if status.as_u16() == 429 {
                debug!(attempt, "append throttled");
                if attempt >= MAX_THROTTLE_ATTEMPTS {
                    return Err(IngestError::Server("throttled, attempts exhausted".to_owned()));
                }
                BackoffPolicy::sleep_for_attempt(attempt).await;
                attempt += 1;
                continue;
            }

            if status.is_server_error() {
                debug!(attempt, status = status.as_u16(), "transient server error");
                let broke = self.mark_server_error();
                if broke {
                    warn!(channel = %channel_name, "channel broken after consecutive server errors");
                    return Err(IngestError::Server(format!("{status} (channel broken)")));
                }
                if attempt >= MAX_THROTTLE_ATTEMPTS {
                    return Err(IngestError::Server(status.to_string()));
                }
                BackoffPolicy::sleep_for_attempt(attempt).await;
                attempt += 1;
                continue;
            }

            if status.as_u16() == 401 {
                if auth_retry_used {
                    return Err(IngestError::Auth);
                }
                debug!("append unauthorized, refreshing token");
                self.token.force_refresh().await;
                auth_retry_used = true;
                continue;
            }

            if matches!(status.as_u16(), 400 | 404 | 410) {
                let body_text = response.text().await.unwrap_or_default();
                let is_channel_error =
                    status.as_u16() != 400 || envelope_code(&body_text).as_deref() == Some(CHANNEL_ERROR_CODE);

                if is_channel_error {
                    warn!(channel = %channel_name, status = status.as_u16(), "channel invalidated");
                    self.mark_channel_broken();
                    if channel_retry_used {
                        return Err(IngestError::Channel(format!("{status} after reopen retry")));
                    }
                    self.reopen_current_channel().await?;
                    channel_retry_used = true;
                    continue;
                }

                debug!(status = status.as_u16(), body = %body_text, "client error, dropping batch");
                return Err(IngestError::Client {
                    status: status.as_u16(),
                    body: body_text,
                });
            }

            let body_text = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), body = %body_text, "client error, dropping batch");
            return Err(IngestError::Client {
                status: status.as_u16(),
                body: body_text,
            });
        }
    }

    /// Returns `true` if this pushed the channel to `Broken`.
    fn mark_server_error(&self) -> bool {
        let mut channel = self.channel.lock().expect("channel mutex poisoned");
        channel.record_server_error()
    }

    fn mark_channel_broken(&self) {
        self.channel.lock().expect("channel mutex poisoned").mark_broken();
    }

    async fn reopen_current_channel(&self) -> Result<(), IngestError> {
        let mut channel = { self.channel.lock().expect("channel mutex poisoned").clone() };
        self.open_channel(&mut channel).await?;
        *self.channel.lock().expect("channel mutex poisoned") = channel;
        Ok(())
    }

    /// `POST .../pipes/{pipe}:bulk-channel-status`.
    pub async fn poll_status(&self) -> Result<Option<String>, IngestError> {
        let url = format!(
            "{}/v2/streaming/databases/{}/schemas/{}/pipes/{}:bulk-channel-status",
            self.ingest_base, self.account.database, self.account.schema, self.account.pipe
        );
        let channel_name = self.channel.lock().expect("channel mutex poisoned").name.clone();
        let bearer = self.token.get().await.map_err(|_| IngestError::Auth)?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .json(&StatusRequest {
                channel_names: vec![channel_name],
            })
            .send()
            .await
            .map_err(|e| IngestError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IngestError::Network(format!("status poll returned {}", response.status())));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Network(e.to_string()))?;
        Ok(body.channels.into_iter().next().and_then(|c| c.last_committed_offset_token))
    }

    /// Best-effort `:close` call; errors are logged and swallowed (spec §9,
    /// §14 — the server garbage-collects abandoned channels regardless).
    pub async fn close(&self) {
        let url = format!("{}:close", self.channels_base());
        let bearer = match self.token.get().await {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "skipping channel close, no token available");
                return;
            }
        };
        match self.http.post(&url).bearer_auth(bearer).send().await {
            Ok(r) if r.status().is_success() => {
                self.channel.lock().expect("channel mutex poisoned").mark_closed();
                info!("channel closed");
            }
            Ok(r) => debug!(status = %r.status(), "channel close returned non-success, ignoring"),
            Err(e) => debug!(error = %e, "channel close failed, ignoring"),
        }
    }
}

async fn discover_ingest_host(
    http: &reqwest::Client,
    control_base: &str,
    token: &TokenSource,
) -> Result<String, IngestError> {
    let url = format!("{control_base}/v2/streaming/hostname");
    let bearer = token.get().await.map_err(|_| IngestError::Auth)?;
    let response = http
        .get(&url)
        .bearer_auth(bearer)
        .send()
        .await
        .map_err(|e| IngestError::Network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(IngestError::Network(format!("host discovery returned {}", response.status())));
    }

    let body: HostnameResponse = response
        .json()
        .await
        .map_err(|e| IngestError::Network(e.to_string()))?;
    Ok(body.ingest_host)
}

/// The server error envelope returned alongside a failing append (spec
/// §4.7 item 3: `{code, message}`). Extracts just the `code`, returning
/// `None` on any response body that isn't this shape.
fn envelope_code(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.code)
}

fn encode_ndjson(rows: &[Reading]) -> Result<Vec<u8>, IngestError> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row).map_err(|e| IngestError::Network(e.to_string()))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

#[derive(Debug, Serialize)]
struct OpenRequest {
    write_mode: &'static str,
    role: String,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    next_continuation_token: String,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    next_continuation_token: String,
}

#[derive(Debug, Deserialize)]
struct HostnameResponse {
    ingest_host: String,
}

#[derive(Debug, Serialize)]
struct StatusRequest {
    channel_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    channels: Vec<ChannelStatusEntry>,
}

#[derive(Debug, Deserialize)]
struct ChannelStatusEntry {
    last_committed_offset_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    code: String,
}
