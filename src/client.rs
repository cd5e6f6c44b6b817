//! Main logic

use crate::prelude::*;
use base64::engine::{general_purpose::STANDARD as base64, Engine};
use log::{debug, warn};
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BASE_URL: &str = "https://esi.evetech.net";
const TOKEN_URL: &str = "https://login.eveonline.com/v2/oauth/token";
const PAGES_HEADER: &str = "x-pages";
const RETRY_AFTER_HEADER: &str = "retry-after";
const ERROR_LIMIT_RESET_HEADER: &str = "x-esi-error-limit-reset";
const MAX_PAGES: u32 = 10_000;

/// Upper bound on one wait for the process-wide backoff gate to clear.
const GATE_CLEAR_CEILING: Duration = Duration::from_secs(15 * 60);

/// Credentials for the SSO refresh-token flow.
///
/// Resolving player structures (the `/universe/structures` endpoint)
/// requires calls on behalf of an authenticated character. Create an
/// application at <https://developers.eveonline.com/applications> for the
/// client id and secret, then walk the web-based SSO flow once to obtain
/// a refresh token for the character, see
/// <https://docs.esi.evetech.net/docs/sso/web_based_sso_flow.html>.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiSecrets {
    /// EVE developer application client id.
    pub client_id: String,
    /// EVE developer application client secret.
    pub client_secret: String,
    /// Refresh token of the character used for structure lookups.
    pub refresh_token: String,
}

/// A decoded 200 response from ESI.
#[derive(Debug)]
pub struct EsiResponse<T> {
    /// The decoded JSON body.
    pub data: T,
    /// Value of the `X-Pages` header, 0 when absent or unusable.
    pub pages: u32,
}

/// Body of a non-retryable ESI error response.
#[derive(Debug, Deserialize)]
struct JsonEsiError {
    error: String,
}

/// Body of a 504 response carrying an explicit backoff.
#[derive(Debug, Deserialize)]
struct JsonTimeoutError {
    #[allow(unused)]
    error: String,
    timeout: i64,
}

/// Response from SSO when exchanging a refresh token for an access token.
#[derive(Debug, Deserialize)]
struct SsoTokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    refresh_token: String,
}

#[derive(Clone, Debug)]
struct SsoToken {
    access_token: String,
    expires_at: Instant,
}

/// Struct to interact with ESI.
///
/// Construct an instance of this struct using [`EsiBuilder`](./struct.EsiBuilder.html).
/// The instance owns the process-wide backoff gate and the memoised SSO
/// token, both behind shared state, so clones handed to concurrent
/// downloaders all observe the same deadline and token.
///
/// # Example
/// ```rust,no_run
/// use eve_market_dump::prelude::EsiBuilder;
/// let esi = EsiBuilder::new()
///     .user_agent("some user agent")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Esi {
    pub(crate) base_api_url: String,
    pub(crate) token_url: String,
    pub(crate) secrets: Option<ApiSecrets>,
    /// HTTP client
    pub(crate) client: Client,
    backoff_until: Arc<RwLock<Option<Instant>>>,
    sso_token: Arc<RwLock<Option<SsoToken>>>,
}

impl Esi {
    /// Consume the builder, creating an instance of this struct.
    pub(crate) fn from_builder(builder: EsiBuilder) -> DumpResult<Self> {
        let client = builder.construct_client()?;
        let secrets = builder.construct_secrets()?;
        let e = Esi {
            base_api_url: builder.base_api_url.unwrap_or(BASE_URL.to_string()),
            token_url: builder.token_url.unwrap_or(TOKEN_URL.to_string()),
            secrets,
            client,
            backoff_until: Arc::new(RwLock::new(None)),
            sso_token: Arc::new(RwLock::new(None)),
        };
        Ok(e)
    }

    /// Make a request to ESI.
    ///
    /// This is the single fetch primitive every downloader in this crate
    /// sits on. `uri` is appended to the base API URL. Up to `trials`
    /// HTTP attempts are made, the first included; retryable responses
    /// (transport errors, 5xx, rate limits) arm the process-wide backoff
    /// gate and consume a trial, and exhaustion surfaces as
    /// [`DumpError::NoTrialsLeft`] wrapping the last cause. Any other
    /// non-200 status returns [`DumpError::Esi`] without retrying.
    ///
    /// `authenticated` requests carry a bearer token from the SSO cache;
    /// calling this without secrets on the client is a programming error
    /// surfaced as [`DumpError::MissingSecrets`], never retried.
    ///
    /// Cancellation of `ct` is propagated unchanged and a token that is
    /// already cancelled performs no network I/O.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        ct: &CancellationToken,
        method: Method,
        uri: &str,
        authenticated: bool,
        trials: u32,
    ) -> DumpResult<EsiResponse<T>> {
        let mut remaining = trials;
        let mut last_cause: Option<DumpError> = None;

        loop {
            if remaining == 0 {
                return Err(DumpError::NoTrialsLeft(last_cause.map(Box::new)));
            }
            if ct.is_cancelled() {
                return Err(DumpError::Cancelled);
            }

            // Wait for the api to be clear of any backoff
            self.clear_timeout(ct).await?;

            debug!("Making {method} request to {uri}");
            let mut request = self
                .client
                .request(method.clone(), format!("{}{uri}", self.base_api_url));
            if authenticated {
                let token = self.acquire_sso_token(ct).await?;
                request = request.header(
                    header::AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {token}"))?,
                );
            }

            let response = tokio::select! {
                _ = ct.cancelled() => return Err(DumpError::Cancelled),
                result = request.send() => match result {
                    Ok(response) => response,
                    Err(e) => {
                        if ct.is_cancelled() {
                            return Err(DumpError::Cancelled);
                        }
                        debug!("Esi fetch: transport error: {e}");
                        remaining -= 1;
                        last_cause = Some(e.into());
                        continue;
                    }
                },
            };

            let status = response.status().as_u16();
            match status {
                200 => {
                    let pages = parse_pages(response.headers());
                    let body = match response.bytes().await {
                        Ok(body) => body,
                        Err(e) => {
                            remaining -= 1;
                            last_cause = Some(e.into());
                            continue;
                        }
                    };
                    match serde_json::from_slice::<T>(&body) {
                        Ok(data) => return Ok(EsiResponse { data, pages }),
                        Err(e) => {
                            warn!("Esi fetch: can't decode 200 response body");
                            remaining -= 1;
                            last_cause = Some(e.into());
                        }
                    }
                }
                500 | 503 => {
                    self.set_timeout(Duration::from_secs(20)).await;
                    warn!("Esi fetch: 20s implicit esi timeout on status {status}");
                    remaining -= 1;
                    last_cause = Some(DumpError::ImplicitTimeout);
                }
                429 => {
                    let timeout = match header_secs(response.headers(), RETRY_AFTER_HEADER) {
                        Some(secs) if (0..=240).contains(&secs) => {
                            Duration::from_secs(secs as u64)
                        }
                        Some(secs) => {
                            warn!("Esi fetch: Retry-After out of range: {secs}s");
                            Duration::from_secs(20)
                        }
                        None => {
                            warn!("Esi fetch: no usable Retry-After provided");
                            Duration::from_secs(20)
                        }
                    };
                    self.set_timeout(timeout).await;
                    warn!("Esi fetch: {}s request rate timeout", timeout.as_secs());
                    remaining -= 1;
                    last_cause = Some(DumpError::RequestRateTimeout);
                }
                420 => {
                    let timeout = match header_secs(response.headers(), ERROR_LIMIT_RESET_HEADER) {
                        Some(secs) if (0..=120).contains(&secs) => {
                            Duration::from_secs(secs as u64)
                        }
                        Some(secs) => {
                            warn!("Esi fetch: X-Esi-Error-Limit-Reset out of range: {secs}s");
                            Duration::from_secs(10)
                        }
                        None => {
                            warn!("Esi fetch: can't decode X-Esi-Error-Limit-Reset");
                            Duration::from_secs(10)
                        }
                    };
                    self.set_timeout(timeout).await;
                    warn!("Esi fetch: {}s error rate timeout", timeout.as_secs());
                    remaining -= 1;
                    last_cause = Some(DumpError::ErrorRateTimeout);
                }
                504 => {
                    let timeout = match response.json::<JsonTimeoutError>().await {
                        Ok(body) if (0..=120).contains(&body.timeout) => {
                            Duration::from_secs(body.timeout as u64)
                        }
                        Ok(body) => {
                            warn!("Esi fetch: esi timeout out of range: {}s", body.timeout);
                            Duration::from_secs(10)
                        }
                        Err(_) => {
                            warn!("Esi fetch: can't decode esi timeout");
                            Duration::from_secs(10)
                        }
                    };
                    self.set_timeout(timeout).await;
                    warn!("Esi fetch: {}s explicit esi timeout", timeout.as_secs());
                    remaining -= 1;
                    last_cause = Some(DumpError::ExplicitTimeout);
                }
                code => match response.json::<JsonEsiError>().await {
                    Ok(body) => {
                        return Err(DumpError::Esi {
                            code,
                            message: body.error,
                        })
                    }
                    Err(e) => {
                        warn!("Esi fetch: can't decode esi error");
                        remaining -= 1;
                        last_cause = Some(e.into());
                    }
                },
            }
        }
    }

    /// Request a bearer token, refreshing the memoised one when expired.
    ///
    /// Concurrent callers may race through a refresh; the last writer
    /// wins and later calls use the stored token.
    pub(crate) async fn acquire_sso_token(&self, ct: &CancellationToken) -> DumpResult<String> {
        let secrets = self.secrets.as_ref().ok_or(DumpError::MissingSecrets)?;

        {
            let token = self.sso_token.read().await;
            if let Some(token) = token.as_ref() {
                if Instant::now() < token.expires_at {
                    return Ok(token.access_token.clone());
                }
            }
        }

        debug!("Refreshing the SSO access token");
        let now = Instant::now();
        let request = self
            .client
            .post(&self.token_url)
            .header(
                header::AUTHORIZATION,
                basic_auth_header(&secrets.client_id, &secrets.client_secret)?,
            )
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", secrets.refresh_token.as_str()),
            ]);
        let response = tokio::select! {
            _ = ct.cancelled() => return Err(DumpError::Cancelled),
            result = request.send() => result?,
        };
        let status = response.status().as_u16();
        if status != 200 {
            warn!("Got status {status} when refreshing the SSO token");
            return Err(DumpError::SsoStatus(status));
        }
        let data: SsoTokenResponse = response.json().await?;
        if data.token_type != "Bearer" {
            return Err(DumpError::SsoTokenType(data.token_type));
        }
        if data.refresh_token != secrets.refresh_token {
            return Err(DumpError::SsoRefreshRotated);
        }
        if data.expires_in <= 0 {
            return Err(DumpError::SsoExpiry(data.expires_in));
        }

        let mut token = self.sso_token.write().await;
        *token = Some(SsoToken {
            access_token: data.access_token.clone(),
            expires_at: now + Duration::from_secs(data.expires_in as u64),
        });
        Ok(data.access_token)
    }

    /// Arm the process-wide backoff gate for `duration` from now.
    pub(crate) async fn set_timeout(&self, duration: Duration) {
        let mut gate = self.backoff_until.write().await;
        *gate = Some(Instant::now() + duration);
    }

    /// Wait until the backoff gate is in the past.
    ///
    /// The gate may be re-armed by a concurrent fetch while we sleep, so
    /// re-read it after every wakeup. Waits longer than
    /// [`GATE_CLEAR_CEILING`] fail instead of queueing forever.
    async fn clear_timeout(&self, ct: &CancellationToken) -> DumpResult<()> {
        let ceiling = Instant::now() + GATE_CLEAR_CEILING;
        loop {
            let until = *self.backoff_until.read().await;
            let Some(until) = until else { return Ok(()) };
            if until <= Instant::now() {
                return Ok(());
            }
            tokio::select! {
                _ = ct.cancelled() => return Err(DumpError::Cancelled),
                _ = tokio::time::sleep_until(ceiling) => return Err(DumpError::TimeoutClearing),
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }
}

/// Sleep that aborts with [`DumpError::Cancelled`] when the token fires.
pub(crate) async fn sleep_with_token(ct: &CancellationToken, duration: Duration) -> DumpResult<()> {
    tokio::select! {
        _ = ct.cancelled() => Err(DumpError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

fn parse_pages(headers: &HeaderMap) -> u32 {
    let Some(value) = headers.get(PAGES_HEADER) else {
        return 0;
    };
    match value.to_str().ok().and_then(|v| v.parse::<u32>().ok()) {
        Some(pages) if pages <= MAX_PAGES => pages,
        Some(pages) => {
            warn!("Esi fetch: X-Pages out of range: {pages}");
            0
        }
        None => {
            warn!("Esi fetch: can't decode X-Pages");
            0
        }
    }
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse::<i64>().ok()
}

fn basic_auth_header(user: &str, password: &str) -> DumpResult<HeaderValue> {
    let value = base64
        .encode(format!("{user}:{password}"))
        .replace(['\n', ' '], "");
    Ok(HeaderValue::from_str(&format!("Basic {value}"))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::EsiBuilder;

    #[test]
    fn test_sso_response_deserialize() {
        let source = r#"{
            "access_token": "abc",
            "token_type": "Bearer",
            "expires_in": 1000,
            "refresh_token": "def"
          }"#;
        let data: SsoTokenResponse = serde_json::from_str(source).unwrap();

        assert_eq!(data.access_token, "abc");
        assert_eq!(data.token_type, "Bearer");
        assert_eq!(data.expires_in, 1000);
        assert_eq!(data.refresh_token, "def");
    }

    #[test]
    fn test_parse_pages() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_pages(&headers), 0);

        headers.insert(PAGES_HEADER, HeaderValue::from_static("17"));
        assert_eq!(parse_pages(&headers), 17);

        headers.insert(PAGES_HEADER, HeaderValue::from_static("10001"));
        assert_eq!(parse_pages(&headers), 0);

        headers.insert(PAGES_HEADER, HeaderValue::from_static("what"));
        assert_eq!(parse_pages(&headers), 0);
    }

    #[test]
    fn test_basic_auth_header() {
        let value = basic_auth_header("user", "pass").unwrap();
        assert_eq!(value, "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_gate_blocks_until_deadline() {
        let esi = EsiBuilder::new().user_agent("test").build().unwrap();
        let ct = CancellationToken::new();

        esi.set_timeout(Duration::from_millis(300)).await;
        let before = Instant::now();
        esi.clear_timeout(&ct).await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_gate_clear_when_unarmed() {
        let esi = EsiBuilder::new().user_agent("test").build().unwrap();
        let ct = CancellationToken::new();

        let before = Instant::now();
        esi.clear_timeout(&ct).await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_gate_wait_aborts_on_cancel() {
        let esi = EsiBuilder::new().user_agent("test").build().unwrap();
        let ct = CancellationToken::new();

        esi.set_timeout(Duration::from_secs(60)).await;
        ct.cancel();
        let err = esi.clear_timeout(&ct).await.unwrap_err();
        assert!(matches!(err, DumpError::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_without_secrets_fails_fast() {
        let esi = EsiBuilder::new().user_agent("test").build().unwrap();
        let ct = CancellationToken::new();

        let err = esi
            .fetch::<serde_json::Value>(&ct, Method::GET, "/universe/structures/1", true, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::MissingSecrets));
    }

    #[tokio::test]
    async fn test_fetch_cancelled_before_start() {
        let esi = EsiBuilder::new().user_agent("test").build().unwrap();
        let ct = CancellationToken::new();
        ct.cancel();

        let err = esi
            .fetch::<serde_json::Value>(&ct, Method::GET, "/markets/1/orders", false, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_zero_trials() {
        let esi = EsiBuilder::new().user_agent("test").build().unwrap();
        let ct = CancellationToken::new();

        let err = esi
            .fetch::<serde_json::Value>(&ct, Method::GET, "/markets/1/orders", false, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::NoTrialsLeft(None)));
    }
}
