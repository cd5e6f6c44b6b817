//! Builders

use crate::prelude::*;
use reqwest::{header, Client};
use std::time::Duration;

/// Builder for the `Esi` struct.
///
/// # Example
///
/// ```rust
/// # use eve_market_dump::prelude::EsiBuilder;
/// let esi = EsiBuilder::new()
///     .user_agent("some user agent")
///     .build()
///     .unwrap();
/// ```
///
/// # Including SSO secrets
///
/// Resolving player structures requires calls on behalf of an
/// authenticated character, which the client performs with the SSO
/// refresh-token flow. Provide all three secret values for that; a
/// client built without them can still make every public call:
///
/// ```rust
/// # use eve_market_dump::prelude::EsiBuilder;
/// let esi = EsiBuilder::new()
///     .user_agent("some user agent")
///     .client_id("your_client_id")
///     .client_secret("your_client_secret")
///     .refresh_token("your_refresh_token")
///     .build()
///     .unwrap();
/// ```
///
/// Note that you always need to set the user agent, as this is good
/// API usage behavior.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EsiBuilder {
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
    pub(crate) refresh_token: Option<String>,
    pub(crate) base_api_url: Option<String>,
    pub(crate) token_url: Option<String>,
    pub(crate) user_agent: Option<String>,
    pub(crate) http_timeout: Option<u64>,
}

impl EsiBuilder {
    /// Start a new builder.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the client_id.
    pub fn client_id(mut self, val: &str) -> Self {
        self.client_id = Some(val.to_owned());
        self
    }

    /// Set the client_secret (https://docs.esi.evetech.net/docs/sso/web_based_sso_flow.html).
    pub fn client_secret(mut self, val: &str) -> Self {
        self.client_secret = Some(val.to_owned());
        self
    }

    /// Set the refresh_token of the character used for structure lookups.
    pub fn refresh_token(mut self, val: &str) -> Self {
        self.refresh_token = Some(val.to_owned());
        self
    }

    /// Set the base_api_url.
    pub fn base_api_url(mut self, val: &str) -> Self {
        self.base_api_url = Some(val.to_owned());
        self
    }

    /// Set the token_url.
    pub fn token_url(mut self, val: &str) -> Self {
        self.token_url = Some(val.to_owned());
        self
    }

    /// Set the user_agent.
    pub fn user_agent(mut self, val: &str) -> Self {
        self.user_agent = Some(val.to_owned());
        self
    }

    /// Set the timeout to use in millis when sending HTTP requests.
    ///
    /// Will default to 7,000 (7 seconds) if not set. ESI answers well
    /// within that when it answers at all.
    pub fn http_timeout(mut self, val: Option<u64>) -> Self {
        self.http_timeout = val;
        self
    }

    pub(crate) fn construct_client(&self) -> DumpResult<Client> {
        let http_timeout = self
            .http_timeout
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(7));
        let headers = {
            let mut map = header::HeaderMap::new();
            let user_agent = &self
                .user_agent
                .as_ref()
                .ok_or_else(|| DumpError::EmptyClientValue("user_agent".to_owned()))?
                .to_owned();
            map.insert(
                header::USER_AGENT,
                header::HeaderValue::from_str(user_agent)?,
            );
            map.insert(
                header::ACCEPT,
                header::HeaderValue::from_static("application/json"),
            );
            map
        };
        let client = Client::builder()
            .timeout(http_timeout)
            .default_headers(headers)
            .build()?;
        Ok(client)
    }

    pub(crate) fn construct_secrets(&self) -> DumpResult<Option<ApiSecrets>> {
        match (&self.client_id, &self.client_secret, &self.refresh_token) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => Ok(Some(ApiSecrets {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                refresh_token: refresh_token.clone(),
            })),
            (None, None, None) => Ok(None),
            _ => Err(DumpError::IncompleteSecrets),
        }
    }

    /// Construct the `Esi` instance.
    ///
    /// There are a few things that could go wrong, like not setting the
    /// user agent, providing a user agent that is not a valid HTTP
    /// header value, or setting only part of the SSO secrets.
    pub fn build(self) -> DumpResult<Esi> {
        Esi::from_builder(self)
    }
}
