//! Errors

use thiserror::Error;

/// Errors that can occur while downloading market dumps.
#[derive(Debug, Error)]
pub enum DumpError {
    /// Error that can be thrown if the `EsiBuilder` struct is
    /// invalid when `.build()` is called.
    #[error("Missing required builder struct value '{0}'")]
    EmptyClientValue(String),
    /// An incomplete secrets bundle was given to the builder. The SSO
    /// refresh-token flow needs all three of client id, client secret
    /// and refresh token.
    #[error("Incomplete SSO secrets: set all of client_id, client_secret and refresh_token, or none")]
    IncompleteSecrets,
    /// Error for if a provided header value (like the user-agent)
    /// has invalid characters.
    #[error("Invalid HTTP header value")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// Error for if the underlying `reqwest::Client` could not be
    /// constructed or a request could not be sent.
    #[error("HTTP transport error")]
    ReqwestError(#[from] reqwest::Error),
    /// Error for being unable to parse JSON from anywhere.
    #[error("Failed to serialize/deserialize JSON; this may be due to unexpected data or invalid struct field(s)")]
    FailedJsonParse(#[from] serde_json::Error),
    /// A non-retryable response from ESI, surfaced with the HTTP status
    /// code and the `error` field of the body.
    #[error("Esi error {code}: {message}")]
    Esi {
        /// HTTP status code of the response.
        code: u16,
        /// The `error` field of the response body.
        message: String,
    },
    /// The retry budget of a fetch is exhausted. Wraps the error that
    /// consumed the last trial, when there was one.
    #[error("No trials left")]
    NoTrialsLeft(#[source] Option<Box<DumpError>>),
    /// ESI answered 500 or 503; the whole process backs off for 20 seconds.
    #[error("Esi implicit timeout")]
    ImplicitTimeout,
    /// ESI answered 429; the whole process backs off per `Retry-After`.
    #[error("Esi request rate timeout")]
    RequestRateTimeout,
    /// ESI answered 420; the whole process backs off per
    /// `X-Esi-Error-Limit-Reset`.
    #[error("Esi error rate timeout")]
    ErrorRateTimeout,
    /// ESI answered 504 with an explicit timeout in the body.
    #[error("Esi explicit timeout")]
    ExplicitTimeout,
    /// The process-wide backoff gate did not clear within its 15 minute
    /// ceiling.
    #[error("Esi timeout clearing")]
    TimeoutClearing,
    /// The caller's cancellation token fired. Propagated unchanged so
    /// shutdown is never mistaken for an upstream failure.
    #[error("Operation cancelled")]
    Cancelled,
    /// Error for if a request is made to an endpoint that requires
    /// authentication, but the client holds no secrets. This is a
    /// programming error, not a retryable condition.
    #[error("This endpoint requires SSO secrets")]
    MissingSecrets,
    /// The SSO token endpoint answered with a non-200 status.
    #[error("SSO token endpoint returned status {0}")]
    SsoStatus(u16),
    /// The SSO response carried a token type other than `Bearer`.
    #[error("Unexpected SSO token type '{0}'")]
    SsoTokenType(String),
    /// The SSO response rotated the refresh token, which this client
    /// does not support.
    #[error("SSO refresh token rotation is not supported")]
    SsoRefreshRotated,
    /// The SSO response carried a non-positive `expires_in`.
    #[error("SSO token already expired ({0}s)")]
    SsoExpiry(i64),
    /// An order carried a `range` string outside the documented set.
    #[error("Invalid order range '{0}'")]
    InvalidOrderRange(String),
    /// A date or datetime string from ESI failed to parse.
    #[error("Invalid date '{value}'")]
    InvalidDate {
        /// The string as received from ESI.
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    /// An NPC station id had no row in the embedded stations table,
    /// meaning `data/stations.csv` needs renewing.
    #[error("Unknown NPC station {0}, you should renew data/stations.csv")]
    UnknownNpcStation(u64),
    /// A solar system id had no row in the embedded systems table,
    /// meaning `data/systems.csv` needs renewing.
    #[error("Unknown solar system {0}, you should renew data/systems.csv")]
    UnknownSystem(u64),
    /// An embedded reference CSV did not start with the expected header.
    #[error("Invalid reference csv header: {0}")]
    InvalidCsvHeader(String),
    /// A reference CSV row failed to read or decode.
    #[error("Reference csv error")]
    Csv(#[from] csv::Error),
    /// Error for snapshot file I/O.
    #[error("Snapshot file I/O error")]
    Io(#[from] std::io::Error),
    /// The snapshot file was queried after `close`.
    #[error("History snapshot is closed")]
    SnapshotClosed,
}

/// Crate `Result` wrapper.
pub type DumpResult<T> = Result<T, DumpError>;
