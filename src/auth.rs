#![expect(
    clippy::module_name_repetitions,
    reason = "Auth types deliberately include the module name for clarity"
)]

//! Authorization header strategies for the realtime transport.
//!
//! Every handshake and subscription start frame carries an authorization
//! header object. The shape of that object depends on the configured
//! [`AuthMode`]: a static API key, a SigV4-signed request, a bearer token
//! from a user pool or OpenID provider, or a caller-supplied token for
//! custom (Lambda) authorizers. Strategy selection happens once per
//! handshake/start; an unconfigured mode yields empty headers and a log
//! line, while a configured mode missing its material is an error.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac as _};
use secrecy::{ExposeSecret as _, SecretString};
use sha2::{Digest as _, Sha256};
use url::Url;

use crate::error::{Error, Kind};
use crate::Result;

const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const DATE_STAMP_FORMAT: &str = "%Y%m%d";
const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNING_SERVICE: &str = "appsync";

const ACCEPT_HEADER: &str = "application/json, text/javascript";
const CONTENT_ENCODING_HEADER: &str = "amz-1.0";
const CONTENT_TYPE_HEADER: &str = "application/json; charset=UTF-8";

const AUTHORIZATION_HEADER: &str = "Authorization";

type HmacSha256 = Hmac<Sha256>;

/// Supported authentication modes, mirroring the gateway's GraphQL auth
/// configuration.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum AuthMode {
    /// Static API key
    #[strum(serialize = "API_KEY")]
    ApiKey,
    /// SigV4-signed request using IAM credentials
    #[strum(serialize = "AWS_IAM")]
    Iam,
    /// Bearer token from a Cognito user pool session
    #[strum(serialize = "AMAZON_COGNITO_USER_POOLS")]
    UserPools,
    /// Bearer token from a federated OpenID provider
    #[strum(serialize = "OPENID_CONNECT")]
    OpenIdConnect,
    /// Caller-supplied token validated by a custom Lambda authorizer
    #[strum(serialize = "AWS_LAMBDA")]
    Lambda,
}

/// IAM signing material supplied by a [`CredentialsProvider`].
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct SigningCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: Option<SecretString>,
}

impl SigningCredentials {
    #[must_use]
    pub fn new(
        access_key_id: String,
        secret_access_key: SecretString,
        session_token: Option<SecretString>,
    ) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            session_token,
        }
    }
}

/// Supplies the current IAM signing credentials on demand.
///
/// Failures propagate as handshake failures and are retried unless
/// classified non-retryable.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<SigningCredentials>;
}

/// Supplies the current bearer token for user-pool or OpenID modes.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<SecretString>;
}

/// A configured auth mode is missing the material its strategy needs.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct NoAuthStrategy {
    pub mode: AuthMode,
    pub missing: &'static str,
}

impl fmt::Display for NoAuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no authorization strategy for {}: missing {}",
            self.mode, self.missing
        )
    }
}

impl StdError for NoAuthStrategy {}

impl From<NoAuthStrategy> for Error {
    fn from(e: NoAuthStrategy) -> Self {
        Error::with_source(Kind::Auth, e)
    }
}

/// Authentication configuration for a client or a single subscription.
#[derive(Clone, Default, bon::Builder)]
pub struct AuthConfig {
    /// Selected mode. `None` sends empty authorization headers.
    pub mode: Option<AuthMode>,
    /// API key for [`AuthMode::ApiKey`]
    #[builder(into)]
    pub api_key: Option<SecretString>,
    /// Signing region for [`AuthMode::Iam`]
    #[builder(into)]
    pub region: Option<String>,
    /// Token source for [`AuthMode::UserPools`] and [`AuthMode::OpenIdConnect`]
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Credential source for [`AuthMode::Iam`]
    pub credentials_provider: Option<Arc<dyn CredentialsProvider>>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("mode", &self.mode)
            .field("api_key", &self.api_key)
            .field("region", &self.region)
            .field("token_provider", &self.token_provider.is_some())
            .field("credentials_provider", &self.credentials_provider.is_some())
            .finish()
    }
}

/// Produce the authorization header object for one handshake or start
/// frame.
///
/// `canonical_uri` is `/connect` for the handshake and empty for start
/// frames; `payload` is the serialized body the headers authorize.
/// Caller-supplied `additional_headers` are consulted for the explicit
/// authorization override used by [`AuthMode::Lambda`]; merging them
/// over the returned map is the caller's responsibility.
pub(crate) async fn authorization_headers(
    auth: &AuthConfig,
    endpoint: &Url,
    canonical_uri: &str,
    payload: &str,
    additional_headers: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    // Host presence is validated when the client is constructed.
    let host = endpoint.host_str().unwrap_or_default();

    let Some(mode) = auth.mode else {
        tracing::debug!("no authentication mode configured, sending empty headers");
        return Ok(BTreeMap::new());
    };

    tracing::debug!(%mode, "authenticating");

    match mode {
        AuthMode::ApiKey => api_key_headers(auth, host),
        AuthMode::Iam => iam_headers(auth, endpoint, canonical_uri, payload).await,
        AuthMode::UserPools | AuthMode::OpenIdConnect => token_headers(auth, host, mode).await,
        AuthMode::Lambda => lambda_headers(host, additional_headers),
    }
}

fn api_key_headers(auth: &AuthConfig, host: &str) -> Result<BTreeMap<String, String>> {
    let api_key = auth.api_key.as_ref().ok_or(NoAuthStrategy {
        mode: AuthMode::ApiKey,
        missing: "api key",
    })?;

    let mut headers = BTreeMap::new();
    headers.insert("host".to_owned(), host.to_owned());
    headers.insert(
        "x-amz-date".to_owned(),
        Utc::now().format(AMZ_DATE_FORMAT).to_string(),
    );
    headers.insert(
        "x-api-key".to_owned(),
        api_key.expose_secret().to_owned(),
    );
    Ok(headers)
}

async fn token_headers(
    auth: &AuthConfig,
    host: &str,
    mode: AuthMode,
) -> Result<BTreeMap<String, String>> {
    let provider = auth.token_provider.as_ref().ok_or(NoAuthStrategy {
        mode,
        missing: "token provider",
    })?;
    let token = provider.token().await?;

    let mut headers = BTreeMap::new();
    headers.insert(
        AUTHORIZATION_HEADER.to_owned(),
        token.expose_secret().to_owned(),
    );
    headers.insert("host".to_owned(), host.to_owned());
    Ok(headers)
}

fn lambda_headers(
    host: &str,
    additional_headers: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let token = additional_headers
        .get(AUTHORIZATION_HEADER)
        .ok_or(NoAuthStrategy {
            mode: AuthMode::Lambda,
            missing: "authorization header",
        })?;

    let mut headers = BTreeMap::new();
    headers.insert(AUTHORIZATION_HEADER.to_owned(), token.clone());
    headers.insert("host".to_owned(), host.to_owned());
    Ok(headers)
}

async fn iam_headers(
    auth: &AuthConfig,
    endpoint: &Url,
    canonical_uri: &str,
    payload: &str,
) -> Result<BTreeMap<String, String>> {
    let provider = auth.credentials_provider.as_ref().ok_or(NoAuthStrategy {
        mode: AuthMode::Iam,
        missing: "credentials provider",
    })?;
    let region = auth.region.as_deref().ok_or(NoAuthStrategy {
        mode: AuthMode::Iam,
        missing: "region",
    })?;
    let credentials = provider.credentials().await?;

    let mut signing_url = endpoint.clone();
    signing_url.set_path(&format!("{}{canonical_uri}", endpoint.path()));

    sigv4_headers(&credentials, region, &signing_url, payload, Utc::now())
}

/// SigV4-sign a realtime request and return the full header object the
/// gateway expects alongside the signature.
fn sigv4_headers(
    credentials: &SigningCredentials,
    region: &str,
    url: &Url,
    payload: &str,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, String>> {
    let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
    let date_stamp = now.format(DATE_STAMP_FORMAT).to_string();
    let host = url.host_str().unwrap_or_default();

    let mut headers = BTreeMap::new();
    headers.insert("accept".to_owned(), ACCEPT_HEADER.to_owned());
    headers.insert("content-encoding".to_owned(), CONTENT_ENCODING_HEADER.to_owned());
    headers.insert("content-type".to_owned(), CONTENT_TYPE_HEADER.to_owned());
    headers.insert("host".to_owned(), host.to_owned());
    headers.insert("x-amz-date".to_owned(), amz_date.clone());
    if let Some(session_token) = &credentials.session_token {
        headers.insert(
            "x-amz-security-token".to_owned(),
            session_token.expose_secret().to_owned(),
        );
    }

    let mut canonical_headers = String::new();
    for (name, value) in &headers {
        let _ = writeln!(canonical_headers, "{name}:{value}");
    }
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "POST\n{}\n\n{canonical_headers}\n{signed_headers}\n{}",
        url.path(),
        hex(&Sha256::digest(payload.as_bytes())),
    );

    let scope = format!("{date_stamp}/{region}/{SIGNING_SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{SIGNING_ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical_request.as_bytes())),
    );

    let secret = format!("AWS4{}", credentials.secret_access_key.expose_secret());
    let k_date = hmac_sha256(secret.as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SIGNING_SERVICE.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    headers.insert(
        AUTHORIZATION_HEADER.to_owned(),
        format!(
            "{SIGNING_ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id,
        ),
    );
    Ok(headers)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn endpoint() -> Url {
        Url::parse("https://abcdefghijklmnopqrstuvwxyz.appsync-api.us-east-1.amazonaws.com/graphql")
            .expect("valid endpoint")
    }

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn token(&self) -> Result<SecretString> {
            Ok(SecretString::from("jwt-token".to_owned()))
        }
    }

    struct StaticCredentials {
        session_token: Option<SecretString>,
    }

    #[async_trait]
    impl CredentialsProvider for StaticCredentials {
        async fn credentials(&self) -> Result<SigningCredentials> {
            Ok(SigningCredentials::new(
                "AKIDEXAMPLE".to_owned(),
                SecretString::from("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_owned()),
                self.session_token.clone(),
            ))
        }
    }

    #[tokio::test]
    async fn unconfigured_mode_yields_empty_headers() {
        let auth = AuthConfig::default();

        let headers = authorization_headers(&auth, &endpoint(), "/connect", "{}", &BTreeMap::new())
            .await
            .expect("empty headers");

        assert!(headers.is_empty(), "no mode means no headers");
    }

    #[tokio::test]
    async fn api_key_header_shape() {
        let auth = AuthConfig::builder()
            .mode(AuthMode::ApiKey)
            .api_key("da2-example".to_owned())
            .build();

        let headers = authorization_headers(&auth, &endpoint(), "/connect", "{}", &BTreeMap::new())
            .await
            .expect("api key headers");

        assert_eq!(headers.get("x-api-key").map(String::as_str), Some("da2-example"));
        assert_eq!(
            headers.get("host").map(String::as_str),
            Some("abcdefghijklmnopqrstuvwxyz.appsync-api.us-east-1.amazonaws.com")
        );
        let date = headers.get("x-amz-date").expect("date header");
        assert_eq!(date.len(), 16, "compact ISO8601 stamp");
        assert!(date.ends_with('Z'), "UTC stamp");
    }

    #[tokio::test]
    async fn missing_api_key_is_an_error() {
        let auth = AuthConfig::builder().mode(AuthMode::ApiKey).build();

        let error = authorization_headers(&auth, &endpoint(), "/connect", "{}", &BTreeMap::new())
            .await
            .expect_err("api key required");

        assert_eq!(error.kind(), Kind::Auth);
        assert!(error.downcast_ref::<NoAuthStrategy>().is_some());
    }

    #[tokio::test]
    async fn token_provider_supplies_authorization() {
        let auth = AuthConfig::builder()
            .mode(AuthMode::UserPools)
            .token_provider(Arc::new(StaticToken))
            .build();

        let headers = authorization_headers(&auth, &endpoint(), "", "{}", &BTreeMap::new())
            .await
            .expect("token headers");

        assert_eq!(headers.get(AUTHORIZATION_HEADER).map(String::as_str), Some("jwt-token"));
        assert!(headers.contains_key("host"), "token headers carry the host");
    }

    #[tokio::test]
    async fn lambda_mode_uses_caller_override() {
        let auth = AuthConfig::builder().mode(AuthMode::Lambda).build();
        let mut additional = BTreeMap::new();
        additional.insert(AUTHORIZATION_HEADER.to_owned(), "custom-token".to_owned());

        let headers = authorization_headers(&auth, &endpoint(), "", "{}", &additional)
            .await
            .expect("lambda headers");

        assert_eq!(
            headers.get(AUTHORIZATION_HEADER).map(String::as_str),
            Some("custom-token")
        );
    }

    #[tokio::test]
    async fn lambda_mode_without_token_is_an_error() {
        let auth = AuthConfig::builder().mode(AuthMode::Lambda).build();

        let error = authorization_headers(&auth, &endpoint(), "", "{}", &BTreeMap::new())
            .await
            .expect_err("authorization override required");

        assert_eq!(error.kind(), Kind::Auth);
    }

    #[test]
    fn sigv4_signature_structure() {
        let credentials = SigningCredentials::new(
            "AKIDEXAMPLE".to_owned(),
            SecretString::from("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_owned()),
            None,
        );
        let url = Url::parse(
            "https://abcdefghijklmnopqrstuvwxyz.appsync-api.us-east-1.amazonaws.com/graphql/connect",
        )
        .expect("valid url");
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).single().expect("valid time");

        let headers =
            sigv4_headers(&credentials, "us-east-1", &url, "{}", now).expect("signed headers");

        let authorization = headers.get(AUTHORIZATION_HEADER).expect("authorization");
        assert!(
            authorization.starts_with(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20230101/us-east-1/appsync/aws4_request"
            ),
            "credential scope mismatch: {authorization}"
        );
        assert!(
            authorization
                .contains("SignedHeaders=accept;content-encoding;content-type;host;x-amz-date"),
            "signed header list mismatch: {authorization}"
        );
        let signature = authorization
            .rsplit_once("Signature=")
            .map(|(_, sig)| sig)
            .expect("signature present");
        assert_eq!(signature.len(), 64, "hex-encoded sha256 signature");
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(headers.get("x-amz-date").map(String::as_str), Some("20230101T120000Z"));
    }

    #[test]
    fn sigv4_session_token_is_signed() {
        let credentials = SigningCredentials::new(
            "AKIDEXAMPLE".to_owned(),
            SecretString::from("secret".to_owned()),
            Some(SecretString::from("session-token".to_owned())),
        );
        let url = Url::parse("https://example.com/graphql/connect").expect("valid url");
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).single().expect("valid time");

        let headers = sigv4_headers(&credentials, "us-east-1", &url, "{}", now).expect("signed");

        assert_eq!(
            headers.get("x-amz-security-token").map(String::as_str),
            Some("session-token")
        );
        let authorization = headers.get(AUTHORIZATION_HEADER).expect("authorization");
        assert!(
            authorization.contains("x-amz-security-token"),
            "session token must be part of the signed header list"
        );
    }

    #[test]
    fn signatures_differ_by_payload() {
        let credentials = SigningCredentials::new(
            "AKIDEXAMPLE".to_owned(),
            SecretString::from("secret".to_owned()),
            None,
        );
        let url = Url::parse("https://example.com/graphql").expect("valid url");
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).single().expect("valid time");

        let a = sigv4_headers(&credentials, "us-east-1", &url, "{}", now).expect("signed");
        let b = sigv4_headers(&credentials, "us-east-1", &url, r#"{"query":"x"}"#, now)
            .expect("signed");

        assert_ne!(
            a.get(AUTHORIZATION_HEADER),
            b.get(AUTHORIZATION_HEADER),
            "payload hash must feed the signature"
        );
    }
}
