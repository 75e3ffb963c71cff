//! AWS Signature Version 4 request signing for Bedrock-style upstreams.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::{RelayError, Result};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const AMZ_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");

type HmacSha256 = Hmac<Sha256>;

fn signing_error(message: impl Into<String>) -> RelayError {
    RelayError::Signing(message.into())
}

/// `x-amz-date` value plus its `YYYYMMDD` prefix used in the credential scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Result<Self> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self> {
        let amz_date = datetime
            .format(AMZ_DATE_FORMAT)
            .map_err(|err| signing_error(format!("cannot format x-amz-date: {err}")))?;
        Self::from_amz_date(&amz_date)
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self> {
        let amz_date = amz_date.trim();
        let date = amz_date
            .get(..8)
            .filter(|date| date.bytes().all(|byte| byte.is_ascii_digit()))
            .ok_or_else(|| signing_error(format!("x-amz-date {amz_date:?} has no YYYYMMDD prefix")))?;
        Ok(Self {
            date: date.to_string(),
            amz_date: amz_date.to_string(),
        })
    }
}

/// `date/region/service/aws4_request`.
struct CredentialScope<'a> {
    date: &'a str,
    region: &'a str,
    service: &'a str,
}

impl fmt::Display for CredentialScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/aws4_request", self.date, self.region, self.service)
    }
}

#[derive(Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

impl fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self> {
        let signer = Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: session_token.filter(|token| !token.trim().is_empty()),
            region: region.into(),
            service: service.into(),
        };
        for (field, value) in [
            ("access_key", &signer.access_key),
            ("secret_key", &signer.secret_key),
            ("region", &signer.region),
            ("service", &signer.service),
        ] {
            if value.trim().is_empty() {
                return Err(signing_error(format!("sigv4 {field} must not be empty")));
            }
        }
        Ok(signer)
    }

    /// Signs one request. `headers` are the extra headers to cover; `host`,
    /// `x-amz-date`, `x-amz-content-sha256` and the session token are always signed.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SigV4SigningResult> {
        let method = method.trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(signing_error("sigv4 method must not be empty"));
        }
        let url = Url::parse(url).map_err(|err| signing_error(format!("sigv4 url {url:?}: {err}")))?;
        let host = host_header(&url)?;
        let payload_hash = sha256_hex(payload);

        let mut signed = SignedHeaderSet::from_caller(headers);
        signed.set_default("host", &host);
        signed.set("x-amz-date", &timestamp.amz_date);
        signed.set_default("x-amz-content-sha256", &payload_hash);
        if let Some(token) = self.session_token.as_deref() {
            signed.set("x-amz-security-token", token);
        }
        let signed_headers = signed.names();

        let canonical_request = format!(
            "{method}\n{}\n{}\n{}\n{signed_headers}\n{payload_hash}",
            canonical_path(&url),
            canonical_query(&url),
            signed.canonical_block(),
        );

        let scope = CredentialScope {
            date: &timestamp.date,
            region: &self.region,
            service: &self.service,
        };
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            timestamp.amz_date,
            sha256_hex(canonical_request.as_bytes())
        );
        let key = self.signing_key(&timestamp.date)?;
        let signature = hex_encode(&hmac(&key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );
        Ok(SigV4SigningResult {
            headers: SigV4Headers {
                authorization,
                amz_date: timestamp.amz_date,
                content_sha256: payload_hash,
                host,
                security_token: self.session_token.clone(),
            },
            signed_headers,
            signature,
            canonical_request,
            string_to_sign,
        })
    }

    fn signing_key(&self, date: &str) -> Result<Vec<u8>> {
        let mut key = format!("AWS4{}", self.secret_key).into_bytes();
        for part in [date, self.region.as_str(), self.service.as_str(), "aws4_request"] {
            key = hmac(&key, part.as_bytes())?;
        }
        Ok(key)
    }
}

/// Lower-cased header names mapped to whitespace-collapsed values, sorted.
struct SignedHeaderSet(BTreeMap<String, String>);

impl SignedHeaderSet {
    fn from_caller(headers: &BTreeMap<String, String>) -> Self {
        let mut set = BTreeMap::<String, String>::new();
        for (name, value) in headers {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            let value = collapse_whitespace(value);
            set.entry(name)
                .and_modify(|existing| {
                    if !existing.is_empty() {
                        existing.push(',');
                    }
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        Self(set)
    }

    fn set(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_string(), collapse_whitespace(value));
    }

    fn set_default(&mut self, name: &str, value: &str) {
        self.0
            .entry(name.to_string())
            .or_insert_with(|| collapse_whitespace(value));
    }

    fn names(&self) -> String {
        self.0.keys().map(String::as_str).collect::<Vec<_>>().join(";")
    }

    fn canonical_block(&self) -> String {
        let mut block = String::new();
        for (name, value) in &self.0 {
            let _ = writeln!(block, "{name}:{value}");
        }
        block
    }
}

fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| signing_error(format!("sigv4 url {url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn canonical_path(url: &Url) -> String {
    match url.path() {
        "" => "/".to_string(),
        path => uri_encode(path, false),
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs = url
        .query_pairs()
        .map(|(name, value)| (uri_encode(&name, true), uri_encode(&value, true)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// RFC 3986 encoding with upper-case hex; `/` is kept in paths.
fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_' | b'.' | b'~')
            || (byte == b'/' && !encode_slash);
        if keep {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| signing_error(format!("sigv4 hmac key rejected: {err}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Headers a signed request must carry.
#[derive(Debug, Clone)]
pub struct SigV4Headers {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub host: String,
    pub security_token: Option<String>,
}

impl SigV4Headers {
    /// Overwrites any earlier signature headers in `headers`.
    pub fn apply_to(&self, headers: &mut HeaderMap) -> Result<()> {
        headers.remove("x-amz-security-token");
        let mut pairs = vec![
            ("authorization", self.authorization.as_str()),
            ("x-amz-date", self.amz_date.as_str()),
            ("x-amz-content-sha256", self.content_sha256.as_str()),
            ("host", self.host.as_str()),
        ];
        if let Some(token) = self.security_token.as_deref() {
            pairs.push(("x-amz-security-token", token));
        }
        for (name, value) in pairs {
            let value = HeaderValue::from_str(value)
                .map_err(|err| signing_error(format!("{name} is not a valid header value: {err}")))?;
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SigV4SigningResult {
    pub headers: SigV4Headers,
    pub signed_headers: String,
    pub signature: String,
    pub canonical_request: String,
    pub string_to_sign: String,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex_encode(&Sha256::digest(bytes))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
