//! Connection handshake metadata
//!
//! Agents identify themselves out-of-band, through headers on the WebSocket
//! upgrade request. A control connection carries the domain it wants to bind
//! and an upstream hint; a data connection carries the channel ID it answers.
//!
//! | Header           | Control  | Data     |
//! |------------------|----------|----------|
//! | `ServerKey`      | optional | optional |
//! | `ClientDomain`   | required | required |
//! | `ClientUpstream` | required | -        |
//! | `ChannelId`      | -        | required |
//! | `SessionId`      | -        | optional |
//!
//! Header names are case-insensitive; the presence of `ChannelId` marks a
//! data connection.
//!
//! The relay answers a control upgrade with a `SessionId` response header.
//! Agents echo it on every data connection so a late connection from an
//! earlier session is never matched to a channel of the current one.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

use crate::ChannelId;

/// Shared secret presented by the agent
pub const SERVER_KEY_HEADER: &str = "serverkey";
/// Domain the agent serves
pub const CLIENT_DOMAIN_HEADER: &str = "clientdomain";
/// Opaque description of the agent's local forwarding target
pub const CLIENT_UPSTREAM_HEADER: &str = "clientupstream";
/// Channel answered by a data connection
pub const CHANNEL_ID_HEADER: &str = "channelid";
/// Control session a data connection belongs to
pub const SESSION_ID_HEADER: &str = "sessionid";

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Missing handshake header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid {header} header: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },

    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Upstream must be an absolute URI: {0}")]
    InvalidUpstream(#[from] url::ParseError),

    #[error("Invalid channel ID: {0:?}")]
    InvalidChannelId(String),
}

/// Metadata presented when an agent opens its control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlHandshake {
    pub server_key: Option<String>,
    pub domain: String,
    pub upstream: Url,
}

/// Metadata presented when an agent opens a data connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHandshake {
    pub server_key: Option<String>,
    pub domain: String,
    pub channel_id: ChannelId,
    /// Session issued by the relay on the owning control connection
    pub session_id: Option<String>,
}

/// Either kind of handshake, as read from an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Control(ControlHandshake),
    Data(DataHandshake),
}

impl Handshake {
    /// Classify and parse the handshake headers of an upgrade request
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, HandshakeError> {
        if headers.contains_key(CHANNEL_ID_HEADER) {
            DataHandshake::from_headers(headers).map(Handshake::Data)
        } else {
            ControlHandshake::from_headers(headers).map(Handshake::Control)
        }
    }

    pub fn domain(&self) -> &str {
        match self {
            Handshake::Control(h) => &h.domain,
            Handshake::Data(h) => &h.domain,
        }
    }

    pub fn server_key(&self) -> Option<&str> {
        match self {
            Handshake::Control(h) => h.server_key.as_deref(),
            Handshake::Data(h) => h.server_key.as_deref(),
        }
    }
}

impl ControlHandshake {
    pub fn new(
        server_key: Option<String>,
        domain: &str,
        upstream: Url,
    ) -> Result<Self, HandshakeError> {
        Ok(Self {
            server_key,
            domain: normalize_domain(domain)?,
            upstream,
        })
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, HandshakeError> {
        let server_key = server_key(headers)?;
        let domain = normalize_domain(required(headers, CLIENT_DOMAIN_HEADER)?)?;
        let upstream = Url::parse(required(headers, CLIENT_UPSTREAM_HEADER)?)?;

        Ok(Self {
            server_key,
            domain,
            upstream,
        })
    }

    /// Write this handshake onto an outgoing upgrade request
    pub fn write_headers(&self, headers: &mut HeaderMap) -> Result<(), HandshakeError> {
        if let Some(key) = &self.server_key {
            insert(headers, SERVER_KEY_HEADER, key)?;
        }
        insert(headers, CLIENT_DOMAIN_HEADER, &self.domain)?;
        insert(headers, CLIENT_UPSTREAM_HEADER, self.upstream.as_str())
    }
}

impl DataHandshake {
    pub fn new(
        server_key: Option<String>,
        domain: &str,
        channel_id: ChannelId,
    ) -> Result<Self, HandshakeError> {
        Ok(Self {
            server_key,
            domain: normalize_domain(domain)?,
            channel_id,
            session_id: None,
        })
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        self.session_id = if session_id.is_empty() {
            None
        } else {
            Some(session_id)
        };
        self
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, HandshakeError> {
        let server_key = server_key(headers)?;
        let domain = normalize_domain(required(headers, CLIENT_DOMAIN_HEADER)?)?;
        let raw_id = required(headers, CHANNEL_ID_HEADER)?;
        let channel_id = raw_id
            .parse::<ChannelId>()
            .map_err(|_| HandshakeError::InvalidChannelId(raw_id.to_string()))?;

        Ok(Self {
            server_key,
            domain,
            channel_id,
            session_id: session_id(headers)?,
        })
    }

    pub fn write_headers(&self, headers: &mut HeaderMap) -> Result<(), HandshakeError> {
        if let Some(key) = &self.server_key {
            insert(headers, SERVER_KEY_HEADER, key)?;
        }
        insert(headers, CLIENT_DOMAIN_HEADER, &self.domain)?;
        insert(headers, CHANNEL_ID_HEADER, &self.channel_id.to_string())?;
        if let Some(session_id) = &self.session_id {
            insert(headers, SESSION_ID_HEADER, session_id)?;
        }
        Ok(())
    }
}

/// Normalize a domain for use as a registry key
///
/// Host names are case-insensitive, so domains are lowercased. A single
/// trailing dot (fully-qualified form) is dropped.
pub fn normalize_domain(raw: &str) -> Result<String, HandshakeError> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);

    let valid = !trimmed.is_empty()
        && trimmed.len() <= 253
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));

    if !valid {
        return Err(HandshakeError::InvalidDomain(raw.to_string()));
    }

    Ok(trimmed.to_ascii_lowercase())
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, HandshakeError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.trim()))
            .map_err(|e| HandshakeError::InvalidHeader {
                header: name,
                reason: e.to_string(),
            }),
    }
}

fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, HandshakeError> {
    header_str(headers, name)?.ok_or(HandshakeError::MissingHeader(name))
}

fn server_key(headers: &HeaderMap) -> Result<Option<String>, HandshakeError> {
    Ok(header_str(headers, SERVER_KEY_HEADER)?
        .filter(|key| !key.is_empty())
        .map(str::to_string))
}

/// Session ID from a data handshake or a control upgrade response
pub fn session_id(headers: &HeaderMap) -> Result<Option<String>, HandshakeError> {
    Ok(header_str(headers, SESSION_ID_HEADER)?
        .filter(|id| !id.is_empty())
        .map(str::to_string))
}

/// Attach the session ID to a control upgrade response
pub fn write_session_id(headers: &mut HeaderMap, session_id: &str) -> Result<(), HandshakeError> {
    insert(headers, SESSION_ID_HEADER, session_id)
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), HandshakeError> {
    let value = HeaderValue::from_str(value).map_err(|e| HandshakeError::InvalidHeader {
        header: name,
        reason: e.to_string(),
    })?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_parse_control_handshake() {
        let map = headers(&[
            (SERVER_KEY_HEADER, "secret"),
            (CLIENT_DOMAIN_HEADER, "App.Example.COM"),
            (CLIENT_UPSTREAM_HEADER, "http://127.0.0.1:3000"),
        ]);

        match Handshake::from_headers(&map).unwrap() {
            Handshake::Control(h) => {
                assert_eq!(h.server_key.as_deref(), Some("secret"));
                assert_eq!(h.domain, "app.example.com");
                assert_eq!(h.upstream.as_str(), "http://127.0.0.1:3000/");
            }
            other => panic!("expected control handshake, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_data_handshake() {
        let map = headers(&[
            (CLIENT_DOMAIN_HEADER, "a.example"),
            (CHANNEL_ID_HEADER, "4294967295"),
        ]);

        match Handshake::from_headers(&map).unwrap() {
            Handshake::Data(h) => {
                assert_eq!(h.server_key, None);
                assert_eq!(h.domain, "a.example");
                assert_eq!(h.channel_id, u32::MAX);
            }
            other => panic!("expected data handshake, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_server_key_is_absent() {
        let map = headers(&[
            (SERVER_KEY_HEADER, ""),
            (CLIENT_DOMAIN_HEADER, "a.example"),
            (CLIENT_UPSTREAM_HEADER, "http://localhost:8080"),
        ]);
        let handshake = ControlHandshake::from_headers(&map).unwrap();
        assert_eq!(handshake.server_key, None);
    }

    #[test]
    fn test_missing_domain() {
        let map = headers(&[(CLIENT_UPSTREAM_HEADER, "http://localhost:8080")]);
        let err = Handshake::from_headers(&map).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::MissingHeader(CLIENT_DOMAIN_HEADER)
        ));
    }

    #[test]
    fn test_relative_upstream_rejected() {
        let map = headers(&[
            (CLIENT_DOMAIN_HEADER, "a.example"),
            (CLIENT_UPSTREAM_HEADER, "/just/a/path"),
        ]);
        assert!(matches!(
            Handshake::from_headers(&map),
            Err(HandshakeError::InvalidUpstream(_))
        ));
    }

    #[test]
    fn test_invalid_channel_id() {
        for raw in ["-1", "4294967296", "abc"] {
            let map = headers(&[(CLIENT_DOMAIN_HEADER, "a.example"), (CHANNEL_ID_HEADER, raw)]);
            assert!(
                matches!(
                    Handshake::from_headers(&map),
                    Err(HandshakeError::InvalidChannelId(_))
                ),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_written_headers_parse_back() {
        let handshake = ControlHandshake::new(
            Some("k".to_string()),
            "a.example",
            Url::parse("http://10.0.0.5:8080").unwrap(),
        )
        .unwrap();

        let mut map = HeaderMap::new();
        handshake.write_headers(&mut map).unwrap();
        assert_eq!(
            Handshake::from_headers(&map).unwrap(),
            Handshake::Control(handshake)
        );
    }

    #[test]
    fn test_data_session_id_round_trip() {
        let handshake = DataHandshake::new(None, "a.example", 9)
            .unwrap()
            .with_session_id("ctl-1234");

        let mut map = HeaderMap::new();
        handshake.write_headers(&mut map).unwrap();
        assert_eq!(map.get(SESSION_ID_HEADER).unwrap(), "ctl-1234");

        let parsed = DataHandshake::from_headers(&map).unwrap();
        assert_eq!(parsed.session_id.as_deref(), Some("ctl-1234"));
    }

    #[test]
    fn test_data_session_id_is_optional() {
        let map = headers(&[(CLIENT_DOMAIN_HEADER, "a.example"), (CHANNEL_ID_HEADER, "3")]);
        assert_eq!(DataHandshake::from_headers(&map).unwrap().session_id, None);

        let handshake = DataHandshake::new(None, "a.example", 3)
            .unwrap()
            .with_session_id("");
        assert_eq!(handshake.session_id, None);
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("A.Example.").unwrap(), "a.example");
        assert_eq!(normalize_domain("  api-1.example  ").unwrap(), "api-1.example");
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("has space.example").is_err());
        assert!(normalize_domain("host:8080").is_err());
    }
}
