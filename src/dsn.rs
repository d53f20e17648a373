//! Connection strings assembled from discrete parts.
//!
//! Host frameworks hand over hostname, port, virtual host and credentials
//! separately; the queue itself only consumes the assembled URL.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use url::Url;

use crate::error::{Result, TrunkError};

pub const DEFAULT_SCHEME: &str = "postgres";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;

/// Characters escaped in the database name; includes `%` and `/` so the
/// name comes back verbatim from [`ConnectionDescriptor::parse`]
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// The parts of a PostgreSQL connection URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    /// Database name, without the leading `/`
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: Some(DEFAULT_PORT),
            path: String::new(),
            username: None,
            password: None,
        }
    }
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into().trim_start_matches('/').to_string();
        self
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Assemble the connection URL.
    ///
    /// Credentials are only emitted as `user:password@` when both are
    /// present, or `user@` for a bare user; a password without a user is
    /// dropped. An empty host falls back to `localhost`.
    pub fn build(&self) -> Result<String> {
        let host = if self.host.is_empty() {
            DEFAULT_HOST
        } else {
            self.host.as_str()
        };
        let base = format!("{}://{}", self.scheme, host);
        let mut url = Url::parse(&base)
            .map_err(|e| TrunkError::invalid_descriptor(base.clone(), e.to_string()))?;

        url.set_port(self.port)
            .map_err(|()| TrunkError::invalid_descriptor(base.clone(), "port not allowed"))?;

        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            url.set_username(username)
                .map_err(|()| TrunkError::invalid_descriptor(base.clone(), "username not allowed"))?;
            if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
                url.set_password(Some(password)).map_err(|()| {
                    TrunkError::invalid_descriptor(base.clone(), "password not allowed")
                })?;
            }
        }

        if !self.path.is_empty() {
            url.set_path(&format!("/{}", utf8_percent_encode(&self.path, PATH_SEGMENT)));
        }

        Ok(url.to_string())
    }

    /// Split a connection URL back into its parts
    pub fn parse(input: &str) -> Result<Self> {
        let url =
            Url::parse(input).map_err(|e| TrunkError::invalid_descriptor(input, e.to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TrunkError::invalid_descriptor(input, "missing host"))?
            .to_string();

        let username = Some(decode(url.username(), input)?)
            .filter(|u| !u.is_empty())
            .map(Cow::into_owned);
        let password = url
            .password()
            .map(|p| decode(p, input).map(Cow::into_owned))
            .transpose()?;

        let path = decode(url.path().trim_start_matches('/'), input)?.into_owned();

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
            path,
            username,
            password,
        })
    }

    /// Driver options for this descriptor
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let url = self.build()?;
        PgConnectOptions::from_str(&url).map_err(TrunkError::Database)
    }
}

impl fmt::Display for ConnectionDescriptor {
    /// Renders the URL with the password masked, safe for logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masked = Self {
            password: self.password.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        };
        match masked.build() {
            Ok(url) => f.write_str(&url),
            Err(_) => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = TrunkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn decode<'a>(raw: &'a str, input: &str) -> Result<Cow<'a, str>> {
    percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| TrunkError::invalid_descriptor(input, e.to_string()))
}
