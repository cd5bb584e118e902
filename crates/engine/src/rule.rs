//! Forward rules: the declarative description of one local or remote forward, and the relay
//! endpoint identity derived from it.

use std::{fmt, net::IpAddr, path::PathBuf, str::FromStr};

use derive_more::derive::Display;
use serde::{Deserialize, Serialize, Serializer};
use url::Url;

use crate::{
    error::ConfigError,
    local_endpoint::{LocalBinding, LocalTarget},
};

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credentials {
    SharedAccessKey { name: String, key: String },
    SharedAccessSignature(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::SharedAccessKey { name, .. } => f.debug_struct("SharedAccessKey").field("name", name).field("key", &"***").finish(),
            Credentials::SharedAccessSignature(_) => f.write_str("SharedAccessSignature(***)"),
        }
    }
}

/// Where the relay lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct RelayConnection {
    pub endpoint: Url,
    pub credentials: Option<Credentials>,
}

impl RelayConnection {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint, credentials: None }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// The relay endpoint for `relay_name` on this connection: scheme and authority of the
    /// connection endpoint, path `/<relay_name>`.
    pub fn endpoint_for(&self, relay_name: &str) -> RelayEndpoint {
        let mut uri = self.endpoint.clone();
        uri.set_path(relay_name);
        uri.set_query(None);
        uri.set_fragment(None);
        RelayEndpoint {
            uri,
            credentials: self.credentials.clone(),
        }
    }
}

/// Accepts a bare endpoint URI (`sb://ns.example.net/`) or a connection string
/// (`Endpoint=sb://ns.example.net/;SharedAccessKeyName=...;SharedAccessKey=...`).
impl FromStr for RelayConnection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.contains('=') {
            let endpoint = Url::parse(s).map_err(|e| ConfigError::InvalidConnection(format!("{s}: {e}")))?;
            return Ok(Self::new(endpoint));
        }

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut signature = None;
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| ConfigError::InvalidConnection(format!("malformed segment {part}")))?;
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(Url::parse(value.trim()).map_err(|e| ConfigError::InvalidConnection(format!("endpoint {value}: {e}")))?),
                "sharedaccesskeyname" => key_name = Some(value.trim().to_string()),
                "sharedaccesskey" => key = Some(value.trim().to_string()),
                "sharedaccesssignature" => signature = Some(value.trim().to_string()),
                "entitypath" => {}
                other => log::debug!("[RelayConnection] ignore unknown connection string key {other}"),
            }
        }

        let endpoint = endpoint.ok_or_else(|| ConfigError::InvalidConnection("missing Endpoint".into()))?;
        let credentials = match (key_name, key, signature) {
            (_, _, Some(token)) => Some(Credentials::SharedAccessSignature(token)),
            (Some(name), Some(key), None) => Some(Credentials::SharedAccessKey { name, key }),
            (None, None, None) => None,
            _ => return Err(ConfigError::InvalidConnection("SharedAccessKeyName and SharedAccessKey must be set together".into())),
        };
        Ok(Self { endpoint, credentials })
    }
}

impl TryFrom<String> for RelayConnection {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A named endpoint on the relay plus the credentials used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayEndpoint {
    pub uri: Url,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[display("local")]
    Local,
    #[display("remote")]
    Remote,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Local => "local",
            Direction::Remote => "remote",
        }
    }
}

/// Registry key of a bridge: at most one bridge per key is active at any time.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{direction}+{uri}")]
pub struct EndpointKey {
    pub direction: Direction,
    pub uri: Url,
}

impl Serialize for EndpointKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalForward {
    pub relay_name: String,
    #[serde(default, rename = "ConnectionString")]
    pub connection: Option<RelayConnection>,
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub bind_port: Option<u16>,
    #[serde(default)]
    pub bind_local_socket: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
}

impl LocalForward {
    pub fn tcp(relay_name: impl Into<String>, bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            relay_name: relay_name.into(),
            bind_address: Some(bind_address.into()),
            bind_port: Some(bind_port),
            ..Default::default()
        }
    }

    pub fn socket(relay_name: impl Into<String>, bind_local_socket: impl Into<String>) -> Self {
        Self {
            relay_name: relay_name.into(),
            bind_local_socket: Some(bind_local_socket.into()),
            ..Default::default()
        }
    }

    pub fn with_connection(mut self, connection: RelayConnection) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// Name shown for sessions accepted by this forward.
    pub fn display_host(&self) -> &str {
        self.host_name.as_deref().or(self.bind_address.as_deref()).or(self.bind_local_socket.as_deref()).unwrap_or(&self.relay_name)
    }

    fn validate(&self, label: &str) -> Result<(), ConfigError> {
        match (&self.bind_address, &self.bind_local_socket) {
            (Some(_), Some(_)) => return Err(ConfigError::invalid(label, "BindAddress", "and BindLocalSocket are mutually exclusive")),
            (None, None) => return Err(ConfigError::invalid(label, "BindAddress", "or BindLocalSocket must be set")),
            (Some(address), None) => {
                if address.trim().is_empty() {
                    return Err(ConfigError::invalid(label, "BindAddress", "must not be empty"));
                }
                if self.bind_port.is_none() {
                    return Err(ConfigError::invalid(label, "BindPort", "is required with BindAddress"));
                }
            }
            (None, Some(socket)) => {
                if socket.trim().is_empty() {
                    return Err(ConfigError::invalid(label, "BindLocalSocket", "must not be empty"));
                }
                if self.bind_port.is_some() {
                    return Err(ConfigError::invalid(label, "BindPort", "cannot be combined with BindLocalSocket"));
                }
            }
        }
        Ok(())
    }

    /// The bind selector before address resolution. A host name in `bind_address` is returned
    /// as `Err(host)` so the caller can run it through the resolver.
    pub(crate) fn binding(&self) -> Result<LocalBinding, (String, u16)> {
        match (&self.bind_address, self.bind_port, &self.bind_local_socket) {
            (Some(address), Some(port), _) => {
                let address = address.trim().trim_start_matches('[').trim_end_matches(']');
                match address.parse::<IpAddr>() {
                    Ok(ip) => Ok(LocalBinding::Tcp((ip, port).into())),
                    Err(_) => Err((address.to_string(), port)),
                }
            }
            (_, _, Some(socket)) => Ok(LocalBinding::Socket(PathBuf::from(socket))),
            _ => Err((String::new(), 0)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteForward {
    pub relay_name: String,
    #[serde(default, rename = "ConnectionString")]
    pub connection: Option<RelayConnection>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub local_socket: Option<String>,
}

impl RemoteForward {
    pub fn tcp(relay_name: impl Into<String>, host: impl Into<String>, host_port: u16) -> Self {
        Self {
            relay_name: relay_name.into(),
            host: Some(host.into()),
            host_port: Some(host_port),
            ..Default::default()
        }
    }

    pub fn socket(relay_name: impl Into<String>, local_socket: impl Into<String>) -> Self {
        Self {
            relay_name: relay_name.into(),
            local_socket: Some(local_socket.into()),
            ..Default::default()
        }
    }

    pub fn with_connection(mut self, connection: RelayConnection) -> Self {
        self.connection = Some(connection);
        self
    }

    fn validate(&self, label: &str) -> Result<(), ConfigError> {
        match (&self.host, &self.local_socket) {
            (Some(_), Some(_)) => Err(ConfigError::invalid(label, "Host", "and LocalSocket are mutually exclusive")),
            (None, None) => Err(ConfigError::invalid(label, "Host", "is required unless LocalSocket is set")),
            (Some(host), None) => {
                if host.trim().is_empty() {
                    return Err(ConfigError::invalid(label, "Host", "must not be empty"));
                }
                match self.host_port {
                    None => Err(ConfigError::invalid(label, "HostPort", "is required with Host")),
                    Some(0) => Err(ConfigError::invalid(label, "HostPort", "must not be 0")),
                    Some(_) => Ok(()),
                }
            }
            (None, Some(socket)) => {
                if socket.trim().is_empty() {
                    return Err(ConfigError::invalid(label, "LocalSocket", "must not be empty"));
                }
                if self.host_port.is_some() {
                    return Err(ConfigError::invalid(label, "HostPort", "cannot be combined with LocalSocket"));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn target(&self) -> Option<LocalTarget> {
        match (&self.host, self.host_port, &self.local_socket) {
            (Some(host), Some(port), None) => Some(LocalTarget::Tcp {
                host: host.trim().trim_start_matches('[').trim_end_matches(']').to_string(),
                port,
            }),
            (None, None, Some(socket)) => Some(LocalTarget::Socket(PathBuf::from(socket))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum ForwardRule {
    LocalForward(LocalForward),
    RemoteForward(RemoteForward),
}

impl From<LocalForward> for ForwardRule {
    fn from(rule: LocalForward) -> Self {
        ForwardRule::LocalForward(rule)
    }
}

impl From<RemoteForward> for ForwardRule {
    fn from(rule: RemoteForward) -> Self {
        ForwardRule::RemoteForward(rule)
    }
}

impl ForwardRule {
    pub fn direction(&self) -> Direction {
        match self {
            ForwardRule::LocalForward(_) => Direction::Local,
            ForwardRule::RemoteForward(_) => Direction::Remote,
        }
    }

    pub fn relay_name(&self) -> &str {
        match self {
            ForwardRule::LocalForward(rule) => &rule.relay_name,
            ForwardRule::RemoteForward(rule) => &rule.relay_name,
        }
    }

    pub fn connection(&self) -> Option<&RelayConnection> {
        match self {
            ForwardRule::LocalForward(rule) => rule.connection.as_ref(),
            ForwardRule::RemoteForward(rule) => rule.connection.as_ref(),
        }
    }

    /// Checks selector exclusivity and required fields. No I/O.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let label = self.to_string();
        let relay_name = self.relay_name().trim();
        if relay_name.is_empty() {
            return Err(ConfigError::invalid(&label, "RelayName", "is required"));
        }
        if relay_name.contains(['?', '#']) {
            return Err(ConfigError::invalid(&label, "RelayName", "must not contain '?' or '#'"));
        }
        match self {
            ForwardRule::LocalForward(rule) => rule.validate(&label),
            ForwardRule::RemoteForward(rule) => rule.validate(&label),
        }
    }

    /// Validates the rule and resolves its relay endpoint, using `default` when the rule carries
    /// no connection of its own.
    pub fn endpoint(&self, default: Option<&RelayConnection>) -> Result<RelayEndpoint, ConfigError> {
        self.validate()?;
        let connection = self
            .connection()
            .or(default)
            .ok_or_else(|| ConfigError::invalid(self, "ConnectionString", "is required when no default connection is configured"))?;
        Ok(connection.endpoint_for(self.relay_name().trim()))
    }

    pub fn key(&self, default: Option<&RelayConnection>) -> Result<EndpointKey, ConfigError> {
        Ok(EndpointKey {
            direction: self.direction(),
            uri: self.endpoint(default)?.uri,
        })
    }
}

/// Rules render in the `-L`/`-R` command line form, used as their label in logs and reports.
impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardRule::LocalForward(rule) => {
                f.write_str("-L ")?;
                match (&rule.bind_address, rule.bind_port, &rule.bind_local_socket) {
                    (Some(address), Some(port), _) if address.contains(':') && !address.starts_with('[') => write!(f, "[{address}]:{port}:")?,
                    (Some(address), Some(port), _) => write!(f, "{address}:{port}:")?,
                    (Some(address), None, _) => write!(f, "{address}:")?,
                    (None, _, Some(socket)) => write!(f, "{socket}:")?,
                    _ => {}
                }
                f.write_str(&rule.relay_name)
            }
            ForwardRule::RemoteForward(rule) => {
                write!(f, "-R {}", rule.relay_name)?;
                match (&rule.host, rule.host_port, &rule.local_socket) {
                    (Some(host), Some(port), _) => write!(f, ":{host}:{port}"),
                    (Some(host), None, _) => write!(f, ":{host}"),
                    (None, _, Some(socket)) => write!(f, ":{socket}"),
                    _ => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn default_connection() -> RelayConnection {
        "sb://ns.example.net/".parse().expect("should parse")
    }

    fn invalid_field(result: Result<(), ConfigError>) -> &'static str {
        match result {
            Err(ConfigError::InvalidRule { field, .. }) => field,
            other => panic!("expected InvalidRule, got {other:?}"),
        }
    }

    #[test]
    fn local_selectors_are_exclusive() {
        let mut rule = LocalForward::tcp("relay", "127.0.0.1", 8080);
        rule.bind_local_socket = Some("/tmp/relay.sock".into());
        assert_eq!(invalid_field(ForwardRule::from(rule).validate()), "BindAddress");

        let rule = LocalForward {
            relay_name: "relay".into(),
            ..Default::default()
        };
        assert_eq!(invalid_field(ForwardRule::from(rule).validate()), "BindAddress");
    }

    #[test]
    fn local_bind_port_required_with_address() {
        let mut rule = LocalForward::tcp("relay", "127.0.0.1", 8080);
        rule.bind_port = None;
        assert_eq!(invalid_field(ForwardRule::from(rule).validate()), "BindPort");

        let mut rule = LocalForward::socket("relay", "/tmp/relay.sock");
        rule.bind_port = Some(80);
        assert_eq!(invalid_field(ForwardRule::from(rule).validate()), "BindPort");
    }

    #[test]
    fn remote_selectors_are_exclusive() {
        let mut rule = RemoteForward::tcp("relay", "localhost", 80);
        rule.local_socket = Some("/tmp/relay.sock".into());
        assert_eq!(invalid_field(ForwardRule::from(rule).validate()), "Host");

        let rule = RemoteForward {
            relay_name: "relay".into(),
            ..Default::default()
        };
        assert_eq!(invalid_field(ForwardRule::from(rule).validate()), "Host");

        let mut rule = RemoteForward::tcp("relay", "localhost", 80);
        rule.host_port = None;
        assert_eq!(invalid_field(ForwardRule::from(rule).validate()), "HostPort");
    }

    #[test]
    fn relay_name_required() {
        let rule = ForwardRule::from(LocalForward::tcp(" ", "127.0.0.1", 80));
        assert_eq!(invalid_field(rule.validate()), "RelayName");
    }

    #[test]
    fn valid_rules_pass() {
        assert!(ForwardRule::from(LocalForward::tcp("relay", "127.0.0.1", 0)).validate().is_ok());
        assert!(ForwardRule::from(LocalForward::socket("relay", "/tmp/relay.sock")).validate().is_ok());
        assert!(ForwardRule::from(RemoteForward::tcp("relay", "localhost", 22)).validate().is_ok());
        assert!(ForwardRule::from(RemoteForward::socket("relay", "/tmp/relay.sock")).validate().is_ok());
    }

    #[test]
    fn endpoint_uses_override_before_default() {
        let rule = ForwardRule::from(LocalForward::tcp("db", "127.0.0.1", 5432));
        let endpoint = rule.endpoint(Some(&default_connection())).expect("should resolve");
        assert_eq!(endpoint.uri.as_str(), "sb://ns.example.net/db");

        let other: RelayConnection = "Endpoint=sb://other.example.net/;SharedAccessKeyName=listen;SharedAccessKey=secret".parse().expect("should parse");
        let rule = ForwardRule::from(LocalForward::tcp("db", "127.0.0.1", 5432).with_connection(other));
        let endpoint = rule.endpoint(Some(&default_connection())).expect("should resolve");
        assert_eq!(endpoint.uri.as_str(), "sb://other.example.net/db");
        assert_eq!(
            endpoint.credentials,
            Some(Credentials::SharedAccessKey {
                name: "listen".into(),
                key: "secret".into()
            })
        );
    }

    #[test]
    fn endpoint_requires_some_connection() {
        let rule = ForwardRule::from(RemoteForward::tcp("db", "localhost", 5432));
        assert!(matches!(rule.endpoint(None), Err(ConfigError::InvalidRule { field: "ConnectionString", .. })));
    }

    #[test]
    fn key_separates_directions() {
        let local = ForwardRule::from(LocalForward::tcp("db", "127.0.0.1", 5432)).key(Some(&default_connection())).expect("key");
        let remote = ForwardRule::from(RemoteForward::tcp("db", "localhost", 5432)).key(Some(&default_connection())).expect("key");
        assert_ne!(local, remote);
        assert_eq!(local.uri, remote.uri);
        assert_eq!(local.to_string(), "local+sb://ns.example.net/db");
    }

    #[test]
    fn connection_string_parsing() {
        let conn: RelayConnection = "Endpoint=sb://ns.example.net/;SharedAccessSignature=SharedAccessSignature sr=x&sig=y;EntityPath=db".parse().expect("should parse");
        assert_eq!(conn.endpoint.as_str(), "sb://ns.example.net/");
        assert!(matches!(conn.credentials, Some(Credentials::SharedAccessSignature(_))));

        assert!("SharedAccessKeyName=a;SharedAccessKey=b".parse::<RelayConnection>().is_err());
        assert!("Endpoint=sb://ns.example.net/;SharedAccessKeyName=a".parse::<RelayConnection>().is_err());
        assert!("not a url".parse::<RelayConnection>().is_err());
    }

    #[test]
    fn credentials_are_redacted() {
        let creds = Credentials::SharedAccessKey {
            name: "root".into(),
            key: "topsecret".into(),
        };
        assert!(!format!("{creds:?}").contains("topsecret"));
    }

    #[test]
    fn rule_labels() {
        assert_eq!(ForwardRule::from(LocalForward::tcp("db", "127.0.0.1", 5432)).to_string(), "-L 127.0.0.1:5432:db");
        assert_eq!(ForwardRule::from(LocalForward::tcp("db", "::1", 5432)).to_string(), "-L [::1]:5432:db");
        assert_eq!(ForwardRule::from(RemoteForward::tcp("db", "localhost", 5432)).to_string(), "-R db:localhost:5432");
        assert_eq!(ForwardRule::from(RemoteForward::socket("db", "/tmp/db.sock")).to_string(), "-R db:/tmp/db.sock");
    }

    #[test]
    fn local_binding_literal_and_hostname() {
        let rule = LocalForward::tcp("db", "127.0.0.1", 5432);
        assert!(matches!(rule.binding(), Ok(LocalBinding::Tcp(addr)) if addr.to_string() == "127.0.0.1:5432"));

        let rule = LocalForward::tcp("db", "[::1]", 5432);
        assert!(matches!(rule.binding(), Ok(LocalBinding::Tcp(addr)) if addr.to_string() == "[::1]:5432"));

        let rule = LocalForward::tcp("db", "localhost", 5432);
        assert_eq!(rule.binding().err(), Some(("localhost".to_string(), 5432)));
    }

    #[test]
    fn rules_decode_from_config_documents() {
        let document = r#"[
            {"LocalForward": {"RelayName": "db", "BindAddress": "127.0.0.1", "BindPort": 5432, "HostName": "db.internal"}},
            {"RemoteForward": {
                "RelayName": "web",
                "ConnectionString": "Endpoint=sb://other.example.net/;SharedAccessKeyName=listen;SharedAccessKey=secret",
                "Host": "localhost",
                "HostPort": 8080
            }},
            {"RemoteForward": {"RelayName": "app", "LocalSocket": "/var/run/app.sock"}}
        ]"#;
        let rules: Vec<ForwardRule> = serde_json::from_str(document).expect("should decode");

        assert_eq!(rules[0], LocalForward::tcp("db", "127.0.0.1", 5432).with_host_name("db.internal").into());
        let connection: RelayConnection = "Endpoint=sb://other.example.net/;SharedAccessKeyName=listen;SharedAccessKey=secret".parse().expect("should parse");
        assert_eq!(rules[1], RemoteForward::tcp("web", "localhost", 8080).with_connection(connection).into());
        assert_eq!(rules[2], RemoteForward::socket("app", "/var/run/app.sock").into());
        assert_eq!(rules[1].key(Some(&default_connection())).expect("key").uri.as_str(), "sb://other.example.net/web");
    }

    #[test]
    fn bad_connection_string_fails_decoding() {
        let document = r#"{"LocalForward": {"RelayName": "db", "ConnectionString": "SharedAccessKey=only", "BindLocalSocket": "/tmp/db.sock"}}"#;
        assert!(serde_json::from_str::<ForwardRule>(document).is_err());
    }
}
