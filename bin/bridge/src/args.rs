use std::time::Duration;

use clap::Parser;
use engine::{EngineConfig, ForwardRule, LocalForward, RelayConnection, RemoteForward, DEFAULT_BUFFER_SIZE};

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
const DEFAULT_TARGET_HOST: &str = "localhost";

/// Forward local ports to relay endpoints and relay endpoints to local ports.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Local forward `[bind_address:]port:relay_name` or `socket_path:relay_name`
    #[arg(short = 'L', long = "local-forward", value_parser = parse_local_forward)]
    pub local_forwards: Vec<LocalForward>,

    /// Remote forward `relay_name:[host:]port` or `relay_name:socket_path`
    #[arg(short = 'R', long = "remote-forward", value_parser = parse_remote_forward)]
    pub remote_forwards: Vec<RemoteForward>,

    /// Default relay connection, a URI or `Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...`
    #[arg(env = "RELAY_CONNECTION_STRING", long, default_value = "sb://localhost/", hide_env_values = true)]
    pub connection_string: RelayConnection,

    /// Seconds a session may drain and close after one direction ended
    #[arg(env, long, default_value_t = 30)]
    pub session_grace_secs: u64,

    /// Seconds to wait for the opposite side of an accepted connection
    #[arg(env, long, default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// Pump buffer size in bytes
    #[arg(env, long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
}

impl Args {
    pub fn rules(&self) -> Vec<ForwardRule> {
        let local = self.local_forwards.iter().cloned().map(ForwardRule::from);
        let remote = self.remote_forwards.iter().cloned().map(ForwardRule::from);
        local.chain(remote).collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer_size: self.buffer_size,
            session_grace: Duration::from_secs(self.session_grace_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..Default::default()
        }
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse().ok()
}

/// `[bind_address:]port:relay_name`, `[ipv6]:port:relay_name` or `socket_path:relay_name`
pub fn parse_local_forward(s: &str) -> Result<LocalForward, String> {
    let (head, relay_name) = s.rsplit_once(':').ok_or_else(|| format!("{s}: expected [bind_address:]port:relay_name"))?;
    let rule = if let Some(rest) = head.strip_prefix('[') {
        let (address, port) = rest.split_once("]:").ok_or_else(|| format!("{s}: unterminated IPv6 address"))?;
        let port = parse_port(port).ok_or_else(|| format!("{s}: invalid port {port}"))?;
        LocalForward::tcp(relay_name, address, port)
    } else if let Some(port) = parse_port(head) {
        LocalForward::tcp(relay_name, DEFAULT_BIND_ADDRESS, port)
    } else {
        match head.rsplit_once(':').and_then(|(address, port)| parse_port(port).map(|port| (address, port))) {
            Some((address, port)) => LocalForward::tcp(relay_name, address, port),
            None => LocalForward::socket(relay_name, head),
        }
    };
    ForwardRule::from(rule.clone()).validate().map_err(|e| e.to_string())?;
    Ok(rule)
}

/// `relay_name:[host:]port` or `relay_name:socket_path`
pub fn parse_remote_forward(s: &str) -> Result<RemoteForward, String> {
    let (relay_name, rest) = s.split_once(':').ok_or_else(|| format!("{s}: expected relay_name:[host:]port"))?;
    let rule = if let Some(port) = parse_port(rest) {
        RemoteForward::tcp(relay_name, DEFAULT_TARGET_HOST, port)
    } else if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, port) = bracketed.split_once("]:").ok_or_else(|| format!("{s}: unterminated IPv6 address"))?;
        let port = parse_port(port).ok_or_else(|| format!("{s}: invalid port {port}"))?;
        RemoteForward::tcp(relay_name, host, port)
    } else {
        match rest.rsplit_once(':').and_then(|(host, port)| parse_port(port).map(|port| (host, port))) {
            Some((host, port)) => RemoteForward::tcp(relay_name, host, port),
            None => RemoteForward::socket(relay_name, rest),
        }
    };
    ForwardRule::from(rule.clone()).validate().map_err(|e| e.to_string())?;
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_forward_forms() {
        assert_eq!(parse_local_forward("8080:web").expect("port only"), LocalForward::tcp("web", "127.0.0.1", 8080));
        assert_eq!(parse_local_forward("0.0.0.0:8080:web").expect("ipv4"), LocalForward::tcp("web", "0.0.0.0", 8080));
        assert_eq!(parse_local_forward("[::1]:5432:db").expect("ipv6"), LocalForward::tcp("db", "::1", 5432));
        assert_eq!(parse_local_forward("myhost:22:ssh").expect("host name"), LocalForward::tcp("ssh", "myhost", 22));
        assert_eq!(parse_local_forward("/tmp/app.sock:app").expect("socket"), LocalForward::socket("app", "/tmp/app.sock"));
    }

    #[test]
    fn local_forward_rejects_garbage() {
        assert!(parse_local_forward("web").is_err());
        assert!(parse_local_forward("8080:").is_err());
        assert!(parse_local_forward("[::1:80:db").is_err());
    }

    #[test]
    fn remote_forward_forms() {
        assert_eq!(parse_remote_forward("web:8080").expect("port only"), RemoteForward::tcp("web", "localhost", 8080));
        assert_eq!(parse_remote_forward("web:10.0.0.5:80").expect("host"), RemoteForward::tcp("web", "10.0.0.5", 80));
        assert_eq!(parse_remote_forward("db:[::1]:5432").expect("ipv6"), RemoteForward::tcp("db", "::1", 5432));
        assert_eq!(parse_remote_forward("app:/var/run/app.sock").expect("socket"), RemoteForward::socket("app", "/var/run/app.sock"));
    }

    #[test]
    fn remote_forward_rejects_garbage() {
        assert!(parse_remote_forward("web").is_err());
        assert!(parse_remote_forward(":8080").is_err());
        assert!(parse_remote_forward("web:host:0").is_err());
    }

    #[test]
    fn args_collect_rules_and_config() {
        let args = Args::parse_from(["relay-bridge", "-L", "8080:web", "-R", "db:5432", "--connection-string", "sb://ns.example.net/", "--session-grace-secs", "5"]);
        let rules = args.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].to_string(), "-L 127.0.0.1:8080:web");
        assert_eq!(rules[1].to_string(), "-R db:localhost:5432");
        assert_eq!(args.engine_config().session_grace, Duration::from_secs(5));
        assert_eq!(args.connection_string.endpoint.as_str(), "sb://ns.example.net/");
    }
}
