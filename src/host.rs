//! Deployment targets.
//!
//! One `Host` is one line of the host list, `host[:user[:port[:key]]]`. Each host gets its own
//! job, which runs in parallel with other hosts' jobs in its own tokio task.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use colored::*;
use colourado::Color;

use crate::error::FleetError;

/// Account used when a line doesn't name one.
pub const DEFAULT_USER: &str = "root";
/// Remote management port used when a line doesn't name one.
pub const DEFAULT_PORT: u16 = 22;

/// Written by `--create-example`.
pub const EXAMPLE_HOSTS: &str = "\
# Fleet host list
# Format: host:user:port:key_file
# Only `host` is required. user defaults to root, port to 22.
# Lines starting with # are comments.

# Examples:
# 192.168.1.100:root:22:/root/.ssh/id_rsa
# 192.168.1.101:admin:2222
# server.example.com:ubuntu:22:/home/user/.ssh/deploy_key

# Production
# 10.0.1.10:root:22
# 10.0.1.11:root:22

# Staging
# stage1.example.com:deploy:22:/keys/stage_key
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Address of the target. Identifies the host in results and reports.
    pub address: String,
    /// Remote account.
    pub user: String,
    /// Remote management port.
    pub port: u16,
    /// Credential reference handed to the action as-is.
    pub key: Option<PathBuf>,
}

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: DEFAULT_USER.to_string(),
            port: DEFAULT_PORT,
            key: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given palette color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }

    /// Formats the host back into a host list line.
    pub fn to_line(&self) -> String {
        match &self.key {
            Some(key) => format!(
                "{}:{}:{}:{}",
                self.address,
                self.user,
                self.port,
                key.display()
            ),
            None => format!("{}:{}:{}", self.address, self.user, self.port),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.address)
    }
}

/// Why a line of the host list was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineError {
    EmptyHost,
    BadPort(String),
    TooManyFields(usize),
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LineError::EmptyHost => write!(f, "empty host field"),
            LineError::BadPort(port) => write!(f, "invalid port '{}'", port),
            LineError::TooManyFields(n) => write!(f, "{} fields, expected at most 4", n),
        }
    }
}

/// Parses one non-comment, non-blank line.
fn parse_line(line: &str) -> Result<Host, LineError> {
    let fields: Vec<&str> = line.split(':').map(str::trim).collect();
    if fields.len() > 4 {
        return Err(LineError::TooManyFields(fields.len()));
    }

    let address = fields[0];
    if address.is_empty() {
        return Err(LineError::EmptyHost);
    }
    let mut host = Host::new(address);

    // Empty optional fields fall back to their defaults.
    if let Some(user) = fields.get(1).filter(|u| !u.is_empty()) {
        host.user = user.to_string();
    }
    if let Some(port) = fields.get(2).filter(|p| !p.is_empty()) {
        host.port = port
            .parse()
            .map_err(|_| LineError::BadPort(port.to_string()))?;
    }
    if let Some(key) = fields.get(3).filter(|k| !k.is_empty()) {
        host.key = Some(PathBuf::from(key));
    }
    Ok(host)
}

/// Parses a host list. Malformed lines and repeated hosts are skipped with a warning.
///
/// The result keeps the order of the source.
pub fn parse_hosts(source: &str) -> Vec<Host> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();

    for (lineno, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok(host) => {
                if seen.insert(host.address.clone()) {
                    hosts.push(host);
                } else {
                    tracing::warn!(
                        line = lineno + 1,
                        host = %host.address,
                        "Skipping duplicate host entry"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(line = lineno + 1, content = line, %error, "Skipping malformed host entry");
            }
        }
    }

    hosts
}

/// Reads and parses the host list at `path`.
pub fn load_hosts(path: impl AsRef<Path>) -> Result<Vec<Host>, FleetError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| FleetError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let hosts = parse_hosts(&source);
    if hosts.is_empty() {
        return Err(FleetError::NoValidTargets(path.display().to_string()));
    }
    tracing::debug!(count = hosts.len(), path = %path.display(), "Loaded hosts");
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_gets_defaults() {
        let hosts = parse_hosts("10.0.0.1");
        assert_eq!(hosts, vec![Host::new("10.0.0.1")]);
        assert_eq!(hosts[0].user, "root");
        assert_eq!(hosts[0].port, 22);
        assert!(hosts[0].key.is_none());
    }

    #[test]
    fn test_all_fields() {
        let hosts = parse_hosts("web1.example.com:deploy:2222:/keys/id_ed25519");
        assert_eq!(
            hosts,
            vec![Host::new("web1.example.com")
                .with_user("deploy")
                .with_port(2222)
                .with_key("/keys/id_ed25519")]
        );
    }

    #[test]
    fn test_comments_and_blank_lines_are_ignored() {
        let source = "# production\n\n   \nhost1\n  # indented comment\nhost2:admin\n";
        let hosts = parse_hosts(source);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].address, "host1");
        assert_eq!(hosts[1].user, "admin");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let source = "host1:root:22\n:22\nhost2::notaport\nhost3:a:22:k:extra\nhost4::\n";
        let hosts = parse_hosts(source);
        let addresses: Vec<_> = hosts.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addresses, vec!["host1", "host4"]);
        // Empty optional fields fall back to defaults.
        assert_eq!(hosts[1], Host::new("host4"));
    }

    #[test]
    fn test_duplicates_keep_first_occurrence() {
        let hosts = parse_hosts("a:alice\nb\na:bob\n");
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].user, "alice");
        assert_eq!(hosts[1].address, "b");
    }

    #[test]
    fn test_parsing_is_idempotent() {
        let source = "x\ny:u:23\n# c\nz:u:24:/k\n";
        assert_eq!(parse_hosts(source), parse_hosts(source));
    }

    #[test]
    fn test_to_line_round_trips() {
        let host = Host::new("h").with_user("u").with_port(2200).with_key("/k");
        assert_eq!(host.to_line(), "h:u:2200:/k");
        assert_eq!(parse_hosts(&host.to_line()), vec![host]);
    }

    #[test]
    fn test_display_brackets_address() {
        assert_eq!(Host::new("10.1.1.1").to_string(), "[10.1.1.1]");
    }

    #[test]
    fn test_example_file_has_no_active_hosts() {
        assert!(parse_hosts(EXAMPLE_HOSTS).is_empty());
    }

    #[test]
    fn test_load_missing_file_is_unreadable() {
        let err = load_hosts("/definitely/not/here/hosts.txt").unwrap_err();
        assert!(matches!(err, FleetError::SourceUnreadable { .. }));
    }
}
