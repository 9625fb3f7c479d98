//! Remote Proxy Registry (C1): an immutable, indexed set of remote proxy credentials.

use crate::{PoolError, Result};
use std::path::Path;

/// The protocol a remote proxy speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Socks5,
    Http,
}

impl std::str::FromStr for RemoteKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "socks5" => Ok(RemoteKind::Socks5),
            "http" => Ok(RemoteKind::Http),
            other => Err(PoolError::config_fatal(format!(
                "unknown remote proxy kind: {}",
                other
            ))),
        }
    }
}

/// A single remote proxy credential. Identity is the registry index; the struct itself
/// is never mutated after load.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    pub id: usize,
    pub kind: RemoteKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl RemoteProxy {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Immutable, process-lifetime set of remote proxies loaded once at startup.
#[derive(Debug)]
pub struct RemoteRegistry {
    remotes: Vec<RemoteProxy>,
}

impl RemoteRegistry {
    /// Parse the whitespace-delimited remote proxy file: `host port user pass [kind]`,
    /// one record per line. Blank lines and lines starting with `#` are ignored.
    /// A malformed record fails the entire load (a silently-shrunk registry would
    /// misreport `total_remotes` to operators).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::config_fatal(format!("failed to read proxy file {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let mut remotes = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(PoolError::config_fatal(format!(
                    "proxy file line {}: expected at least 4 fields, got {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            let host = fields[0].to_string();
            let port: u16 = fields[1].parse().map_err(|_| {
                PoolError::config_fatal(format!("proxy file line {}: invalid port {}", lineno + 1, fields[1]))
            })?;
            let user = non_empty(fields[2]);
            let pass = non_empty(fields[3]);
            let kind = if fields.len() >= 5 {
                fields[4].parse()?
            } else {
                RemoteKind::Socks5
            };

            remotes.push(RemoteProxy {
                id: remotes.len(),
                kind,
                host,
                port,
                user,
                pass,
            });
        }

        if remotes.is_empty() {
            return Err(PoolError::config_fatal("proxy registry is empty"));
        }

        Ok(RemoteRegistry { remotes })
    }

    pub fn count(&self) -> usize {
        self.remotes.len()
    }

    pub fn get(&self, index: usize) -> Option<&RemoteProxy> {
        self.remotes.get(index)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s == "-" || s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
