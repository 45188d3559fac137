//! Address ban list consulted on every accept.
//!
//! Patterns are regular expressions matched against the whole dotted (or
//! colon-separated, for IPv6) textual form of the remote IP. Banned sockets are
//! dropped before any handshake byte is read.

use parking_lot::RwLock;
use regex::Regex;
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

#[derive(Debug, Default)]
pub struct BanList {
    patterns: RwLock<Vec<(String, Regex)>>,
}

fn compile(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

impl BanList {
    /// Build from configured patterns; invalid ones are logged and skipped
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match compile(pattern) {
                Ok(regex) => compiled.push((pattern.to_owned(), regex)),
                Err(e) => warn!(pattern, error = %e, "Skipping invalid ban pattern"),
            }
        }
        Self {
            patterns: RwLock::new(compiled),
        }
    }

    /// Add a pattern. Adding one that is already present is a no-op.
    pub fn add(&self, pattern: &str) -> Result<()> {
        let regex = compile(pattern)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid ban pattern '{pattern}': {e}")))?;
        let mut patterns = self.patterns.write();
        if !patterns.iter().any(|(p, _)| p == pattern) {
            patterns.push((pattern.to_owned(), regex));
        }
        Ok(())
    }

    pub fn remove(&self, pattern: &str) -> bool {
        let mut patterns = self.patterns.write();
        let before = patterns.len();
        patterns.retain(|(p, _)| p != pattern);
        patterns.len() != before
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let text = ip.to_string();
        let patterns = self.patterns.read();
        match patterns.iter().find(|(_, regex)| regex.is_match(&text)) {
            Some((pattern, _)) => {
                debug!(ip = %text, pattern = %pattern, "Address matched ban pattern");
                true
            }
            None => false,
        }
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns.read().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_patterns_match_whole_address() {
        let bans = BanList::new(["10\\.0\\.0\\.1"]);
        assert!(bans.is_banned(&ip("10.0.0.1")));
        assert!(!bans.is_banned(&ip("10.0.0.12")));
        assert!(!bans.is_banned(&ip("110.0.0.1")));
    }

    #[test]
    fn test_wildcard_ranges() {
        let bans = BanList::new(["192\\.168\\..*"]);
        assert!(bans.is_banned(&ip("192.168.4.20")));
        assert!(!bans.is_banned(&ip("192.169.0.1")));
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let bans = BanList::new(["(unclosed", "127\\.0\\.0\\.1"]);
        assert_eq!(bans.len(), 1);
        assert!(bans.is_banned(&ip("127.0.0.1")));
        assert!(bans.add("[").is_err());
    }

    #[test]
    fn test_add_and_remove_at_runtime() {
        let bans = BanList::default();
        assert!(bans.is_empty());
        bans.add("::1").unwrap();
        bans.add("::1").unwrap();
        assert_eq!(bans.patterns(), vec!["::1".to_string()]);
        assert!(bans.is_banned(&ip("::1")));
        assert!(bans.remove("::1"));
        assert!(!bans.remove("::1"));
        assert!(!bans.is_banned(&ip("::1")));
    }
}
