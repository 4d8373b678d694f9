//! IP range tables for split routing
//!
//! The on-disk format is one range per line, `start end` separated by
//! whitespace, with `#` comments and blank lines ignored:
//!
//! ```text
//! # CN IPv4
//! 1.0.1.0 1.0.3.255
//! 1.0.8.0 1.0.15.255
//! ```
//!
//! Tables are sorted by range start at load time and queried with a
//! binary search. IPv4 entries are stored as `u32` pairs (8 bytes per
//! range), IPv6 as 16-byte big-endian pairs. Overlapping ranges are
//! tolerated; they only waste memory.
//!
//! When a list file is missing or empty the loader downloads it from the
//! published list and persists it next to the expected path. A failed
//! IPv6 download is not fatal; lookups simply fall through to "tunnel".

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use tracing::{info, warn};

use crate::error::RuleError;
use crate::fetch::HttpsFetcher;

/// File name of the IPv4 range list
pub const V4_FILE: &str = "chn_ip.txt";
/// File name of the IPv6 range list
pub const V6_FILE: &str = "chn_ip_v6.txt";

const V4_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/refs/heads/master/chn_ip.txt";
const V6_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/refs/heads/master/chn_ip_v6.txt";

/// Sorted IPv4 and IPv6 range tables
#[derive(Debug, Default)]
pub struct RangeTables {
    v4: Vec<(u32, u32)>,
    v6: Vec<([u8; 16], [u8; 16])>,
}

impl RangeTables {
    /// Empty tables; every lookup misses
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse both tables from text already in memory
    pub fn from_text(v4_text: &str, v6_text: &str) -> Self {
        let mut v4 = parse_v4(v4_text);
        let mut v6 = parse_v6(v6_text);
        v4.sort_unstable_by_key(|r| r.0);
        v6.sort_unstable_by_key(|r| r.0);
        Self { v4, v6 }
    }

    /// Load from `dir`, downloading missing or empty list files.
    ///
    /// The IPv4 list is required for meaningful routing, so its absence
    /// is reported; the IPv6 list is best-effort.
    pub async fn load_or_download(dir: &Path, fetcher: &HttpsFetcher) -> Result<Self, RuleError> {
        let v4_path = dir.join(V4_FILE);
        let v6_path = dir.join(V6_FILE);

        let v4_text = ensure_list(&v4_path, V4_URL, fetcher).await?;
        let v6_text = match ensure_list(&v6_path, V6_URL, fetcher).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "IPv6 range list unavailable, continuing without it");
                String::new()
            }
        };

        let tables = Self::from_text(&v4_text, &v6_text);
        if tables.v4.is_empty() {
            return Err(RuleError::EmptyList(v4_path.display().to_string()));
        }
        info!(
            v4_ranges = tables.v4.len(),
            v6_ranges = tables.v6.len(),
            "range tables loaded"
        );
        Ok(tables)
    }

    /// Number of loaded (v4, v6) ranges
    #[must_use]
    pub fn len(&self) -> (usize, usize) {
        (self.v4.len(), self.v6.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Binary-search membership test
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let x = u32::from(v4);
                let idx = self.v4.partition_point(|&(start, _)| start <= x);
                idx > 0 && self.v4[idx - 1].1 >= x
            }
            IpAddr::V6(v6) => {
                let x = v6.octets();
                let idx = self.v6.partition_point(|&(start, _)| start <= x);
                idx > 0 && self.v6[idx - 1].1 >= x
            }
        }
    }
}

async fn ensure_list(path: &Path, url: &str, fetcher: &HttpsFetcher) -> Result<String, RuleError> {
    let present = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    if present {
        return Ok(std::fs::read_to_string(path)?);
    }

    info!(path = %path.display(), url, "range list missing or empty, downloading");
    let body = fetcher
        .get_text(url)
        .await
        .map_err(|e| RuleError::ListUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    if let Err(e) = std::fs::write(path, &body) {
        // A read-only install dir is survivable; the table still loads
        warn!(path = %path.display(), error = %e, "failed to persist downloaded list");
    }
    Ok(body)
}

fn parse_v4(text: &str) -> Vec<(u32, u32)> {
    data_lines(text)
        .filter_map(|(start, end)| {
            let start: Ipv4Addr = start.parse().ok()?;
            let end: Ipv4Addr = end.parse().ok()?;
            let (start, end) = (u32::from(start), u32::from(end));
            (start <= end).then_some((start, end))
        })
        .collect()
}

fn parse_v6(text: &str) -> Vec<([u8; 16], [u8; 16])> {
    data_lines(text)
        .filter_map(|(start, end)| {
            let start: Ipv6Addr = start.parse().ok()?;
            let end: Ipv6Addr = end.parse().ok()?;
            let (start, end) = (start.octets(), end.octets());
            (start <= end).then_some((start, end))
        })
        .collect()
}

fn data_lines(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split_whitespace();
        Some((fields.next()?, fields.next()?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const V4: &str = "\
# comment
1.0.1.0 1.0.3.255

1.0.8.0 1.0.15.255
223.255.252.0 223.255.255.255
not-an-ip also-not
";

    const V6: &str = "\
2400:da00:: 2400:da00:ffff:ffff:ffff:ffff:ffff:ffff
240e:: 240e:ffff:ffff:ffff:ffff:ffff:ffff:ffff
";

    fn tables() -> RangeTables {
        RangeTables::from_text(V4, V6)
    }

    #[test]
    fn parses_and_sorts() {
        let t = tables();
        assert_eq!(t.len(), (3, 2));
    }

    #[test]
    fn v4_membership() {
        let t = tables();
        assert!(t.contains("1.0.1.1".parse().unwrap()));
        assert!(t.contains("1.0.1.0".parse().unwrap()));
        assert!(t.contains("1.0.3.255".parse().unwrap()));
        assert!(!t.contains("1.0.4.0".parse().unwrap()));
        assert!(!t.contains("1.0.0.255".parse().unwrap()));
        assert!(t.contains("223.255.253.1".parse().unwrap()));
        assert!(!t.contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn v6_membership() {
        let t = tables();
        assert!(t.contains("2400:da00::1".parse().unwrap()));
        assert!(t.contains("240e:1234::1".parse().unwrap()));
        assert!(!t.contains("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn unsorted_input_still_searchable() {
        let t = RangeTables::from_text("9.0.0.0 9.0.0.255\n1.0.0.0 1.0.0.255\n", "");
        assert!(t.contains("1.0.0.10".parse().unwrap()));
        assert!(t.contains("9.0.0.10".parse().unwrap()));
        assert!(!t.contains("5.0.0.1".parse().unwrap()));
    }

    #[test]
    fn inverted_range_dropped() {
        let t = RangeTables::from_text("2.0.0.0 1.0.0.0\n", "");
        assert!(t.is_empty());
    }

    #[test]
    fn empty_tables_miss_everything() {
        let t = RangeTables::empty();
        assert!(!t.contains("1.0.1.1".parse().unwrap()));
        assert!(!t.contains("2400:da00::1".parse().unwrap()));
    }
}
