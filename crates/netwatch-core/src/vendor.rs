//! Hardware-address prefix (OUI) to vendor name lookup

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::device::MacAddr;

#[derive(Error, Debug)]
pub enum VendorError {
    #[error("failed to read vendor table {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("vendor table {0} contains no usable entries")]
    Empty(String),
}

/// Read-only vendor lookup
pub trait VendorLookup: Send + Sync {
    fn lookup(&self, mac: &MacAddr) -> Option<String>;
}

/// In-memory OUI table keyed by the uppercase six-hex-digit prefix
#[derive(Debug, Clone, Default)]
pub struct OuiTable {
    entries: HashMap<String, String>,
}

impl OuiTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from disk. A missing file gives an empty table so that
    /// identification still works without a pre-downloaded database.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VendorError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Vendor table not found, vendor lookup disabled");
            return Ok(Self::new());
        }

        let text = std::fs::read_to_string(path).map_err(|source| VendorError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::parse(&text);
        if table.is_empty() {
            return Err(VendorError::Empty(path.display().to_string()));
        }

        info!(path = %path.display(), entries = table.len(), "Loaded vendor table");
        Ok(table)
    }

    /// Parse either the `prefix,vendor` CSV cache or the Wireshark `manuf`
    /// format. Lines that match neither are skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((prefix, vendor)) = parse_csv_line(line).or_else(|| parse_manuf_line(line)) {
                entries.entry(prefix).or_insert(vendor);
            }
        }
        Self { entries }
    }

    pub fn insert(&mut self, prefix: &str, vendor: impl Into<String>) {
        if let Some(prefix) = normalize_prefix(prefix) {
            self.entries.insert(prefix, vendor.into());
        }
    }

    /// Look up by prefix in any common notation (`AA:BB:CC`, `aabbcc`, a full address)
    pub fn lookup_prefix(&self, prefix: &str) -> Option<&str> {
        let prefix = normalize_prefix(prefix)?;
        self.entries.get(&prefix).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VendorLookup for OuiTable {
    fn lookup(&self, mac: &MacAddr) -> Option<String> {
        self.entries.get(&mac.oui()).cloned()
    }
}

fn normalize_prefix(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    (hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
}

// AABBCC,Vendor Name
fn parse_csv_line(line: &str) -> Option<(String, String)> {
    let (prefix, vendor) = line.split_once(',')?;
    let prefix = prefix.trim().trim_matches('"');
    if prefix.len() > 8 {
        return None;
    }
    let vendor = vendor.trim().trim_matches('"').trim();
    if vendor.is_empty() {
        return None;
    }
    Some((normalize_prefix(prefix)?, vendor.to_string()))
}

// 00:00:0C<TAB>Cisco<TAB>Cisco Systems, Inc
fn parse_manuf_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let prefix = parts.next()?;
    // longer /28 and /36 assignments are not OUI granular
    if prefix.contains('/') || prefix.len() != 8 {
        return None;
    }
    let rest: Vec<&str> = parts.collect();
    let vendor = rest.join(" ");
    let vendor = vendor.split('#').next().unwrap_or_default().trim();
    if vendor.is_empty() {
        return None;
    }
    // prefer the long name when the manuf file carries one
    let vendor = match line.split('\t').filter(|s| !s.trim().is_empty()).nth(2) {
        Some(long) => long.split('#').next().unwrap_or_default().trim().to_string(),
        None => vendor.to_string(),
    };
    Some((normalize_prefix(prefix)?, vendor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_csv_cache() {
        let table = OuiTable::parse("3C22FB,Apple, Inc.\nB827EB,Raspberry Pi Foundation\n");
        assert_eq!(table.len(), 2);
        let mac: MacAddr = "b8:27:eb:12:34:56".parse().unwrap();
        assert_eq!(table.lookup(&mac).as_deref(), Some("Raspberry Pi Foundation"));
        assert_eq!(table.lookup_prefix("3c-22-fb"), Some("Apple, Inc."));
    }

    #[test]
    fn test_parse_manuf_format() {
        let text = "# comment\n00:00:0C\tCisco\tCisco Systems, Inc\n\
                    00:1B:63\tApple\n00:1B:C5:00:00:00/36\tConverge\tConverging Systems\n";
        let table = OuiTable::parse(text);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup_prefix("00000C"), Some("Cisco Systems, Inc"));
        assert_eq!(table.lookup_prefix("00:1b:63"), Some("Apple"));
    }

    #[test]
    fn test_unknown_prefix() {
        let table = OuiTable::parse("AABBCC,Acme\n");
        let mac: MacAddr = "00:11:22:33:44:55".parse().unwrap();
        assert!(table.lookup(&mac).is_none());
        assert!(table.lookup_prefix("zz").is_none());
    }

    #[test]
    fn test_missing_file_is_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = OuiTable::from_file(dir.path().join("absent.csv")).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "AABBCC,Acme Corp").unwrap();
        let table = OuiTable::from_file(file.path()).unwrap();
        assert_eq!(table.lookup_prefix("aa:bb:cc:00:00:01"), Some("Acme Corp"));
    }

    #[test]
    fn test_file_without_entries_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a vendor table").unwrap();
        assert!(matches!(
            OuiTable::from_file(file.path()),
            Err(VendorError::Empty(_))
        ));
    }
}
