//! Vendor lookup from MAC address OUI prefixes.
//!
//! The table is loaded once and only ever replaced as a whole. A table that
//! cannot be read leaves the resolver answering `None` for every address.

use crate::domain::address::MacAddress;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

/// Shortest prefix accepted (MA-L, 24 bits).
const MIN_PREFIX_NIBBLES: usize = 6;

#[derive(Debug, Error)]
pub enum VendorTableError {
    #[error("cannot read vendor table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vendor table {0} contains no usable entries")]
    Empty(PathBuf),
}

/// Immutable prefix table, bucketed by prefix length in nibbles.
#[derive(Debug, Default)]
struct OuiTable {
    by_length: BTreeMap<usize, HashMap<u64, String>>,
}

impl OuiTable {
    fn insert(&mut self, nibbles: &[u8], vendor: String) {
        let key = fold_nibbles(nibbles);
        self.by_length
            .entry(nibbles.len())
            .or_default()
            .insert(key, vendor);
    }

    fn len(&self) -> usize {
        self.by_length.values().map(HashMap::len).sum()
    }

    fn lookup(&self, address: &MacAddress) -> Option<&str> {
        let nibbles = address.nibbles();
        self.by_length.iter().rev().find_map(|(len, bucket)| {
            bucket
                .get(&fold_nibbles(&nibbles[..*len]))
                .map(String::as_str)
        })
    }

    fn parse(contents: &str) -> Self {
        let mut table = Self::default();
        for line in contents.lines() {
            if let Some((nibbles, vendor)) = parse_line(line) {
                table.insert(&nibbles, vendor);
            }
        }
        table
    }
}

fn fold_nibbles(nibbles: &[u8]) -> u64 {
    nibbles.iter().fold(0u64, |acc, n| (acc << 4) | u64::from(*n))
}

/// Parse one table line into (prefix nibbles, vendor name).
///
/// Accepts IEEE `oui.txt` lines (`00-1A-7D   (hex)   Vendor`) and simple
/// `PREFIX[/bits] Vendor` lines separated by whitespace, a comma or tabs.
fn parse_line(line: &str) -> Option<(Vec<u8>, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (raw_prefix, raw_name) = if let Some(idx) = line.find("(hex)") {
        (&line[..idx], &line[idx + "(hex)".len()..])
    } else if let Some(idx) = line.find("(base 16)") {
        (&line[..idx], &line[idx + "(base 16)".len()..])
    } else {
        let idx = line.find(|c: char| c.is_whitespace() || c == ',')?;
        let sep = line[idx..].chars().next()?;
        (&line[..idx], &line[idx + sep.len_utf8()..])
    };

    // Wireshark-style lines carry a short and a long name; keep the long one.
    let name = raw_name
        .split('\t')
        .map(|s| s.trim().trim_start_matches(',').trim())
        .filter(|s| !s.is_empty())
        .last()?
        .to_string();

    let (prefix, bits) = match raw_prefix.trim().split_once('/') {
        Some((p, b)) => (p, Some(b.parse::<usize>().ok()?)),
        None => (raw_prefix.trim(), None),
    };

    let mut nibbles = prefix
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;

    if let Some(bits) = bits {
        if bits % 4 != 0 || bits / 4 > nibbles.len() {
            return None;
        }
        nibbles.truncate(bits / 4);
    }

    if nibbles.len() < MIN_PREFIX_NIBBLES || nibbles.len() > 12 {
        return None;
    }

    Some((nibbles, name))
}

/// Thread-safe resolver shared by the registry and the shell.
pub struct VendorResolver {
    table: RwLock<Arc<OuiTable>>,
    generation: AtomicU64,
    pending_failure: Mutex<Option<String>>,
}

impl VendorResolver {
    /// A resolver with no data; every lookup returns `None`.
    pub fn empty() -> Self {
        Self::with_table(OuiTable::default())
    }

    /// Build from in-memory `(prefix, vendor)` pairs. Malformed prefixes are skipped.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut table = OuiTable::default();
        for (prefix, vendor) in entries {
            if let Some((nibbles, vendor)) = parse_line(&format!("{prefix}\t{vendor}")) {
                table.insert(&nibbles, vendor);
            }
        }
        Self::with_table(table)
    }

    /// Load from disk. Never fails: a broken table degrades to an empty one
    /// and the failure is kept for [`take_load_failure`](Self::take_load_failure).
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match read_table(path) {
            Ok(table) => {
                info!("Loaded {} vendor prefixes from {:?}", table.len(), path);
                Self::with_table(table)
            }
            Err(e) => {
                warn!("Vendor table unavailable, vendor names disabled: {}", e);
                let resolver = Self::empty();
                if let Ok(mut pending) = resolver.pending_failure.lock() {
                    *pending = Some(e.to_string());
                }
                resolver
            }
        }
    }

    fn with_table(table: OuiTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            generation: AtomicU64::new(1),
            pending_failure: Mutex::new(None),
        }
    }

    /// Longest-prefix match for `address`.
    pub fn resolve(&self, address: &MacAddress) -> Option<String> {
        let table = self.table.read().ok()?.clone();
        table.lookup(address).map(str::to_string)
    }

    /// Replace the whole table. The current table stays authoritative if the
    /// new one cannot be read.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<usize, VendorTableError> {
        let table = read_table(path.as_ref())?;
        let count = table.len();
        if let Ok(mut current) = self.table.write() {
            *current = Arc::new(table);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        info!("Vendor table reloaded ({} prefixes)", count);
        Ok(count)
    }

    /// Bumped on every successful reload; cached vendor names from an older
    /// generation are stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The initial load failure, returned at most once.
    pub fn take_load_failure(&self) -> Option<String> {
        self.pending_failure.lock().ok()?.take()
    }
}

fn read_table(path: &Path) -> Result<OuiTable, VendorTableError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VendorTableError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table = OuiTable::parse(&contents);
    if table.len() == 0 {
        return Err(VendorTableError::Empty(path.to_path_buf()));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn addr(s: &str) -> MacAddress {
        MacAddress::parse(s).unwrap()
    }

    #[test]
    fn resolves_simple_prefix() {
        let resolver = VendorResolver::from_entries([("B8:27:EB", "Raspberry Pi Foundation")]);
        assert_eq!(
            resolver.resolve(&addr("B8:27:EB:12:34:56")).as_deref(),
            Some("Raspberry Pi Foundation")
        );
        assert_eq!(resolver.resolve(&addr("00:11:22:33:44:55")), None);
    }

    #[test]
    fn longest_prefix_wins() {
        let resolver = VendorResolver::from_entries([
            ("70:B3:D5", "IEEE Registration Authority"),
            ("70:B3:D5:1F:3", "Small Block Owner"),
        ]);
        assert_eq!(
            resolver.resolve(&addr("70:B3:D5:1F:3A:00")).as_deref(),
            Some("Small Block Owner")
        );
        assert_eq!(
            resolver.resolve(&addr("70:B3:D5:20:00:00")).as_deref(),
            Some("IEEE Registration Authority")
        );
    }

    #[test]
    fn parses_ieee_and_wireshark_lines() {
        let (nibbles, name) = parse_line("00-1A-7D   (hex)\t\tcyber-blue(HK)Ltd").unwrap();
        assert_eq!(nibbles, vec![0, 0, 1, 0xA, 7, 0xD]);
        assert_eq!(name, "cyber-blue(HK)Ltd");

        let (nibbles, name) =
            parse_line("00:1B:C5:00:00:00/36\tConvergi\tConverging Systems Inc.").unwrap();
        assert_eq!(nibbles.len(), 9);
        assert_eq!(name, "Converging Systems Inc.");

        assert!(parse_line("# comment").is_none());
        assert!(parse_line("zz:zz:zz Nobody").is_none());
        assert!(parse_line("00:1A Short").is_none());
    }

    #[test]
    fn unicode_space_separators_do_not_split_characters() {
        let (nibbles, name) = parse_line("B8:27:EB\u{00A0}Raspberry").unwrap();
        assert_eq!(nibbles, vec![0xB, 8, 2, 7, 0xE, 0xB]);
        assert_eq!(name, "Raspberry");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "DC:A6:32\u{3000}Raspberry Pi Trading").unwrap();
        writeln!(file, "\u{00A0}\u{00A0}").unwrap();
        let resolver = VendorResolver::load(file.path());
        assert_eq!(
            resolver.resolve(&addr("DC:A6:32:00:00:01")).as_deref(),
            Some("Raspberry Pi Trading")
        );
    }

    #[test]
    fn missing_file_degrades_and_reports_once() {
        let resolver = VendorResolver::load("/nonexistent/oui.txt");
        assert!(resolver.is_empty());
        assert_eq!(resolver.resolve(&addr("B8:27:EB:00:00:01")), None);
        assert!(resolver.take_load_failure().is_some());
        assert!(resolver.take_load_failure().is_none());
    }

    #[test]
    fn reload_replaces_table_atomically() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "DC:A6:32\tRaspberry Pi Trading Ltd").unwrap();

        let resolver = VendorResolver::from_entries([("B8:27:EB", "Raspberry Pi Foundation")]);
        let before = resolver.generation();

        // A broken reload keeps the old table.
        assert!(resolver.reload("/nonexistent/oui.txt").is_err());
        assert_eq!(resolver.generation(), before);
        assert!(resolver.resolve(&addr("B8:27:EB:00:00:01")).is_some());

        assert_eq!(resolver.reload(file.path()).unwrap(), 1);
        assert!(resolver.generation() > before);
        assert_eq!(resolver.resolve(&addr("B8:27:EB:00:00:01")), None);
        assert_eq!(
            resolver.resolve(&addr("DC:A6:32:00:00:01")).as_deref(),
            Some("Raspberry Pi Trading Ltd")
        );
    }

    #[test]
    fn file_without_entries_is_a_load_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# nothing here").unwrap();
        let resolver = VendorResolver::load(file.path());
        assert!(resolver.is_empty());
        assert!(resolver.take_load_failure().is_some());
    }
}
