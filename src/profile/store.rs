//! On-disk persistence of the watchlist, profile and processed-URL ledger.

use super::{derive_subnet, DnaLock, Profile, WatchEntry};
use crate::fingerprint::Fingerprint;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const WATCHLIST_FILE: &str = "watchlist.json";
pub const PROFILE_FILE: &str = "profile.json";
pub const LEDGER_FILE: &str = "processed_urls.txt";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid address '{value}' in {path}")]
    InvalidAddress { path: PathBuf, value: String },
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct WatchlistFile {
    ips: Vec<String>,
    subnets: Vec<String>,
    fingerprints: Vec<WatchEntry>,
}

/// Mutable reference data, used while researching.
#[derive(Debug)]
pub struct ProfileStore {
    dir: PathBuf,
    entries: Vec<WatchEntry>,
    extra_subnets: BTreeSet<Ipv4Network>,
    profile: Profile,
    processed: HashSet<String>,
}

impl ProfileStore {
    /// Loads the store from `dir`. Missing files mean an empty store; the
    /// directory is created if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;

        let (entries, extra_subnets) = load_watchlist(&dir.join(WATCHLIST_FILE))?;
        let profile: Profile = read_json(&dir.join(PROFILE_FILE))?.unwrap_or_default();
        let processed = load_ledger(&dir.join(LEDGER_FILE))?;

        info!(
            dir = %dir.display(),
            entries = entries.len(),
            processed = processed.len(),
            "Profile store loaded"
        );

        Ok(Self {
            dir,
            entries,
            extra_subnets,
            profile,
            processed,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[WatchEntry] {
        &self.entries
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn is_processed(&self, url: &str) -> bool {
        self.processed.contains(url)
    }

    /// Adds an entry unless one with the same URL and address exists.
    pub fn add_entry(&mut self, entry: WatchEntry) -> bool {
        let exists = self
            .entries
            .iter()
            .any(|e| e.ip == entry.ip && e.url == entry.url);
        if !exists {
            self.entries.push(entry);
        }
        !exists
    }

    pub fn merge_fingerprint(&mut self, fingerprint: &Fingerprint) {
        self.profile.absorb(fingerprint);
    }

    pub fn add_ssl_issuer(&mut self, issuer: &str) {
        self.profile.add_ssl_issuer(issuer);
    }

    /// Appends `url` to the ledger file and remembers it.
    pub fn mark_processed(&mut self, url: &str) -> Result<(), StoreError> {
        if self.processed.contains(url) {
            return Ok(());
        }
        let path = self.dir.join(LEDGER_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{}", url).map(|_| file))
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        file.flush()
            .map_err(|source| StoreError::Write { path, source })?;
        self.processed.insert(url.to_string());
        Ok(())
    }

    /// Writes the watchlist and profile. Output is sorted, so it does not
    /// depend on the order sites were researched in.
    pub fn save(&self) -> Result<(), StoreError> {
        let mut entries: Vec<WatchEntry> = self
            .entries
            .iter()
            .filter(|e| e.url.is_some())
            .cloned()
            .collect();
        entries.sort_by(|a, b| (&a.url, a.ip).cmp(&(&b.url, b.ip)));

        let ips: BTreeSet<Ipv4Addr> = self.entries.iter().map(|e| e.ip).collect();
        let mut subnets: BTreeSet<Ipv4Network> = self.extra_subnets.clone();
        subnets.extend(self.entries.iter().map(|e| e.subnet));

        let watchlist = WatchlistFile {
            ips: ips.iter().map(Ipv4Addr::to_string).collect(),
            subnets: subnets.iter().map(Ipv4Network::to_string).collect(),
            fingerprints: entries,
        };

        write_json(&self.dir.join(WATCHLIST_FILE), &watchlist)?;
        write_json(&self.dir.join(PROFILE_FILE), &self.profile)?;
        debug!(dir = %self.dir.display(), "Profile store saved");
        Ok(())
    }

    /// Freezes the store for listening.
    pub fn lock(self) -> DnaLock {
        DnaLock::new(self.entries, self.extra_subnets, self.profile)
    }
}

fn load_watchlist(path: &Path) -> Result<(Vec<WatchEntry>, BTreeSet<Ipv4Network>), StoreError> {
    let Some(file) = read_json::<WatchlistFile>(path)? else {
        return Ok((Vec::new(), BTreeSet::new()));
    };

    let mut entries = file.fingerprints;
    for entry in &mut entries {
        let subnet = derive_subnet(entry.ip);
        if entry.subnet != subnet {
            warn!(ip = %entry.ip, stored = %entry.subnet, derived = %subnet, "Stored subnet does not match its address");
            entry.subnet = subnet;
        }
    }
    for raw in &file.ips {
        let ip: Ipv4Addr = raw.trim().parse().map_err(|_| StoreError::InvalidAddress {
            path: path.to_path_buf(),
            value: raw.clone(),
        })?;
        if !entries.iter().any(|e| e.ip == ip) {
            entries.push(WatchEntry::hand_curated(ip));
        }
    }

    let subnets = file
        .subnets
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<Ipv4Network>()
                .map_err(|_| StoreError::InvalidAddress {
                    path: path.to_path_buf(),
                    value: raw.clone(),
                })
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok((entries, subnets))
}

fn load_ledger(path: &Path) -> Result<HashSet<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes through a temporary file so readers never see a partial document.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_empty_directory() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::open(dir.path().join("data")).unwrap();
        assert!(store.entries().is_empty());
        assert!(store.profile().is_empty());
        assert_eq!(store.processed_count(), 0);
    }

    #[test]
    fn test_bare_ips_load_as_hand_curated_entries() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(WATCHLIST_FILE),
            r#"{"ips": ["159.198.65.253"], "subnets": ["45.8.12.0/24"]}"#,
        )
        .unwrap();

        let store = ProfileStore::open(dir.path()).unwrap();
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].url, None);

        let lock = store.lock();
        assert!(lock.is_watched_ip("159.198.65.253".parse().unwrap()));
        assert!(lock.watched_subnet_for("45.8.12.9".parse().unwrap()).is_some());
    }

    #[test]
    fn test_invalid_ip_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(WATCHLIST_FILE), r#"{"ips": ["not-an-ip"]}"#).unwrap();
        let err = ProfileStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidAddress { .. }));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path()).unwrap();
        store.add_entry(WatchEntry::new(
            "https://whitecat.fun/",
            "159.198.65.253".parse().unwrap(),
            Fingerprint::degraded(),
        ));
        store.add_ssl_issuer("Let's Encrypt");
        store.save().unwrap();
        store.mark_processed("https://whitecat.fun/").unwrap();

        let reloaded = ProfileStore::open(dir.path()).unwrap();
        assert_eq!(reloaded.entries(), store.entries());
        assert_eq!(reloaded.profile(), store.profile());
        assert!(reloaded.is_processed("https://whitecat.fun/"));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(WATCHLIST_FILE)).unwrap()).unwrap();
        assert_eq!(raw["ips"][0], "159.198.65.253");
        assert_eq!(raw["subnets"][0], "159.198.65.0/24");
    }

    #[test]
    fn test_entry_subnet_is_rederived_on_load() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(WATCHLIST_FILE),
            r#"{"fingerprints": [{"url": "https://whitecat.fun/", "ip": "159.198.65.253", "subnet": "10.0.0.0/8"}]}"#,
        )
        .unwrap();

        let store = ProfileStore::open(dir.path()).unwrap();

        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].subnet, "159.198.65.0/24".parse::<Ipv4Network>().unwrap());
        let lock = store.lock();
        assert!(lock.watched_subnet_for("10.1.2.3".parse().unwrap()).is_none());
    }

    #[test]
    fn test_ledger_is_append_only() {
        let dir = tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path()).unwrap();
        store.mark_processed("https://a.example/").unwrap();
        store.mark_processed("https://b.example/").unwrap();
        store.mark_processed("https://a.example/").unwrap();

        let ledger = fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(ledger, "https://a.example/\nhttps://b.example/\n");
    }

    #[test]
    fn test_add_entry_deduplicates() {
        let dir = tempdir().unwrap();
        let mut store = ProfileStore::open(dir.path()).unwrap();
        let entry = WatchEntry::new("https://a.example/", "1.2.3.4".parse().unwrap(), Fingerprint::degraded());
        assert!(store.add_entry(entry.clone()));
        assert!(!store.add_entry(entry));
        assert_eq!(store.entries().len(), 1);
    }
}
