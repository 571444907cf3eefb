//! Application and protocol categories
//!
//! Two independent indexes (applications, protocols), each a pair of
//! tag-to-id and id-to-member-set maps, loaded from a JSON index with an
//! accepted legacy form. A third, directory-sourced index maps category
//! ids to domain suffix sets and network prefixes: files named
//! `<priority>-<category_tag>.conf` containing `dom:<suffix>` or
//! `net:<CIDR>` lines.
//!
//! Reload swaps the whole store atomically behind the lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

pub type CatId = u32;

/// Unassigned category
pub const CAT_UNKNOWN: CatId = 0;

/// Which index a query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatType {
    Application,
    Protocol,
}

#[derive(Debug, Default)]
struct CatIndex {
    /// tag -> category id
    tags: HashMap<String, CatId>,
    /// category id -> member ids
    members: HashMap<CatId, HashSet<u32>>,
}

#[derive(Debug, Default)]
struct CatStore {
    apps: CatIndex,
    protos: CatIndex,
    /// category id -> domain suffixes
    domains: HashMap<CatId, HashSet<String>>,
    /// Longest-prefix network index, sorted by prefix length descending
    networks: Vec<(IpNetwork, CatId)>,
}

/// JSON index document. The current form keys member arrays by category
/// id; the legacy form keys them directly by tag.
#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(default)]
    application_tag_index: BTreeMap<String, CatId>,
    #[serde(default)]
    application_index: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    protocol_tag_index: BTreeMap<String, CatId>,
    #[serde(default)]
    protocol_index: BTreeMap<String, Vec<u32>>,
}

/// Category store with interior locking
#[derive(Debug, Default)]
pub struct Categories {
    store: Mutex<CatStore>,
}

impl Categories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the JSON index, replacing the tag/member indexes. Domain and
    /// network data from the dot-directory is kept untouched.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read category index: {}", path.as_ref().display()))?;
        let index: IndexFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse category index: {}", path.as_ref().display()))?;

        let apps = build_index(&index.application_tag_index, &index.application_index);
        let protos = build_index(&index.protocol_tag_index, &index.protocol_index);

        let mut store = self.store.lock();
        info!(
            "Loaded {} application and {} protocol categories",
            apps.tags.len(),
            protos.tags.len()
        );
        store.apps = apps;
        store.protos = protos;

        Ok(())
    }

    /// Load the legacy form: `application_index` keyed by tag with member
    /// arrays; ids are assigned in tag order.
    pub fn load_legacy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        #[derive(Deserialize)]
        struct LegacyFile {
            #[serde(default)]
            application_index: BTreeMap<String, Vec<u32>>,
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read legacy index: {}", path.as_ref().display()))?;
        let legacy: LegacyFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse legacy index: {}", path.as_ref().display()))?;

        let mut apps = CatIndex::default();
        for (next_id, (tag, members)) in legacy.application_index.into_iter().enumerate() {
            let cat_id = next_id as CatId + 1;
            apps.tags.insert(tag, cat_id);
            apps.members.insert(cat_id, members.into_iter().collect());
        }

        let mut store = self.store.lock();
        info!("Loaded {} legacy application categories", apps.tags.len());
        store.apps = apps;

        Ok(())
    }

    /// Scan a dot-directory of `<priority>-<category_tag>.conf` files and
    /// replace the domain/network indexes. Tags must exist in the
    /// application index; files with unknown tags are rejected.
    pub fn load_dotd<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut names: Vec<String> = std::fs::read_dir(&path)
            .with_context(|| format!("Failed to scan category directory: {}", path.as_ref().display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "conf"))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();

        let mut store = self.store.lock();
        store.domains.clear();
        store.networks.clear();

        for name in names {
            let Some(tag) = name
                .find('-')
                .and_then(|p1| name.rfind('.').map(|p2| (p1, p2)))
                .filter(|(p1, p2)| p1 + 1 < *p2)
                .map(|(p1, p2)| &name[p1 + 1..p2])
            else {
                debug!("Rejecting category file (wrong format): {}", name);
                continue;
            };

            let Some(&cat_id) = store.apps.tags.get(tag) else {
                debug!("Rejecting category file (unknown tag): {}", name);
                continue;
            };

            let file_path = path.as_ref().join(&name);
            let content = match std::fs::read_to_string(&file_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Error reading category file: {}: {}", name, e);
                    continue;
                }
            };

            let mut domains = 0usize;
            let mut networks = 0usize;
            for line in content.lines() {
                let line = line.trim_start();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((kind, value)) = line.split_once(':') else {
                    continue;
                };
                match kind {
                    "dom" => {
                        store
                            .domains
                            .entry(cat_id)
                            .or_default()
                            .insert(value.to_lowercase());
                        domains += 1;
                    }
                    "net" => match value.parse::<IpNetwork>() {
                        Ok(net) => {
                            store.networks.push((net, cat_id));
                            networks += 1;
                        }
                        Err(_) => warn!("Invalid network address: {}: {}", name, value),
                    },
                    _ => {}
                }
            }

            debug!(
                "Loaded {} domains and {} networks from category file: {}",
                domains, networks, name
            );
        }

        // Longest prefix first, so lookup can stop at the first match.
        store.networks.sort_by(|a, b| b.0.prefix().cmp(&a.0.prefix()));

        Ok(())
    }

    fn with_index<R>(&self, cat_type: CatType, f: impl FnOnce(&CatIndex) -> R) -> R {
        let store = self.store.lock();
        let index = match cat_type {
            CatType::Application => &store.apps,
            CatType::Protocol => &store.protos,
        };
        f(index)
    }

    /// Category id for a tag
    pub fn lookup_tag(&self, cat_type: CatType, tag: &str) -> CatId {
        self.with_index(cat_type, |i| i.tags.get(tag).copied().unwrap_or(CAT_UNKNOWN))
    }

    /// Category id owning a member id
    pub fn lookup(&self, cat_type: CatType, member: u32) -> CatId {
        self.with_index(cat_type, |i| {
            i.members
                .iter()
                .find(|(_, members)| members.contains(&member))
                .map(|(&cat_id, _)| cat_id)
                .unwrap_or(CAT_UNKNOWN)
        })
    }

    /// Whether a member id belongs to a category
    pub fn is_member(&self, cat_type: CatType, cat_id: CatId, member: u32) -> bool {
        self.with_index(cat_type, |i| {
            i.members
                .get(&cat_id)
                .is_some_and(|members| members.contains(&member))
        })
    }

    /// Domain category via progressive suffix walk:
    /// `a.b.c.d` then `b.c.d` then `c.d` then `d`.
    pub fn lookup_domain(&self, domain: &str) -> CatId {
        let store = self.store.lock();
        let domain = domain.to_lowercase();
        let mut search = domain.as_str();

        loop {
            for (&cat_id, suffixes) in &store.domains {
                if suffixes.contains(search) {
                    return cat_id;
                }
            }
            match search.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => search = rest,
                _ => return CAT_UNKNOWN,
            }
        }
    }

    /// Network category via longest-prefix containment
    pub fn lookup_network(&self, addr: &IpAddr) -> CatId {
        let store = self.store.lock();
        store
            .networks
            .iter()
            .find(|(net, _)| net.contains(*addr))
            .map(|(_, cat_id)| *cat_id)
            .unwrap_or(CAT_UNKNOWN)
    }

    /// (tag count, member count) per index, for the status snapshot
    pub fn sizes(&self) -> ((usize, usize), (usize, usize)) {
        let store = self.store.lock();
        (
            (store.apps.tags.len(), store.apps.members.values().map(|m| m.len()).sum()),
            (store.protos.tags.len(), store.protos.members.values().map(|m| m.len()).sum()),
        )
    }
}

fn build_index(tags: &BTreeMap<String, CatId>, members: &BTreeMap<String, Vec<u32>>) -> CatIndex {
    let mut index = CatIndex::default();
    index.tags = tags.clone().into_iter().collect();

    for (cat_id, ids) in members {
        match cat_id.parse::<CatId>() {
            Ok(cat_id) => {
                index
                    .members
                    .entry(cat_id)
                    .or_default()
                    .extend(ids.iter().copied());
            }
            Err(_) => warn!("Ignoring non-numeric category id: {}", cat_id),
        }
    }

    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const INDEX_JSON: &str = r#"{
        "application_tag_index": {"streaming": 7, "social": 8},
        "application_index": {"7": [100, 101], "8": [200]},
        "protocol_tag_index": {"vpn": 3},
        "protocol_index": {"3": [42]}
    }"#;

    fn loaded() -> Categories {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("categories.json");
        std::fs::write(&path, INDEX_JSON).unwrap();

        let cats = Categories::new();
        cats.load(&path).unwrap();
        cats
    }

    #[test]
    fn test_tag_and_member_lookup() {
        let cats = loaded();
        assert_eq!(cats.lookup_tag(CatType::Application, "streaming"), 7);
        assert_eq!(cats.lookup_tag(CatType::Application, "nope"), CAT_UNKNOWN);
        assert_eq!(cats.lookup(CatType::Application, 100), 7);
        assert_eq!(cats.lookup(CatType::Protocol, 42), 3);
        assert_eq!(cats.lookup(CatType::Protocol, 43), CAT_UNKNOWN);
    }

    // A positive match returns true; a miss on category or member does not.
    #[test]
    fn test_member_lookup() {
        let cats = loaded();
        assert!(cats.is_member(CatType::Application, 7, 100));
        assert!(cats.is_member(CatType::Application, 7, 101));
        assert!(!cats.is_member(CatType::Application, 7, 200));
        assert!(!cats.is_member(CatType::Application, 9, 100));
        assert!(cats.is_member(CatType::Protocol, 3, 42));
    }

    #[test]
    fn test_legacy_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps-legacy.json");
        std::fs::write(
            &path,
            r#"{"application_index": {"gaming": [500, 501], "mail": [600]}}"#,
        )
        .unwrap();

        let cats = Categories::new();
        cats.load_legacy(&path).unwrap();

        let gaming = cats.lookup_tag(CatType::Application, "gaming");
        assert_ne!(gaming, CAT_UNKNOWN);
        assert!(cats.is_member(CatType::Application, gaming, 500));
        assert_eq!(cats.lookup(CatType::Application, 600), cats.lookup_tag(CatType::Application, "mail"));
    }

    #[test]
    fn test_dotd_domains_and_networks() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("categories.json");
        std::fs::write(&index_path, INDEX_JSON).unwrap();

        let dotd = dir.path().join("categories.d");
        std::fs::create_dir(&dotd).unwrap();
        let mut f = std::fs::File::create(dotd.join("10-streaming.conf")).unwrap();
        writeln!(f, "# streaming hosts").unwrap();
        writeln!(f, "dom:video.test").unwrap();
        writeln!(f, "net:198.51.100.0/24").unwrap();
        writeln!(f, "net:2001:db8:5::/48").unwrap();
        drop(f);
        // Unknown tag: rejected.
        std::fs::write(dotd.join("20-bogus.conf"), "dom:x.test\n").unwrap();

        let cats = Categories::new();
        cats.load(&index_path).unwrap();
        cats.load_dotd(&dotd).unwrap();

        assert_eq!(cats.lookup_domain("video.test"), 7);
        assert_eq!(cats.lookup_domain("cdn.video.test"), 7);
        assert_eq!(cats.lookup_domain("a.b.cdn.video.test"), 7);
        assert_eq!(cats.lookup_domain("other.test"), CAT_UNKNOWN);
        assert_eq!(cats.lookup_domain("x.test"), CAT_UNKNOWN);

        assert_eq!(cats.lookup_network(&"198.51.100.7".parse().unwrap()), 7);
        assert_eq!(cats.lookup_network(&"198.51.101.7".parse().unwrap()), CAT_UNKNOWN);
        assert_eq!(cats.lookup_network(&"2001:db8:5::1".parse().unwrap()), 7);
    }

    #[test]
    fn test_network_longest_prefix_wins() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("categories.json");
        std::fs::write(&index_path, INDEX_JSON).unwrap();

        let dotd = dir.path().join("categories.d");
        std::fs::create_dir(&dotd).unwrap();
        std::fs::write(dotd.join("10-streaming.conf"), "net:10.0.0.0/8\n").unwrap();
        std::fs::write(dotd.join("20-social.conf"), "net:10.1.0.0/16\n").unwrap();

        let cats = Categories::new();
        cats.load(&index_path).unwrap();
        cats.load_dotd(&dotd).unwrap();

        assert_eq!(cats.lookup_network(&"10.1.2.3".parse().unwrap()), 8);
        assert_eq!(cats.lookup_network(&"10.2.2.3".parse().unwrap()), 7);
    }
}
