use crate::artifact::{ArtifactKind, ArtifactMetadata, FileAttributes};
use crate::event::{now_rfc3339, ScanId};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digests are compared case-insensitively; the store keys on lowercase hex.
pub fn normalize_digest(digest: &str) -> String {
    digest.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    pub is_new: bool,
    /// Attributes of this sighting: the caller's scan and URL, the shared
    /// digest.
    pub attributes: FileAttributes,
}

#[derive(Debug, Clone)]
pub struct StoredContent {
    pub kind: ArtifactKind,
    /// Attributes recorded by the first scan that offered this digest.
    pub first_seen: FileAttributes,
    pub size: Option<usize>,
    pub bytes: Option<Arc<[u8]>>,
    pub scans: BTreeSet<ScanId>,
    pub urls: BTreeSet<String>,
}

/// Process-wide content-addressed store shared by every scan.
///
/// The check and the insert happen under one lock, so for a given digest at
/// most one caller ever observes `is_new == true`.
#[derive(Debug, Default)]
pub struct ContentStore {
    retain_content: bool,
    entries: Mutex<HashMap<String, StoredContent>>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep artifact bytes in memory in addition to digests and metadata.
    pub fn with_retention(retain_content: bool) -> Self {
        Self {
            retain_content,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn put_if_absent(
        &self,
        digest: &str,
        bytes: Option<&[u8]>,
        metadata: ArtifactMetadata,
    ) -> PutOutcome {
        let key = normalize_digest(digest);
        let attributes = FileAttributes {
            id: None,
            scan_id: metadata.scan_id.clone(),
            created_at: Some(now_rfc3339()),
            url: metadata.url.clone(),
            filename: metadata.filename.clone(),
            headers: metadata.headers.clone(),
            sha256: key.clone(),
        };

        let mut entries = self.lock();
        match entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                stored.scans.insert(metadata.scan_id);
                stored.urls.insert(metadata.url);
                if stored.size.is_none() {
                    stored.size = bytes.map(<[u8]>::len);
                }
                if self.retain_content && stored.bytes.is_none() {
                    stored.bytes = bytes.map(Arc::from);
                }
                PutOutcome {
                    is_new: false,
                    attributes,
                }
            }
            Entry::Vacant(vacant) => {
                debug!(sha256 = %vacant.key(), url = %metadata.url, kind = ?metadata.kind, "new content digest");
                let mut scans = BTreeSet::new();
                scans.insert(metadata.scan_id);
                let mut urls = BTreeSet::new();
                urls.insert(metadata.url);
                vacant.insert(StoredContent {
                    kind: metadata.kind,
                    first_seen: attributes.clone(),
                    size: bytes.map(<[u8]>::len),
                    bytes: if self.retain_content {
                        bytes.map(Arc::from)
                    } else {
                        None
                    },
                    scans,
                    urls,
                });
                PutOutcome {
                    is_new: true,
                    attributes,
                }
            }
        }
    }

    pub fn get(&self, digest: &str) -> Option<StoredContent> {
        self.lock().get(&normalize_digest(digest)).cloned()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.lock().contains_key(&normalize_digest(digest))
    }

    /// Every scan that has offered content with this digest.
    pub fn scans_for(&self, digest: &str) -> Vec<ScanId> {
        self.lock()
            .get(&normalize_digest(digest))
            .map(|stored| stored.scans.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Every critical section leaves the map consistent, so a poisoned lock
    // is still safe to reuse.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredContent>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn meta(scan: &str, url: &str) -> ArtifactMetadata {
        ArtifactMetadata::new(ScanId::from(scan), ArtifactKind::Script, url)
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn second_put_of_same_digest_is_not_new() {
        let store = ContentStore::new();
        let digest = sha256_hex(b"console.log(1)");
        let first = store.put_if_absent(&digest, Some(&b"console.log(1)"[..]), meta("s1", "https://a.test/a.js"));
        let second = store.put_if_absent(&digest, Some(&b"console.log(1)"[..]), meta("s2", "https://b.test/b.js"));
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.attributes.sha256, second.attributes.sha256);
        assert_eq!(second.attributes.url, "https://b.test/b.js");

        let stored = store.get(&digest).expect("stored content");
        assert_eq!(stored.first_seen.url, "https://a.test/a.js");
        assert_eq!(stored.urls.len(), 2);
        assert_eq!(store.scans_for(&digest).len(), 2);
        assert!(stored.bytes.is_none());
    }

    #[test]
    fn digest_lookup_ignores_case() {
        let store = ContentStore::with_retention(true);
        store.put_if_absent("ABC123", Some(&b"x"[..]), meta("s1", "https://a.test/x.js"));
        assert!(store.contains("abc123"));
        let stored = store.get("AbC123").expect("case-insensitive hit");
        assert_eq!(stored.bytes.as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn concurrent_puts_yield_exactly_one_new() {
        let store = ContentStore::new();
        let payload = b"(function(){ steal(document.cookie) })()";
        let digest = sha256_hex(payload);
        let outcomes: Vec<PutOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = &store;
                    let digest = digest.as_str();
                    scope.spawn(move || {
                        store.put_if_absent(
                            digest,
                            Some(&payload[..]),
                            meta(&format!("scan-{i}"), "https://cdn.test/p.js"),
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread"))
                .collect()
        });

        assert_eq!(outcomes.iter().filter(|o| o.is_new).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.is_new).count(), 15);
        assert!(outcomes.iter().all(|o| o.attributes.sha256 == digest));
        assert_eq!(store.len(), 1);
        assert_eq!(store.scans_for(&digest).len(), 16);
    }
}
