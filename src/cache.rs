use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;

use http::{HeaderMap, Method};
use sha1::{Digest, Sha1};

use crate::body::RequestPayload;
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// SHA-1 fingerprint over the semantically relevant parts of a request.
///
/// The serialization is order-sensitive: the same headers inserted in a
/// different order produce a different key. Query parameters participate via
/// the URL, which already carries them by the time a request is dispatched.
pub(crate) fn request_fingerprint(
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    payload: Option<&RequestPayload>,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    for (name, value) in headers {
        hasher.update(name.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    match payload {
        Some(RequestPayload::Raw(bytes)) => {
            hasher.update(b"data:");
            hasher.update(bytes);
        }
        Some(RequestPayload::Json(bytes)) => {
            hasher.update(b"json:");
            hasher.update(bytes);
        }
        None => {}
    }

    let digest = hasher.finalize();
    let mut fingerprint = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(fingerprint, "{byte:02x}");
    }
    fingerprint
}

struct CacheState {
    entries: HashMap<String, Response>,
    insertion_order: VecDeque<String>,
}

/// Bounded fingerprint → response map with strict FIFO eviction.
///
/// Eviction order is insertion order, tracked by an explicit queue of keys;
/// reads do not refresh an entry's position. Entries are never replaced in
/// place: an insert against an existing key keeps the original entry.
pub(crate) struct ResponseCache {
    max_size: usize,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn get(&self, fingerprint: &str) -> Option<Response> {
        lock_unpoisoned(&self.state).entries.get(fingerprint).cloned()
    }

    pub(crate) fn insert(&self, fingerprint: String, response: Response) {
        let mut state = lock_unpoisoned(&self.state);
        if state.entries.contains_key(&fingerprint) {
            return;
        }
        while state.entries.len() >= self.max_size {
            let Some(oldest) = state.insertion_order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
        state.insertion_order.push_back(fingerprint.clone());
        state.entries.insert(fingerprint, response);
    }

    pub(crate) fn clear(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.entries.clear();
        state.insertion_order.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.state).entries.len()
    }
}
