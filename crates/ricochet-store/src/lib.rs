//! Persistent key-value state backed by fjall.
//!
//! One keyspace, one `state` partition, string keys under namespaced
//! prefixes (`ip-verdict-`, `ip-geo-`, `ip-lookup-`). Values are JSON
//! encodings of the fixed record shapes in [`record`]; entries survive
//! restarts.
//!
//! Verdict increments are read-modify-write. Updates for the same IP are
//! serialized through a sharded lock table (same key hashes to the same
//! shard); distinct IPs usually land on distinct shards and proceed in
//! parallel.

pub mod record;

use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub use record::{Geolocation, ReverseLookup, Verdict};

const VERDICT_PREFIX: &str = "ip-verdict-";
const GEO_PREFIX: &str = "ip-geo-";
const LOOKUP_PREFIX: &str = "ip-lookup-";

const LOCK_SHARDS: usize = 16;

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("keyspace: {0}")]
    Keyspace(#[from] fjall::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Inner {
    _keyspace: Keyspace,
    state: PartitionHandle,
    locks: Vec<Mutex<()>>,
}

/// Handle to the persistent state directory. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Open (or create) the state directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let keyspace = fjall::Config::new(path.as_ref()).open()?;
        let state = keyspace.open_partition("state", PartitionCreateOptions::default())?;
        debug!(path = %path.as_ref().display(), "opened key-value storage");
        Ok(Self {
            inner: Arc::new(Inner {
                _keyspace: keyspace,
                state,
                locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
            }),
        })
    }

    fn shard(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.inner.locks[hasher.finish() as usize % LOCK_SHARDS]
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.inner.state.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(value)?;
        self.inner.state.insert(key.as_bytes(), encoded)?;
        Ok(())
    }

    /// Verdict counters for a source IP. A missing key is the zero verdict.
    pub fn get_verdict(&self, ip: IpAddr) -> Result<Verdict, StoreError> {
        Ok(self
            .get(&format!("{VERDICT_PREFIX}{ip}"))?
            .unwrap_or_default())
    }

    /// Increment the accept counter for a source IP.
    pub fn inc_accepts(&self, ip: IpAddr) -> Result<(), StoreError> {
        self.bump(ip, |v| v.accepts += 1)
    }

    /// Increment the reject counter for a source IP.
    pub fn inc_rejects(&self, ip: IpAddr) -> Result<(), StoreError> {
        self.bump(ip, |v| v.rejects += 1)
    }

    fn bump(&self, ip: IpAddr, f: impl FnOnce(&mut Verdict)) -> Result<(), StoreError> {
        let key = format!("{VERDICT_PREFIX}{ip}");
        let _guard = self.shard(&key).lock();
        let mut verdict: Verdict = self.get(&key)?.unwrap_or_default();
        f(&mut verdict);
        self.put(&key, &verdict)
    }

    /// Cached geolocation for an IP, if any.
    pub fn get_geo(&self, ip: IpAddr) -> Result<Option<Geolocation>, StoreError> {
        self.get(&format!("{GEO_PREFIX}{ip}"))
    }

    /// Cache a geolocation record for an IP. Last writer wins.
    pub fn put_geo(&self, ip: IpAddr, geo: &Geolocation) -> Result<(), StoreError> {
        self.put(&format!("{GEO_PREFIX}{ip}"), geo)
    }

    /// Cached PTR lookup for an IP, if any.
    pub fn get_ptr(&self, ip: IpAddr) -> Result<Option<ReverseLookup>, StoreError> {
        self.get(&format!("{LOOKUP_PREFIX}{ip}"))
    }

    /// Cache a PTR lookup result for an IP. Last writer wins.
    pub fn put_ptr(&self, ip: IpAddr, ptr: &ReverseLookup) -> Result<(), StoreError> {
        self.put(&format!("{LOOKUP_PREFIX}{ip}"), ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn missing_verdict_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_verdict(ip(1)).unwrap(), Verdict::default());
    }

    #[test]
    fn increments_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.inc_accepts(ip(2)).unwrap();
        store.inc_accepts(ip(2)).unwrap();
        store.inc_rejects(ip(2)).unwrap();
        let v = store.get_verdict(ip(2)).unwrap();
        assert_eq!(v, Verdict { accepts: 2, rejects: 1 });
    }

    #[test]
    fn verdicts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            for _ in 0..4 {
                store.inc_rejects(ip(9)).unwrap();
            }
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_verdict(ip(9)).unwrap().rejects, 4);
    }

    #[test]
    fn geo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.get_geo(ip(3)).unwrap().is_none());

        let geo = Geolocation {
            organisations: vec!["AS0 Example".into()],
            country_code: "US".into(),
            country: "United States".into(),
            ..Default::default()
        };
        store.put_geo(ip(3), &geo).unwrap();
        assert_eq!(store.get_geo(ip(3)).unwrap(), Some(geo));
    }

    #[test]
    fn ptr_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let ptr = ReverseLookup {
            domains: vec!["crawl.example.net".into()],
        };
        store.put_ptr(ip(4), &ptr).unwrap();
        assert_eq!(store.get_ptr(ip(4)).unwrap(), Some(ptr));
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    store.inc_accepts(ip(5)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get_verdict(ip(5)).unwrap().accepts, 200);
    }
}
