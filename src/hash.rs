//! Content digests.  A strong digest of file bytes is what the content-based
//! deciders compare, and the same digest type names actions and aggregate
//! nodes (aliases, directories) in build signatures.

use crate::fs::{FileSystem, Stamp};
use dashmap::DashMap;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// Tag byte used in the signature store.
    pub fn tag(self) -> u8 {
        match self {
            HashAlgorithm::Md5 => 1,
            HashAlgorithm::Sha1 => 2,
            HashAlgorithm::Sha256 => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => HashAlgorithm::Md5,
            2 => HashAlgorithm::Sha1,
            3 => HashAlgorithm::Sha256,
            _ => return None,
        })
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "md5" => HashAlgorithm::Md5,
            "sha1" => HashAlgorithm::Sha1,
            "sha256" => HashAlgorithm::Sha256,
            _ => return Err(format!("unknown hash format {:?}, expected md5, sha1 or sha256", s)),
        })
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A digest together with the algorithm that produced it.  Digests from
/// different algorithms never compare equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub bytes: Vec<u8>,
}

impl ContentHash {
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex())
    }
}

const UNIT_SEPARATOR: u8 = 0x1F;

enum State {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

/// Incremental hasher over the selected algorithm.  Strings are written with
/// a trailing separator so that ["ab", "c"] and ["a", "bc"] differ.
pub struct SigHasher(State);

impl SigHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        SigHasher(match algorithm {
            HashAlgorithm::Md5 => State::Md5(Md5::new()),
            HashAlgorithm::Sha1 => State::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => State::Sha256(Sha256::new()),
        })
    }

    pub fn write(&mut self, bytes: &[u8]) {
        match &mut self.0 {
            State::Md5(h) => h.update(bytes),
            State::Sha1(h) => h.update(bytes),
            State::Sha256(h) => h.update(bytes),
        }
    }

    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
        self.write_separator();
    }

    pub fn write_separator(&mut self) {
        self.write(&[UNIT_SEPARATOR]);
    }

    pub fn write_stamp(&mut self, stamp: &Stamp) {
        self.write(&stamp.secs.to_le_bytes());
        self.write(&stamp.nanos.to_le_bytes());
        self.write(&stamp.size.to_le_bytes());
    }

    pub fn finish(self) -> ContentHash {
        let (algorithm, bytes) = match self.0 {
            State::Md5(h) => (HashAlgorithm::Md5, h.finalize().to_vec()),
            State::Sha1(h) => (HashAlgorithm::Sha1, h.finalize().to_vec()),
            State::Sha256(h) => (HashAlgorithm::Sha256, h.finalize().to_vec()),
        };
        ContentHash { algorithm, bytes }
    }
}

pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> ContentHash {
    let mut h = SigHasher::new(algorithm);
    h.write(data);
    h.finish()
}

/// Per-run memo of file digests keyed by path.  An entry is only reused while
/// the file's stamp matches the one it was hashed under; outputs are
/// explicitly invalidated after their build runs.
///
/// Shared between the scheduling thread and the parallel warmup pass, hence
/// the concurrent map.
#[derive(Default)]
pub struct DigestCache {
    map: DashMap<String, (Stamp, ContentHash)>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(
        &self,
        fs: &dyn FileSystem,
        path: &str,
        stamp: Stamp,
        algorithm: HashAlgorithm,
    ) -> std::io::Result<ContentHash> {
        if let Some(entry) = self.map.get(path) {
            let (cached_stamp, hash) = entry.value();
            if *cached_stamp == stamp && hash.algorithm == algorithm {
                return Ok(hash.clone());
            }
        }
        let hash = digest(algorithm, &fs.read(path)?);
        self.map.insert(path.to_owned(), (stamp, hash.clone()));
        Ok(hash)
    }

    pub fn invalidate(&self, path: &str) {
        self.map.remove(path);
    }
}
