//! The signature store keeps a BuildInfo record per target between runs.
//!
//! Records live in memory during a run and are written back once, at the
//! end.  The store is either one file at the top of the tree or one file per
//! directory holding the records of the targets in that directory; both hold
//! the same records and give the same answers.
//!
//! File format: the magic "s2sign\n", a version byte and a layout byte, then
//! a sequence of records, each a little-endian u32 length followed by that
//! many bytes of payload.  A payload that fails to parse is dropped on its
//! own; the length prefix lets reading resume at the next one.

use crate::canon::{base_name, canon_path, join, parent_dir};
use crate::decider::{BuildInfo, DeciderKind, NodeInfo};
use crate::fs::Stamp;
use crate::hash::{ContentHash, HashAlgorithm};
use rustc_hash::{FxHashMap, FxHashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STORE_FILE: &str = ".s2sign";
const MAGIC: &[u8] = b"s2sign\n";
const VERSION: u8 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    /// A single store file at the top of the tree.
    Central,
    /// One store file per directory containing targets.
    PerDirectory,
}

impl Layout {
    fn tag(self) -> u8 {
        match self {
            Layout::Central => 1,
            Layout::PerDirectory => 2,
        }
    }
}

impl std::str::FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "central" => Ok(Layout::Central),
            "per-dir" | "per-directory" => Ok(Layout::PerDirectory),
            _ => Err(format!("unknown store layout {:?}, expected central or per-dir", s)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("open signature store {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("write signature store {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Cursor over a record payload.  Every read fails cleanly on truncation.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn read_u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    fn read_u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn read_u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn read_i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn read_str(&mut self) -> Option<String> {
        let len = self.read_u16()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }

    fn read_hash(&mut self, algorithm: HashAlgorithm) -> Option<ContentHash> {
        let len = self.read_u8()? as usize;
        if len != algorithm.digest_len() {
            return None;
        }
        Some(ContentHash {
            algorithm,
            bytes: self.take(len)?.to_vec(),
        })
    }

    fn read_node_info(&mut self, algorithm: HashAlgorithm) -> Option<NodeInfo> {
        let flags = self.read_u8()?;
        if flags & !0b11 != 0 {
            return None;
        }
        let stamp = if flags & 1 != 0 {
            Some(Stamp {
                secs: self.read_i64()?,
                nanos: self.read_u32()?,
                size: self.read_u64()?,
            })
        } else {
            None
        };
        let csig = if flags & 2 != 0 {
            Some(self.read_hash(algorithm)?)
        } else {
            None
        };
        Some(NodeInfo { stamp, csig })
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    // Names longer than this cannot be paths on any platform we run on.
    let len = s.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn write_hash(buf: &mut Vec<u8>, hash: &ContentHash) {
    buf.push(hash.bytes.len() as u8);
    buf.extend_from_slice(&hash.bytes);
}

fn write_node_info(buf: &mut Vec<u8>, info: &NodeInfo) {
    let flags = info.stamp.is_some() as u8 | (info.csig.is_some() as u8) << 1;
    buf.push(flags);
    if let Some(stamp) = &info.stamp {
        buf.extend_from_slice(&stamp.secs.to_le_bytes());
        buf.extend_from_slice(&stamp.nanos.to_le_bytes());
        buf.extend_from_slice(&stamp.size.to_le_bytes());
    }
    if let Some(csig) = &info.csig {
        write_hash(buf, csig);
    }
}

fn encode_record(key: &str, info: &BuildInfo) -> Vec<u8> {
    let mut buf = Vec::new();
    write_str(&mut buf, key);
    buf.push(info.decider.tag());
    buf.push(info.algorithm.tag());
    write_node_info(&mut buf, &info.target);
    write_hash(&mut buf, &info.action);
    buf.extend_from_slice(&info.recorded_at.to_le_bytes());
    buf.extend_from_slice(&(info.deps.len() as u32).to_le_bytes());
    for (name, dep) in &info.deps {
        write_str(&mut buf, name);
        write_node_info(&mut buf, dep);
    }
    buf.extend_from_slice(&(info.implicit.len() as u32).to_le_bytes());
    for name in &info.implicit {
        write_str(&mut buf, name);
    }
    buf
}

fn decode_record(payload: &[u8]) -> Option<(String, BuildInfo)> {
    let mut r = Reader { buf: payload };
    let key = r.read_str()?;
    let decider = DeciderKind::from_tag(r.read_u8()?)?;
    let algorithm = HashAlgorithm::from_tag(r.read_u8()?)?;
    let target = r.read_node_info(algorithm)?;
    let action = r.read_hash(algorithm)?;
    let recorded_at = r.read_i64()?;
    let ndeps = r.read_u32()? as usize;
    let mut deps = Vec::new();
    for _ in 0..ndeps {
        let name = r.read_str()?;
        deps.push((name, r.read_node_info(algorithm)?));
    }
    let nimplicit = r.read_u32()? as usize;
    let mut implicit = Vec::new();
    for _ in 0..nimplicit {
        implicit.push(r.read_str()?);
    }
    if !r.buf.is_empty() {
        return None;
    }
    Some((
        key,
        BuildInfo {
            decider,
            algorithm,
            target,
            action,
            deps,
            implicit,
            recorded_at,
        },
    ))
}

/// Parses a store file's contents.  Damage is logged and skipped; the result
/// holds every record that could be read.
fn decode_file(path: &Path, data: &[u8], layout: Layout) -> Vec<(String, BuildInfo)> {
    let mut out = Vec::new();
    let body = match data.strip_prefix(MAGIC) {
        Some(body) => body,
        None => {
            warn!("ignoring {}: not a signature store", path.display());
            return out;
        }
    };
    match body {
        [VERSION, tag, ..] if *tag == layout.tag() => {}
        [VERSION, ..] => {
            warn!("ignoring {}: written with a different store layout", path.display());
            return out;
        }
        [version, ..] => {
            warn!("ignoring {}: unsupported store version {}", path.display(), version);
            return out;
        }
        [] => {
            warn!("ignoring {}: truncated header", path.display());
            return out;
        }
    }
    let mut r = Reader { buf: &body[2..] };
    while !r.buf.is_empty() {
        let payload = match r.read_u32().and_then(|len| r.take(len as usize)) {
            Some(payload) => payload,
            None => {
                warn!("{}: truncated record at end of file", path.display());
                break;
            }
        };
        match decode_record(payload) {
            Some(record) => out.push(record),
            None => warn!("{}: dropping corrupt record", path.display()),
        }
    }
    out
}

fn encode_file<'a>(
    layout: Layout,
    records: impl Iterator<Item = (&'a str, &'a BuildInfo)>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.push(layout.tag());
    for (key, info) in records {
        let payload = encode_record(key, info);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
    }
    buf
}

/// Reads a store file; a missing file is an empty store.
fn read_file(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Open {
            path: path.to_owned(),
            source: err,
        }),
    }
}

/// Writes via a temporary file so a crash mid-write leaves the old store.
fn write_file(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let err = |source| StoreError::Write {
        path: path.to_owned(),
        source,
    };
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let mut f = std::fs::File::create(&tmp).map_err(err)?;
    f.write_all(data).map_err(err)?;
    drop(f);
    std::fs::rename(&tmp, path).map_err(err)
}

pub struct SignatureStore {
    top: PathBuf,
    layout: Layout,
    /// Keyed by full canonical name regardless of layout.
    entries: FxHashMap<String, BuildInfo>,
    /// Per-directory layout: shards read so far.
    loaded: FxHashSet<String>,
    /// Central layout uses "." for the single file.
    dirty: FxHashSet<String>,
}

impl SignatureStore {
    /// Opens the store rooted at `top`.  An absent store is empty; one that
    /// exists but cannot be read is an error.
    pub fn open(top: impl Into<PathBuf>, layout: Layout) -> Result<Self, StoreError> {
        let mut store = SignatureStore {
            top: top.into(),
            layout,
            entries: FxHashMap::default(),
            loaded: FxHashSet::default(),
            dirty: FxHashSet::default(),
        };
        store.load_shard(".")?;
        Ok(store)
    }

    fn shard_path(&self, dir: &str) -> PathBuf {
        if dir == "." {
            self.top.join(STORE_FILE)
        } else {
            self.top.join(dir).join(STORE_FILE)
        }
    }

    /// The shard a record belongs in.
    fn shard_of<'a>(&self, name: &'a str) -> &'a str {
        match self.layout {
            Layout::Central => ".",
            Layout::PerDirectory => parent_dir(name),
        }
    }

    fn load_shard(&mut self, dir: &str) -> Result<(), StoreError> {
        if !self.loaded.insert(dir.to_owned()) {
            return Ok(());
        }
        let path = self.shard_path(dir);
        let data = match read_file(&path)? {
            Some(data) => data,
            None => return Ok(()),
        };
        let records = decode_file(&path, &data, self.layout);
        debug!("loaded {} records from {}", records.len(), path.display());
        for (key, info) in records {
            let name = match self.layout {
                Layout::Central => key,
                Layout::PerDirectory => join(dir, &key),
            };
            self.entries.entry(name).or_insert(info);
        }
        Ok(())
    }

    /// Per-directory shards other than the top one are read on first use.
    /// A shard that cannot be read is treated as empty, which only costs
    /// rebuilds.
    fn ensure_loaded(&mut self, name: &str) {
        let dir = self.shard_of(name).to_owned();
        if let Err(err) = self.load_shard(&dir) {
            warn!("{}", err);
        }
    }

    pub fn get(&mut self, name: &str) -> Option<&BuildInfo> {
        self.ensure_loaded(name);
        self.entries.get(name)
    }

    pub fn set(&mut self, name: &str, info: BuildInfo) {
        self.ensure_loaded(name);
        let dir = self.shard_of(name).to_owned();
        self.dirty.insert(dir);
        self.entries.insert(name.to_owned(), info);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.ensure_loaded(name);
        if self.entries.remove(name).is_some() {
            let dir = self.shard_of(name).to_owned();
            self.dirty.insert(dir);
            true
        } else {
            false
        }
    }

    /// Reads every shard under the top directory, so that entries() and
    /// prune() see the whole store.
    pub fn load_all(&mut self) -> Result<(), StoreError> {
        if self.layout == Layout::Central {
            return Ok(());
        }
        let mut pending = vec![self.top.clone()];
        while let Some(dir) = pending.pop() {
            let read = std::fs::read_dir(&dir).map_err(|source| StoreError::Open {
                path: dir.clone(),
                source,
            })?;
            for entry in read.flatten() {
                let file_type = match entry.file_type() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if entry.file_name() == STORE_FILE {
                    let rel = dir.strip_prefix(&self.top).unwrap_or(&dir);
                    let rel = canon_path(rel.to_string_lossy());
                    self.load_shard(&rel)?;
                }
            }
        }
        Ok(())
    }

    /// Drops every record for which `keep` is false, returning how many.
    pub fn prune(&mut self, keep: impl Fn(&str) -> bool) -> Result<usize, StoreError> {
        self.load_all()?;
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|name| !keep(name))
            .cloned()
            .collect();
        for name in &doomed {
            self.remove(name);
        }
        Ok(doomed.len())
    }

    /// All loaded records, sorted by name.
    pub fn entries(&self) -> Vec<(&str, &BuildInfo)> {
        let mut out: Vec<(&str, &BuildInfo)> =
            self.entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes back every shard changed since the store was opened.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let mut dirty: Vec<String> = self.dirty.drain().collect();
        dirty.sort();
        let mut written = 0;
        for dir in dirty {
            let mut records: Vec<(&str, &BuildInfo)> = self
                .entries
                .iter()
                .filter(|(name, _)| self.shard_of(name) == dir)
                .map(|(name, info)| (name.as_str(), info))
                .collect();
            records.sort_by(|a, b| a.0.cmp(b.0));
            let path = self.shard_path(&dir);
            if records.is_empty() && self.layout == Layout::PerDirectory {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(StoreError::Write { path, source }),
                }
                continue;
            }
            written += records.len();
            let data = match self.layout {
                Layout::Central => encode_file(self.layout, records.into_iter()),
                Layout::PerDirectory => encode_file(
                    self.layout,
                    records.into_iter().map(|(name, info)| (base_name(name), info)),
                ),
            };
            write_file(&path, &data)?;
        }
        if written > 0 {
            info!("wrote {} signature records", written);
        }
        Ok(())
    }
}
