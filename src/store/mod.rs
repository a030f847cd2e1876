//! store - durable transactional key-value store backing the volume manager.
//!
//! Формат <store> (LE):
//!   MAGIC8 = "QVSTORE1"
//!   u32 version          = 1
//!   u64 txid             (номер последнего коммита)
//!   u32 bucket_count
//!   повторяется bucket_count раз:
//!     u16 name_len, name, u32 entries
//!     повторяется entries раз: u32 key_len, key, u32 val_len, val
//!   u32 crc32            (по всем байтам выше)
//!
//! Политика:
//! - Одиночный писатель: эксклюзивный fs2-lock на <store>.lock на всё время жизни Store.
//! - Коммит атомарен: полное состояние -> <store>.tmp, sync_all, rename, fsync каталога.
//!   После сбоя виден либо старый, либо новый файл целиком.
//! - In-memory состояние меняется только после успешного rename.
//! - Битый magic/version/crc - ошибка открытия, а не молчаливый сброс.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::consts::{STORE_MAGIC, STORE_TMP_SUFFIX, STORE_VERSION};
use crate::lock::{acquire_exclusive_lock, try_acquire_exclusive_lock, LockGuard};
use crate::metrics::record_store_commit;
use crate::util::fsync_dir;

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// fsync tmp file and parent directory on commit.
    pub fsync: bool,
    /// Block on the lock instead of failing when another writer holds it.
    pub lock_wait: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            fsync: true,
            lock_wait: false,
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Put {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: String,
        key: Vec<u8>,
    },
}

/// Pending multi-key change set. Nothing is visible until `Store::commit`.
#[derive(Debug, Default, Clone)]
pub struct Txn {
    ops: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, bucket: &str, key: &[u8], value: Vec<u8>) -> &mut Self {
        self.ops.push(Op::Put {
            bucket: bucket.to_string(),
            key: key.to_vec(),
            value,
        });
        self
    }

    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> &mut Self {
        self.ops.push(Op::Delete {
            bucket: bucket.to_string(),
            key: key.to_vec(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

pub struct Store {
    path: PathBuf,
    buckets: BTreeMap<String, Bucket>,
    txid: u64,
    opts: StoreOptions,
    // None после close()
    lock: Option<LockGuard>,
}

impl Store {
    /// Open (creating if absent) the store at `path` and take the writer lock.
    pub fn open(path: &Path, opts: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create store dir {}", parent.display()))?;
            }
        }
        if path.is_dir() {
            return Err(anyhow!("store path {} is a directory", path.display()));
        }

        let lock = if opts.lock_wait {
            acquire_exclusive_lock(path)?
        } else {
            try_acquire_exclusive_lock(path)?
        };

        // Остаток незавершённого коммита - игнорируем.
        let tmp = tmp_path(path);
        if tmp.exists() {
            warn!("store: removing stale {}", tmp.display());
            let _ = fs::remove_file(&tmp);
        }

        let mut store = Self {
            path: path.to_path_buf(),
            buckets: BTreeMap::new(),
            txid: 0,
            opts,
            lock: Some(lock),
        };

        if path.exists() {
            let bytes = fs::read(path).with_context(|| format!("read store {}", path.display()))?;
            let (txid, buckets) = decode_state(&bytes)
                .with_context(|| format!("decode store {}", path.display()))?;
            store.txid = txid;
            store.buckets = buckets;
            info!(
                "store: opened {} (txid={}, buckets={})",
                path.display(),
                txid,
                store.buckets.len()
            );
        } else {
            let bytes = encode_state(0, &store.buckets)?;
            store.write_file(&bytes)?;
            info!("store: created {}", path.display());
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn txid(&self) -> u64 {
        self.txid
    }

    pub fn is_closed(&self) -> bool {
        self.lock.is_none()
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Option<&[u8]> {
        self.buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|v| v.as_slice())
    }

    /// All entries of a bucket in key order (empty if the bucket is absent).
    pub fn entries(&self, bucket: &str) -> Vec<(&[u8], &[u8])> {
        match self.buckets.get(bucket) {
            Some(b) => b.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect(),
            None => Vec::new(),
        }
    }

    /// Apply `txn` atomically and durably. On error nothing changes, in memory or on disk.
    pub fn commit(&mut self, txn: Txn) -> Result<u64> {
        if self.is_closed() {
            return Err(anyhow!("store {} is closed", self.path.display()));
        }
        if txn.is_empty() {
            return Ok(self.txid);
        }

        let mut next = self.buckets.clone();
        for op in txn.ops {
            match op {
                Op::Put { bucket, key, value } => {
                    next.entry(bucket).or_default().insert(key, value);
                }
                Op::Delete { bucket, key } => {
                    if let Some(b) = next.get_mut(&bucket) {
                        b.remove(&key);
                        if b.is_empty() {
                            next.remove(&bucket);
                        }
                    }
                }
            }
        }

        let txid = self.txid + 1;
        let bytes = encode_state(txid, &next)?;
        self.write_file(&bytes)?;

        self.buckets = next;
        self.txid = txid;
        record_store_commit(bytes.len());
        debug!("store: commit txid={} bytes={}", txid, bytes.len());
        Ok(txid)
    }

    /// Release the writer lock. Further commits fail.
    pub fn close(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            debug!("store: close {} (lock {})", self.path.display(), lock.path().display());
            drop(lock);
        }
        Ok(())
    }

    fn write_file(&self, bytes: &[u8]) -> Result<()> {
        let tmp = tmp_path(&self.path);
        let _ = fs::remove_file(&tmp);

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open store tmp {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write store tmp {}", tmp.display()))?;
        if self.opts.fsync {
            f.sync_all()
                .with_context(|| format!("fsync store tmp {}", tmp.display()))?;
        }
        drop(f);

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| {
                format!("rename {} -> {}", tmp.display(), self.path.display())
            });
        }
        if self.opts.fsync {
            fsync_dir(&self.path)
                .with_context(|| format!("fsync dir of {}", self.path.display()))?;
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_os_string();
    s.push(".");
    s.push(STORE_TMP_SUFFIX);
    PathBuf::from(s)
}

fn encode_state(txid: u64, buckets: &BTreeMap<String, Bucket>) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(64);
    out.write_all(STORE_MAGIC)?;
    out.write_u32::<LittleEndian>(STORE_VERSION)?;
    out.write_u64::<LittleEndian>(txid)?;
    out.write_u32::<LittleEndian>(len_u32(buckets.len())?)?;
    for (name, bucket) in buckets {
        if name.len() > u16::MAX as usize {
            return Err(anyhow!("bucket name too long: {}", name.len()));
        }
        out.write_u16::<LittleEndian>(name.len() as u16)?;
        out.write_all(name.as_bytes())?;
        out.write_u32::<LittleEndian>(len_u32(bucket.len())?)?;
        for (k, v) in bucket {
            out.write_u32::<LittleEndian>(len_u32(k.len())?)?;
            out.write_all(k)?;
            out.write_u32::<LittleEndian>(len_u32(v.len())?)?;
            out.write_all(v)?;
        }
    }
    let mut hasher = Crc32::new();
    hasher.update(&out);
    out.write_u32::<LittleEndian>(hasher.finalize())?;
    Ok(out)
}

fn decode_state(bytes: &[u8]) -> Result<(u64, BTreeMap<String, Bucket>)> {
    if bytes.len() < 8 + 4 + 8 + 4 + 4 {
        return Err(anyhow!("store file too short ({} bytes)", bytes.len()));
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let crc_expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != crc_expected {
        return Err(anyhow!("store crc mismatch"));
    }

    let mut cur = Cursor::new(body);
    let mut magic = [0u8; 8];
    cur.read_exact(&mut magic)?;
    if &magic != STORE_MAGIC {
        return Err(anyhow!(
            "bad store magic (expected {:?}, got {:?})",
            STORE_MAGIC,
            magic
        ));
    }
    let version = cur.read_u32::<LittleEndian>()?;
    if version != STORE_VERSION {
        return Err(anyhow!(
            "unsupported store version {} (expected {})",
            version,
            STORE_VERSION
        ));
    }
    let txid = cur.read_u64::<LittleEndian>()?;
    let nbuckets = cur.read_u32::<LittleEndian>()?;

    let mut buckets = BTreeMap::new();
    for _ in 0..nbuckets {
        let name_len = cur.read_u16::<LittleEndian>()? as usize;
        let name = String::from_utf8(read_vec(&mut cur, name_len)?)
            .map_err(|_| anyhow!("bucket name is not utf-8"))?;
        let entries = cur.read_u32::<LittleEndian>()?;
        let mut bucket = Bucket::new();
        for _ in 0..entries {
            let klen = cur.read_u32::<LittleEndian>()? as usize;
            let k = read_vec(&mut cur, klen)?;
            let vlen = cur.read_u32::<LittleEndian>()? as usize;
            let v = read_vec(&mut cur, vlen)?;
            bucket.insert(k, v);
        }
        buckets.insert(name, bucket);
    }
    if (cur.position() as usize) != body.len() {
        return Err(anyhow!(
            "trailing bytes in store file ({} unread)",
            body.len() - cur.position() as usize
        ));
    }
    Ok((txid, buckets))
}

fn read_vec(cur: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cur.get_ref().len() - cur.position() as usize;
    if len > remaining {
        return Err(anyhow!("length {} exceeds remaining {} bytes", len, remaining));
    }
    let mut v = vec![0u8; len];
    cur.read_exact(&mut v)?;
    Ok(v)
}

#[inline]
fn len_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| anyhow!("length {} does not fit u32", n))
}
