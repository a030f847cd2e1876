//! manager - владелец Store, единственного Provider и реестров томов/имён.
//!
//! Политика:
//! - Store - источник истины; HashMap-реестры - кэш, пересобираемый целиком в open().
//! - Любая мутация: вызов провайдера -> один Txn -> commit -> только потом кэш.
//!   Провал провайдера - ничего не коммитим. Провал коммита - best-effort откат у провайдера.
//! - Factory вызывается только если в meta/provider ещё нет bootstrap-записи.
//! - Все мутации сериализованы write-локом; чтения идут под read-локом.
//! - Данные send/receive передаются вне лока; под локом только метаданные.

use anyhow::anyhow;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::ManagerConfig;
use crate::consts::{BUCKET_META, BUCKET_NAMES, BUCKET_VOLUMES, META_KEY_PROVIDER};
use crate::error::{Result, VolumeError};
use crate::metrics::{
    record_diff_received, record_diff_sent, record_snapshot_created, record_snapshot_received,
    record_volume_created, record_volume_destroyed, record_volume_reattached,
};
use crate::provider::diff::{CountingReader, CountingWriter, DiffError};
use crate::provider::{
    restore_provider, BootstrapRecord, Haves, ProvidedVolume, Provider, SendOptions,
};
use crate::store::{Store, StoreOptions, Txn};
use crate::util::{new_volume_id, now_secs};
use crate::volume::{Volume, VolumeInfo, VolumeRecord};

struct Inner {
    // None после close()
    store: Option<Store>,
    volumes: HashMap<String, Volume>,
    names: HashMap<String, String>,
}

impl Inner {
    fn store_mut(&mut self) -> Result<&mut Store> {
        self.store.as_mut().ok_or(VolumeError::Closed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.store.is_none() {
            return Err(VolumeError::Closed);
        }
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<&Volume> {
        self.volumes
            .get(id)
            .ok_or_else(|| VolumeError::not_found("volume", id))
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = new_volume_id();
            if !self.volumes.contains_key(&id) {
                return id;
            }
        }
    }
}

pub struct Manager {
    path: PathBuf,
    cfg: ManagerConfig,
    provider: Arc<dyn Provider>,
    inner: RwLock<Inner>,
    // цели receive, по которым сейчас идёт передача данных
    receiving: Mutex<HashSet<String>>,
}

impl Manager {
    /// Open with `ManagerConfig::from_env()`.
    pub fn open<P, F>(path: P, factory: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce() -> anyhow::Result<Arc<dyn Provider>>,
    {
        Self::open_with_config(path, ManagerConfig::from_env(), factory)
    }

    /// Open (creating if absent) the store at `path` and recover every
    /// persisted volume. `factory` runs only when the store has never
    /// recorded a provider.
    pub fn open_with_config<P, F>(path: P, cfg: ManagerConfig, factory: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce() -> anyhow::Result<Arc<dyn Provider>>,
    {
        let path = path.as_ref().to_path_buf();
        let opts = StoreOptions {
            fsync: cfg.commit_fsync,
            lock_wait: cfg.lock_wait,
        };
        let mut store = Store::open(&path, opts).map_err(VolumeError::Open)?;

        let recorded = store.get(BUCKET_META, META_KEY_PROVIDER).map(|raw| raw.to_vec());
        let provider = match recorded {
            Some(raw) => {
                let record: BootstrapRecord = serde_json::from_slice(&raw)
                    .map_err(|e| VolumeError::ProviderBootstrap(anyhow!("decode bootstrap record: {}", e)))?;
                let p = restore_provider(&record).map_err(VolumeError::ProviderBootstrap)?;
                info!("manager: provider '{}' restored from bootstrap record", record.kind);
                p
            }
            None => {
                let p = factory().map_err(|e| VolumeError::ProviderBootstrap(e.context("provider factory")))?;
                let record = p.bootstrap().map_err(VolumeError::ProviderBootstrap)?;
                let raw = serde_json::to_vec(&record)
                    .map_err(|e| VolumeError::ProviderBootstrap(anyhow!("encode bootstrap record: {}", e)))?;
                let mut txn = Txn::new();
                txn.put(BUCKET_META, META_KEY_PROVIDER, raw);
                store.commit(txn).map_err(VolumeError::Open)?;
                info!("manager: provider '{}' initialized, bootstrap record saved", record.kind);
                p
            }
        };

        let (volumes, names) = load_registries(&store, &provider)?;

        // reattach в порядке id - детерминированный лог и первая ошибка
        let mut ids: Vec<&String> = volumes.keys().collect();
        ids.sort();
        for id in ids {
            let (vol, state) = &volumes[id];
            provider
                .reattach(vol.info(), state)
                .map_err(|e| VolumeError::Recovery {
                    id: id.clone(),
                    source: e,
                })?;
            record_volume_reattached();
            debug!("manager: reattached {} at {}", id, vol.location().display());
        }

        info!(
            "manager: opened {} (volumes={}, names={}, {})",
            path.display(),
            volumes.len(),
            names.len(),
            cfg
        );

        Ok(Self {
            path,
            cfg,
            provider,
            inner: RwLock::new(Inner {
                store: Some(store),
                volumes: volumes.into_iter().map(|(id, (v, _))| (id, v)).collect(),
                names,
            }),
            receiving: Mutex::new(HashSet::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    /// The shared provider instance every volume of this manager points at.
    pub fn provider(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.provider)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn receiving(&self) -> MutexGuard<'_, HashSet<String>> {
        self.receiving.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------- lifecycle --------------------

    pub fn new_volume(&self) -> Result<Volume> {
        let mut inner = self.write();
        inner.ensure_open()?;
        let id = inner.fresh_id();
        let pv = self.provider.new_volume(&id).map_err(VolumeError::Provider)?;
        let vol = self.register(&mut inner, id, pv, false, None, None)?;
        record_volume_created();
        info!("manager: new volume {}", vol.id());
        Ok(vol)
    }

    /// New volume with content copied from `base_id` (unnamed).
    pub fn fork_volume(&self, base_id: &str) -> Result<Volume> {
        let mut inner = self.write();
        inner.ensure_open()?;
        let base = inner.lookup(base_id)?.info().clone();
        let id = inner.fresh_id();
        let pv = self
            .provider
            .fork_volume(&base, &id)
            .map_err(VolumeError::Provider)?;
        let vol = self.register(&mut inner, id, pv, false, Some(base_id), None)?;
        record_volume_created();
        info!("manager: forked {} from {}", vol.id(), base_id);
        Ok(vol)
    }

    /// Idempotent get-or-create by name. An empty `base_id` means an empty volume.
    pub fn create_or_get_named_volume(&self, name: &str, base_id: &str) -> Result<Volume> {
        let mut inner = self.write();
        inner.ensure_open()?;

        if let Some(bound) = inner.names.get(name) {
            let vol = inner.lookup(bound)?;
            if !base_id.is_empty() && vol.origin() != Some(base_id) {
                return Err(VolumeError::Conflict(format!(
                    "name '{}' is already bound to volume '{}' (base '{}' requested)",
                    name,
                    vol.id(),
                    base_id
                )));
            }
            return Ok(vol.clone());
        }

        let id = inner.fresh_id();
        let (pv, origin) = if base_id.is_empty() {
            let pv = self.provider.new_volume(&id).map_err(VolumeError::Provider)?;
            (pv, None)
        } else {
            let base = inner.lookup(base_id)?.info().clone();
            let pv = self
                .provider
                .fork_volume(&base, &id)
                .map_err(VolumeError::Provider)?;
            (pv, Some(base_id))
        };
        let vol = self.register(&mut inner, id, pv, false, origin, Some(name))?;
        record_volume_created();
        info!("manager: named volume '{}' -> {}", name, vol.id());
        Ok(vol)
    }

    pub fn destroy_volume(&self, id: &str) -> Result<()> {
        let mut inner = self.write();
        inner.ensure_open()?;
        let info = inner.lookup(id)?.info().clone();
        if self.receiving().contains(id) {
            return Err(VolumeError::Conflict(format!(
                "volume '{}' is the target of a receive in progress",
                id
            )));
        }

        self.provider
            .destroy_volume(&info)
            .map_err(VolumeError::Provider)?;

        let bound: Vec<String> = inner
            .names
            .iter()
            .filter(|(_, v)| v.as_str() == id)
            .map(|(n, _)| n.clone())
            .collect();
        let mut txn = Txn::new();
        txn.delete(BUCKET_VOLUMES, id.as_bytes());
        for name in &bound {
            txn.delete(BUCKET_NAMES, name.as_bytes());
        }
        // Хранилище уже уничтожено; при провале коммита запись остаётся, а open() выдаст RecoveryError.
        inner.store_mut()?.commit(txn).map_err(VolumeError::Store)?;

        inner.volumes.remove(id);
        for name in &bound {
            inner.names.remove(name);
        }
        record_volume_destroyed();
        info!("manager: destroyed {} (names: {:?})", id, bound);
        Ok(())
    }

    pub fn volume(&self, id: &str) -> Result<Volume> {
        let inner = self.read();
        inner.ensure_open()?;
        inner.lookup(id).cloned()
    }

    /// Point-in-time copy of the volume registry.
    pub fn volumes(&self) -> Result<HashMap<String, Volume>> {
        let inner = self.read();
        inner.ensure_open()?;
        Ok(inner.volumes.clone())
    }

    /// Point-in-time copy of name -> volume id.
    pub fn named_volumes(&self) -> Result<HashMap<String, String>> {
        let inner = self.read();
        inner.ensure_open()?;
        Ok(inner.names.clone())
    }

    /// Close the store. Every later call fails with `VolumeError::Closed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.write();
        let mut store = inner.store.take().ok_or(VolumeError::Closed)?;
        store.close().map_err(VolumeError::Store)?;
        info!("manager: closed {}", self.path.display());
        Ok(())
    }

    // -------------------- snapshots --------------------

    pub fn create_snapshot(&self, volume_id: &str) -> Result<Volume> {
        let mut inner = self.write();
        inner.ensure_open()?;
        let source = inner.lookup(volume_id)?.info().clone();
        if !self.provider.can_snapshot(&source) {
            return Err(VolumeError::NotFound(format!(
                "volume '{}' cannot be snapshotted",
                volume_id
            )));
        }
        let id = inner.fresh_id();
        let pv = self
            .provider
            .create_snapshot(&source, &id)
            .map_err(VolumeError::Provider)?;
        let vol = self.register(&mut inner, id, pv, true, Some(volume_id), None)?;
        record_snapshot_created();
        info!("manager: snapshot {} of {}", vol.id(), volume_id);
        Ok(vol)
    }

    /// Content markers `volume_id` already holds.
    pub fn list_haves(&self, volume_id: &str) -> Result<Haves> {
        let inner = self.read();
        inner.ensure_open()?;
        let info = inner.lookup(volume_id)?.info();
        self.provider.list_haves(info).map_err(VolumeError::Provider)
    }

    /// Write the diff of `snapshot_id` against `haves` to `out`.
    pub fn send_snapshot(&self, snapshot_id: &str, haves: &Haves, out: &mut dyn Write) -> Result<()> {
        let info = {
            let inner = self.read();
            inner.ensure_open()?;
            let vol = inner.lookup(snapshot_id)?;
            if !vol.is_snapshot() {
                return Err(VolumeError::not_found("snapshot", snapshot_id));
            }
            vol.info().clone()
        };

        let opts = SendOptions {
            compress: self.cfg.diff_compress,
            chunk_size: self.cfg.diff_chunk_size,
        };
        let mut counted = CountingWriter::new(out);
        self.provider
            .send_snapshot(&info, haves, &mut counted, &opts)
            .map_err(VolumeError::Provider)?;
        record_diff_sent(counted.count());
        info!(
            "manager: sent {} ({} haves, {} bytes)",
            snapshot_id,
            haves.len(),
            counted.count()
        );
        Ok(())
    }

    /// Apply a diff stream on top of `target_id` and register the result as a new snapshot.
    /// The target itself is left as it was.
    pub fn receive_snapshot(&self, target_id: &str, input: &mut dyn Read) -> Result<Volume> {
        let (target, id) = {
            let inner = self.read();
            inner.ensure_open()?;
            let target = inner.lookup(target_id)?.info().clone();
            // метка ставится под локом, иначе destroy_volume проскочит между lookup и insert
            if !self.receiving().insert(target_id.to_string()) {
                return Err(VolumeError::Conflict(format!(
                    "volume '{}' is already receiving a snapshot",
                    target_id
                )));
            }
            (target, inner.fresh_id())
        };

        let mut counted = CountingReader::new(input);
        let received = self.provider.receive_snapshot(&target, &mut counted, &id);

        let mut inner = self.write();
        self.receiving().remove(target_id);
        let pv = received.map_err(|e| {
            if e.downcast_ref::<DiffError>().is_some() {
                VolumeError::Protocol(e)
            } else {
                VolumeError::Provider(e)
            }
        })?;
        record_diff_received(counted.count());

        let gone = if inner.store.is_none() {
            Some(VolumeError::Closed)
        } else if !inner.volumes.contains_key(target_id) {
            Some(VolumeError::not_found("volume", target_id))
        } else {
            None
        };
        if let Some(err) = gone {
            self.discard(&id, &pv, true, Some(target_id));
            return Err(err);
        }

        let vol = self.register(&mut inner, id, pv, true, Some(target_id), None)?;
        record_snapshot_received();
        info!(
            "manager: received {} into {} ({} bytes)",
            vol.id(),
            target_id,
            counted.count()
        );
        Ok(vol)
    }

    // -------------------- internals --------------------

    /// Persist a freshly provided volume (and optional name) in one transaction,
    /// then publish it in the registries.
    fn register(
        &self,
        inner: &mut Inner,
        id: String,
        pv: ProvidedVolume,
        is_snapshot: bool,
        origin: Option<&str>,
        name: Option<&str>,
    ) -> Result<Volume> {
        let info = VolumeInfo {
            id: id.clone(),
            kind: self.provider.kind().to_string(),
            location: pv.location.clone(),
            is_snapshot,
            origin: origin.map(|s| s.to_string()),
            created_at: now_secs(),
        };
        let record = VolumeRecord {
            info: info.clone(),
            state: pv.state.clone(),
        };

        let committed = serde_json::to_vec(&record)
            .map_err(|e| anyhow!("encode volume record {}: {}", id, e))
            .and_then(|raw| {
                let mut txn = Txn::new();
                txn.put(BUCKET_VOLUMES, id.as_bytes(), raw);
                if let Some(name) = name {
                    txn.put(BUCKET_NAMES, name.as_bytes(), id.as_bytes().to_vec());
                }
                match inner.store.as_mut() {
                    Some(store) => store.commit(txn),
                    None => Err(anyhow!("store is closed")),
                }
            });
        if let Err(e) = committed {
            self.discard(&id, &pv, is_snapshot, origin);
            return Err(VolumeError::Store(e));
        }

        let vol = Volume::new(info, Arc::clone(&self.provider));
        inner.volumes.insert(id.clone(), vol.clone());
        if let Some(name) = name {
            inner.names.insert(name.to_string(), id);
        }
        Ok(vol)
    }

    /// Best-effort destroy of storage that never made it into the store.
    fn discard(&self, id: &str, pv: &ProvidedVolume, is_snapshot: bool, origin: Option<&str>) {
        let info = VolumeInfo {
            id: id.to_string(),
            kind: self.provider.kind().to_string(),
            location: pv.location.clone(),
            is_snapshot,
            origin: origin.map(|s| s.to_string()),
            created_at: 0,
        };
        if let Err(e) = self.provider.destroy_volume(&info) {
            warn!("manager: failed to discard unregistered volume {}: {:#}", id, e);
        }
    }
}

type Loaded = (HashMap<String, (Volume, serde_json::Value)>, HashMap<String, String>);

fn load_registries(store: &Store, provider: &Arc<dyn Provider>) -> Result<Loaded> {
    let mut volumes = HashMap::new();
    for (key, raw) in store.entries(BUCKET_VOLUMES) {
        let id = String::from_utf8(key.to_vec())
            .map_err(|_| VolumeError::Open(anyhow!("non-utf8 volume id in store")))?;
        let record: VolumeRecord = serde_json::from_slice(raw)
            .map_err(|e| VolumeError::Open(anyhow!("decode volume record {}: {}", id, e)))?;
        if record.info.id != id {
            return Err(VolumeError::Open(anyhow!(
                "volume record key '{}' holds id '{}'",
                id,
                record.info.id
            )));
        }
        if record.info.kind != provider.kind() {
            return Err(VolumeError::Recovery {
                id,
                source: anyhow!(
                    "volume belongs to provider '{}', store provider is '{}'",
                    record.info.kind,
                    provider.kind()
                ),
            });
        }
        let vol = Volume::new(record.info, Arc::clone(provider));
        volumes.insert(id, (vol, record.state));
    }

    let mut names = HashMap::new();
    for (key, raw) in store.entries(BUCKET_NAMES) {
        let name = String::from_utf8(key.to_vec())
            .map_err(|_| VolumeError::Open(anyhow!("non-utf8 volume name in store")))?;
        let id = String::from_utf8(raw.to_vec())
            .map_err(|_| VolumeError::Open(anyhow!("non-utf8 id bound to name '{}'", name)))?;
        if !volumes.contains_key(&id) {
            return Err(VolumeError::Open(anyhow!(
                "name '{}' is bound to unknown volume '{}'",
                name,
                id
            )));
        }
        names.insert(name, id);
    }

    Ok((volumes, names))
}
