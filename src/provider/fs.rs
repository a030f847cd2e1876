//! FsProvider - тома как каталоги на локальной ФС.
//!
//! Раскладка <root>:
//!   mnt/<id>/      - Location тома (живое содержимое)
//!   pool/<id>/     - припаркованное содержимое после export (аналог zpool export)
//!   staging/<id>/  - рабочая копия при receive, после END переезжает в mnt/<id>
//!   .provider      - маркер first-time setup (JSON конфига)
//!
//! Политика:
//! - create(): first-time setup, создаёт раскладку и маркер.
//! - from_bootstrap(): только реконструкция; без маркера - ошибка, ничего не создаёт.
//! - export(root): переносит содержимое всех mnt/<id> в pool/<id>, каталоги mnt/<id> остаются пустыми.
//! - reattach(): возвращает припаркованное содержимое на место.
//! - Снапшот и fork - полные копии; снапшот снапшота запрещён.
//! - Haves: по маркеру на обычный файл, sha256(path || 0 || mode || content).
//! - Receive не трогает target: результат собирается в staging и становится новым томом.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::FsProviderConfig;
use crate::consts::{
    FS_MNT_DIR, FS_POOL_DIR, FS_PROVIDER_KIND, FS_PROVIDER_MARKER, FS_STAGING_DIR,
};
use crate::metrics::record_diff_entry_kept;
use crate::provider::diff::{DiffEntry, DiffError, DiffReader, DiffWriter};
use crate::provider::{BootstrapRecord, Haves, Marker, ProvidedVolume, Provider, SendOptions};
use crate::util::{
    copy_tree, dir_is_empty, fsync_dir, move_children, remove_tree_if_exists, to_hex,
};
use crate::volume::VolumeInfo;

pub struct FsProvider {
    cfg: FsProviderConfig,
    mnt: PathBuf,
    pool: PathBuf,
    staging: PathBuf,
}

impl FsProvider {
    /// First-time setup: create the layout under `cfg.root`.
    pub fn create(cfg: FsProviderConfig) -> Result<Self> {
        let p = Self::layout(cfg);
        for d in [&p.cfg.root, &p.mnt, &p.pool, &p.staging] {
            fs::create_dir_all(d).with_context(|| format!("create {}", d.display()))?;
        }
        let marker = p.cfg.root.join(FS_PROVIDER_MARKER);
        if !marker.exists() {
            let body = serde_json::to_vec_pretty(&p.cfg).context("serialize provider config")?;
            fs::write(&marker, body).with_context(|| format!("write {}", marker.display()))?;
        }
        info!("fs provider: initialized at {}", p.cfg.root.display());
        Ok(p)
    }

    /// Reconstruct from a bootstrap record. Never creates anything.
    pub fn from_bootstrap(record: &BootstrapRecord) -> Result<Self> {
        if record.kind != FS_PROVIDER_KIND {
            return Err(anyhow!(
                "bootstrap kind '{}' is not '{}'",
                record.kind,
                FS_PROVIDER_KIND
            ));
        }
        let cfg: FsProviderConfig = serde_json::from_value(record.config.clone())
            .context("parse fs provider config")?;
        Self::open_existing(cfg)
    }

    /// Attach to a layout previously made by `create`.
    pub fn open_existing(cfg: FsProviderConfig) -> Result<Self> {
        let p = Self::layout(cfg);
        let marker = p.cfg.root.join(FS_PROVIDER_MARKER);
        if !marker.is_file() {
            return Err(anyhow!(
                "no fs provider at {} (missing {})",
                p.cfg.root.display(),
                FS_PROVIDER_MARKER
            ));
        }
        for d in [&p.mnt, &p.pool] {
            if !d.is_dir() {
                return Err(anyhow!("fs provider layout broken: {} missing", d.display()));
            }
        }
        // staging - временный: остатки прерванного receive не нужны
        remove_tree_if_exists(&p.staging)?;
        fs::create_dir_all(&p.staging)
            .with_context(|| format!("create {}", p.staging.display()))?;
        debug!("fs provider: reopened at {}", p.cfg.root.display());
        Ok(p)
    }

    fn layout(cfg: FsProviderConfig) -> Self {
        let mnt = cfg.root.join(FS_MNT_DIR);
        let pool = cfg.root.join(FS_POOL_DIR);
        let staging = cfg.root.join(FS_STAGING_DIR);
        Self {
            cfg,
            mnt,
            pool,
            staging,
        }
    }

    pub fn root(&self) -> &Path {
        &self.cfg.root
    }

    pub fn config(&self) -> &FsProviderConfig {
        &self.cfg
    }

    /// Park the content of every location (host-shutdown emulation).
    /// Returns the number of volumes parked.
    pub fn export(root: &Path) -> Result<usize> {
        let mnt = root.join(FS_MNT_DIR);
        let pool = root.join(FS_POOL_DIR);
        let mut parked = 0usize;
        for entry in fs::read_dir(&mnt).with_context(|| format!("read_dir {}", mnt.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let loc = entry.path();
            if dir_is_empty(&loc)? {
                continue;
            }
            move_children(&loc, &pool.join(entry.file_name()))?;
            parked += 1;
        }
        info!("fs provider: exported {} volume(s) from {}", parked, root.display());
        Ok(parked)
    }

    fn location_of(&self, id: &str) -> PathBuf {
        self.mnt.join(id)
    }

    fn parked_of(&self, id: &str) -> PathBuf {
        self.pool.join(id)
    }

    fn state_for(&self, id: &str) -> serde_json::Value {
        serde_json::json!({ "parked": format!("{}/{}", FS_POOL_DIR, id) })
    }

    fn provided(&self, id: &str) -> ProvidedVolume {
        ProvidedVolume {
            location: self.location_of(id),
            state: self.state_for(id),
        }
    }

    fn ensure_live(&self, info: &VolumeInfo) -> Result<()> {
        if !info.location.is_dir() {
            return Err(anyhow!(
                "volume {} is not accessible at {}",
                info.id,
                info.location.display()
            ));
        }
        Ok(())
    }

    /// Full copy of `src` as a new volume `id`; partial copies are removed on failure.
    fn clone_into(&self, src: &VolumeInfo, id: &str) -> Result<ProvidedVolume> {
        self.ensure_live(src)?;
        let dst = self.location_of(id);
        if dst.exists() {
            return Err(anyhow!("location {} already exists", dst.display()));
        }
        if let Err(e) = copy_tree(&src.location, &dst) {
            let _ = remove_tree_if_exists(&dst);
            return Err(e.context(format!("copy volume {} -> {}", src.id, id)));
        }
        Ok(self.provided(id))
    }

    fn apply_stream(&self, staging: &Path, input: &mut dyn Read) -> Result<()> {
        let mut reader = DiffReader::new(input)?;
        let mut seen: HashSet<String> = HashSet::new();
        // режимы каталогов - в конце, иначе 0o555 не даст писать внутрь
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

        loop {
            let entry = reader.next_entry()?;
            if let Some(path) = entry.path() {
                ensure_real_parents(staging, path)?;
                remember_with_ancestors(&mut seen, path);
            }
            match entry {
                DiffEntry::Dir { path, mode } => {
                    let p = staging.join(&path);
                    if p.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
                        fs::remove_file(&p).with_context(|| format!("replace {}", p.display()))?;
                    }
                    fs::create_dir_all(&p).with_context(|| format!("create {}", p.display()))?;
                    dir_modes.push((p, mode));
                }
                DiffEntry::File { path, mode, .. } => {
                    let p = staging.join(&path);
                    clear_slot(&p)?;
                    if let Some(parent) = p.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut f = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(&p)
                        .with_context(|| format!("open {}", p.display()))?;
                    reader.read_file_data(&mut f)?;
                    f.sync_all().with_context(|| format!("fsync {}", p.display()))?;
                    drop(f);
                    apply_mode(&p, mode)?;
                }
                DiffEntry::Link { path, target } => {
                    let p = staging.join(&path);
                    clear_slot(&p)?;
                    if let Some(parent) = p.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    make_symlink(&target, &p)?;
                }
                DiffEntry::Keep { path, marker } => {
                    let p = staging.join(&path);
                    let ok = match p.symlink_metadata() {
                        Ok(m) if m.is_file() => file_marker(&path, &p, mode_of(&m))? == marker,
                        _ => false,
                    };
                    if !ok {
                        return Err(anyhow::Error::new(DiffError::Mismatch(format!(
                            "'{}' is not present with the expected content",
                            path
                        ))));
                    }
                }
                DiffEntry::End { entries, bytes } => {
                    debug!("fs provider: stream end, entries={}, bytes={}", entries, bytes);
                    break;
                }
            }
        }

        prune_unseen(staging, "", &seen)?;
        for (p, mode) in dir_modes.into_iter().rev() {
            // каталог мог быть заменён ссылкой более поздней записью
            if p.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
                apply_mode(&p, mode)?;
            }
        }
        Ok(())
    }
}

/// Every existing ancestor of `rel` under `root` must be a real directory,
/// otherwise writes would follow a symlink out of the tree.
fn ensure_real_parents(root: &Path, rel: &str) -> Result<()> {
    let mut cur = root.to_path_buf();
    let mut parts = rel.split('/').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            break;
        }
        cur.push(part);
        match cur.symlink_metadata() {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                return Err(anyhow::Error::new(DiffError::BadPath(format!(
                    "{} (ancestor '{}' is not a directory)",
                    rel, part
                ))))
            }
            // дальше ничего нет, create_dir_all создаст настоящие каталоги
            Err(_) => break,
        }
    }
    Ok(())
}

/// Путь и все его родители - чтобы prune не удалил неявно созданные каталоги.
fn remember_with_ancestors(seen: &mut HashSet<String>, path: &str) {
    let mut cur = path;
    while seen.insert(cur.to_string()) {
        match cur.rfind('/') {
            Some(i) => cur = &cur[..i],
            None => break,
        }
    }
}

fn prune_unseen(root: &Path, prefix: &str, seen: &HashSet<String>) -> Result<()> {
    let dir = if prefix.is_empty() {
        root.to_path_buf()
    } else {
        root.join(prefix)
    };
    for entry in fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let entry = entry?;
        let name = utf8_name(&entry.path(), &entry.file_name())?;
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let ft = entry.file_type()?;
        if !seen.contains(&rel) {
            if ft.is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            }
            .with_context(|| format!("remove {}", entry.path().display()))?;
        } else if ft.is_dir() {
            prune_unseen(root, &rel, seen)?;
        }
    }
    Ok(())
}

fn clear_slot(p: &Path) -> Result<()> {
    match p.symlink_metadata() {
        Ok(m) if m.is_dir() => remove_tree_if_exists(p),
        Ok(_) => fs::remove_file(p).with_context(|| format!("remove {}", p.display())),
        Err(_) => Ok(()),
    }
}

fn utf8_name(full: &Path, name: &std::ffi::OsStr) -> Result<String> {
    name.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("non-utf8 file name at {}", full.display()))
}

/// Marker for a regular file at relative `rel`: path, mode and content.
fn file_marker(rel: &str, abs: &Path, mode: u32) -> Result<Marker> {
    let mut f = File::open(abs).with_context(|| format!("open {}", abs.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(rel.as_bytes());
    hasher.update([0u8]);
    hasher.update(mode.to_le_bytes());
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).with_context(|| format!("read {}", abs.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Marker(to_hex(&hasher.finalize())))
}

enum Node {
    Dir { rel: String, mode: u32 },
    File { rel: String, abs: PathBuf, mode: u32 },
    Link { rel: String, target: String },
}

/// Pre-order walk, names sorted - родители всегда раньше детей.
fn walk(root: &Path, prefix: &str, out: &mut Vec<Node>) -> Result<()> {
    let dir = if prefix.is_empty() {
        root.to_path_buf()
    } else {
        root.join(prefix)
    };
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(&dir)
        .with_context(|| format!("read_dir {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let abs = entry.path();
        let name = utf8_name(&abs, &entry.file_name())?;
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let md = fs::symlink_metadata(&abs).with_context(|| format!("stat {}", abs.display()))?;
        let ft = md.file_type();
        if ft.is_dir() {
            out.push(Node::Dir {
                rel: rel.clone(),
                mode: mode_of(&md),
            });
            walk(root, &rel, out)?;
        } else if ft.is_file() {
            out.push(Node::File {
                rel,
                abs,
                mode: mode_of(&md),
            });
        } else if ft.is_symlink() {
            let target = fs::read_link(&abs).with_context(|| format!("readlink {}", abs.display()))?;
            let target = target
                .to_str()
                .ok_or_else(|| anyhow!("non-utf8 symlink target at {}", abs.display()))?
                .to_string();
            out.push(Node::Link { rel, target });
        } else {
            warn!("fs provider: skipping special file {}", abs.display());
        }
    }
    Ok(())
}

#[cfg(unix)]
fn mode_of(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o7777
}
#[cfg(not(unix))]
fn mode_of(md: &fs::Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else if md.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn apply_mode(p: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(p, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, p.display()))
}
#[cfg(not(unix))]
fn apply_mode(p: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(p)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(p, perms).with_context(|| format!("set permissions {}", p.display()))
}

#[cfg(unix)]
fn make_symlink(target: &str, p: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, p)
        .with_context(|| format!("symlink {} -> {}", p.display(), target))
}
#[cfg(not(unix))]
fn make_symlink(target: &str, p: &Path) -> Result<()> {
    Err(anyhow!("symlinks are not supported here: {} -> {}", p.display(), target))
}

impl Provider for FsProvider {
    fn kind(&self) -> &str {
        FS_PROVIDER_KIND
    }

    fn bootstrap(&self) -> Result<BootstrapRecord> {
        Ok(BootstrapRecord {
            kind: FS_PROVIDER_KIND.to_string(),
            config: serde_json::to_value(&self.cfg).context("serialize fs provider config")?,
        })
    }

    fn new_volume(&self, id: &str) -> Result<ProvidedVolume> {
        let loc = self.location_of(id);
        if loc.exists() {
            return Err(anyhow!("location {} already exists", loc.display()));
        }
        fs::create_dir_all(&loc).with_context(|| format!("create {}", loc.display()))?;
        debug!("fs provider: new volume {} at {}", id, loc.display());
        Ok(self.provided(id))
    }

    fn fork_volume(&self, base: &VolumeInfo, id: &str) -> Result<ProvidedVolume> {
        self.clone_into(base, id)
    }

    fn destroy_volume(&self, info: &VolumeInfo) -> Result<()> {
        remove_tree_if_exists(&info.location)?;
        remove_tree_if_exists(&self.parked_of(&info.id))?;
        debug!("fs provider: destroyed {}", info.id);
        Ok(())
    }

    fn create_snapshot(&self, source: &VolumeInfo, id: &str) -> Result<ProvidedVolume> {
        if source.is_snapshot {
            return Err(anyhow!("volume {} is a snapshot and cannot be snapshotted", source.id));
        }
        self.clone_into(source, id)
    }

    fn reattach(&self, info: &VolumeInfo, state: &serde_json::Value) -> Result<()> {
        let parked = match state.get("parked").and_then(|v| v.as_str()) {
            Some(rel) => self.cfg.root.join(rel),
            None => self.parked_of(&info.id),
        };
        let loc = &info.location;

        if parked.is_dir() {
            if loc.exists() && !dir_is_empty(loc)? {
                return Err(anyhow!(
                    "volume {} has both parked content ({}) and live content ({})",
                    info.id,
                    parked.display(),
                    loc.display()
                ));
            }
            let n = move_children(&parked, loc)?;
            fs::remove_dir(&parked).with_context(|| format!("remove {}", parked.display()))?;
            debug!("fs provider: reattached {} ({} entries) at {}", info.id, n, loc.display());
            return Ok(());
        }
        if loc.is_dir() {
            return Ok(());
        }
        Err(anyhow!(
            "storage for volume {} is gone (no {} and no {})",
            info.id,
            loc.display(),
            parked.display()
        ))
    }

    fn list_haves(&self, info: &VolumeInfo) -> Result<Haves> {
        self.ensure_live(info)?;
        let mut nodes = Vec::new();
        walk(&info.location, "", &mut nodes)?;
        let mut haves = Haves::new();
        for node in nodes {
            if let Node::File { rel, abs, mode } = node {
                haves.insert(file_marker(&rel, &abs, mode)?);
            }
        }
        Ok(haves)
    }

    fn send_snapshot(
        &self,
        snapshot: &VolumeInfo,
        haves: &Haves,
        out: &mut dyn Write,
        opts: &SendOptions,
    ) -> Result<u64> {
        self.ensure_live(snapshot)?;
        let mut nodes = Vec::new();
        walk(&snapshot.location, "", &mut nodes)?;

        let mut w = DiffWriter::new(out, opts.compress, opts.chunk_size)?;
        for node in nodes {
            match node {
                Node::Dir { rel, mode } => w.dir(&rel, mode)?,
                Node::Link { rel, target } => w.link(&rel, &target)?,
                Node::File { rel, abs, mode } => {
                    let marker = if haves.is_empty() {
                        None
                    } else {
                        Some(file_marker(&rel, &abs, mode)?)
                    };
                    match marker {
                        Some(m) if haves.contains(&m) => {
                            w.keep(&rel, &m)?;
                            record_diff_entry_kept();
                        }
                        _ => {
                            let mut f = File::open(&abs)
                                .with_context(|| format!("open {}", abs.display()))?;
                            let size = f.metadata()?.len();
                            w.file(&rel, mode, size, &mut f)?;
                        }
                    }
                }
            }
        }
        w.finish()
    }

    fn receive_snapshot(
        &self,
        target: &VolumeInfo,
        input: &mut dyn Read,
        id: &str,
    ) -> Result<ProvidedVolume> {
        self.ensure_live(target)?;
        let dst = self.location_of(id);
        if dst.exists() {
            return Err(anyhow!("location {} already exists", dst.display()));
        }
        let staging = self.staging.join(id);
        remove_tree_if_exists(&staging)?;

        // target только читается; результат - staging, который становится mnt/<id>
        let applied = copy_tree(&target.location, &staging)
            .with_context(|| format!("stage volume {}", target.id))
            .and_then(|_| self.apply_stream(&staging, input));
        if let Err(e) = applied {
            let _ = remove_tree_if_exists(&staging);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &dst) {
            let _ = remove_tree_if_exists(&staging);
            return Err(anyhow::Error::new(e).context(format!(
                "rename {} -> {}",
                staging.display(),
                dst.display()
            )));
        }
        fsync_dir(&dst).with_context(|| format!("fsync {}", self.mnt.display()))?;
        debug!("fs provider: received {} on top of {}", id, target.id);
        Ok(self.provided(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_nanos;

    fn unique_root(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("qv-fs-{}-{}-{}", prefix, std::process::id(), now_nanos()))
    }

    fn info_for(p: &FsProvider, id: &str, pv: &ProvidedVolume) -> VolumeInfo {
        VolumeInfo {
            id: id.to_string(),
            kind: p.kind().to_string(),
            location: pv.location.clone(),
            is_snapshot: false,
            origin: None,
            created_at: 0,
        }
    }

    #[test]
    fn bootstrap_requires_existing_layout() {
        let root = unique_root("boot");
        let rec = BootstrapRecord {
            kind: FS_PROVIDER_KIND.into(),
            config: serde_json::to_value(FsProviderConfig::new(&root)).unwrap(),
        };
        assert!(FsProvider::from_bootstrap(&rec).is_err());
        assert!(!root.exists(), "reconstruction must not create the layout");

        let p = FsProvider::create(FsProviderConfig::new(&root)).unwrap();
        assert_eq!(p.bootstrap().unwrap(), rec);
        let again = FsProvider::from_bootstrap(&rec).unwrap();
        assert_eq!(again.root(), root.as_path());
    }

    #[test]
    fn export_then_reattach_restores_content() {
        let root = unique_root("export");
        let p = FsProvider::create(FsProviderConfig::new(&root)).unwrap();
        let pv = p.new_volume("v1").unwrap();
        fs::write(pv.location.join("alpha"), b"a").unwrap();
        let info = info_for(&p, "v1", &pv);

        assert_eq!(FsProvider::export(&root).unwrap(), 1);
        assert!(pv.location.is_dir());
        assert!(!pv.location.join("alpha").exists());

        p.reattach(&info, &pv.state).unwrap();
        assert_eq!(fs::read(pv.location.join("alpha")).unwrap(), b"a");
        // повторный reattach - no-op
        p.reattach(&info, &pv.state).unwrap();

        p.destroy_volume(&info).unwrap();
        assert!(!pv.location.exists());
        assert!(p.reattach(&info, &pv.state).is_err());
    }

    #[test]
    fn incremental_send_keeps_known_files_and_prunes_extras() {
        let root = unique_root("send");
        let p = FsProvider::create(FsProviderConfig::new(&root)).unwrap();

        let src = p.new_volume("src").unwrap();
        fs::create_dir_all(src.location.join("d")).unwrap();
        fs::write(src.location.join("same"), b"shared").unwrap();
        fs::write(src.location.join("d").join("new"), b"fresh").unwrap();
        let src_info = info_for(&p, "src", &src);
        let snap = p.create_snapshot(&src_info, "snap").unwrap();
        let snap_info = VolumeInfo {
            is_snapshot: true,
            ..info_for(&p, "snap", &snap)
        };

        let dst = p.new_volume("dst").unwrap();
        fs::write(dst.location.join("same"), b"shared").unwrap();
        fs::write(dst.location.join("stale"), b"old").unwrap();
        let dst_info = info_for(&p, "dst", &dst);

        let haves = p.list_haves(&dst_info).unwrap();
        assert_eq!(haves.len(), 2);

        let mut buf = Vec::new();
        p.send_snapshot(&snap_info, &haves, &mut buf, &SendOptions::default())
            .unwrap();
        // "shared" ушёл как KEEP, его содержимого в потоке нет
        assert!(!buf.windows(6).any(|w| w == b"shared"));

        let got = p.receive_snapshot(&dst_info, &mut buf.as_slice(), "recv").unwrap();
        assert_eq!(fs::read(got.location.join("same")).unwrap(), b"shared");
        assert_eq!(fs::read(got.location.join("d").join("new")).unwrap(), b"fresh");
        assert!(!got.location.join("stale").exists());
        // сам target не меняется
        assert_eq!(fs::read(dst.location.join("stale")).unwrap(), b"old");
        assert!(!dst.location.join("d").exists());
        assert!(!p.staging.join("recv").exists());
    }

    #[test]
    fn bad_stream_leaves_target_untouched() {
        let root = unique_root("bad");
        let p = FsProvider::create(FsProviderConfig::new(&root)).unwrap();
        let src = p.new_volume("src").unwrap();
        fs::write(src.location.join("f"), b"payload").unwrap();
        let src_info = info_for(&p, "src", &src);

        let dst = p.new_volume("dst").unwrap();
        fs::write(dst.location.join("mine"), b"keep me").unwrap();
        let dst_info = info_for(&p, "dst", &dst);

        let mut buf = Vec::new();
        p.send_snapshot(&src_info, &Haves::new(), &mut buf, &SendOptions::default())
            .unwrap();
        buf.truncate(buf.len() - 3);

        let err = p
            .receive_snapshot(&dst_info, &mut buf.as_slice(), "recv")
            .err()
            .unwrap();
        assert!(err.downcast_ref::<DiffError>().is_some(), "{:#}", err);
        assert_eq!(fs::read(dst.location.join("mine")).unwrap(), b"keep me");
        assert!(!dst.location.join("f").exists());
        assert!(!p.location_of("recv").exists());
        assert!(!p.staging.join("recv").exists());
    }

    #[test]
    fn keep_for_missing_file_does_not_apply() {
        let root = unique_root("keep");
        let p = FsProvider::create(FsProviderConfig::new(&root)).unwrap();
        let src = p.new_volume("src").unwrap();
        fs::write(src.location.join("f"), b"x").unwrap();
        let src_info = info_for(&p, "src", &src);
        let haves = p.list_haves(&src_info).unwrap();

        // haves от src, а применяем к пустому тому
        let mut buf = Vec::new();
        p.send_snapshot(&src_info, &haves, &mut buf, &SendOptions::default())
            .unwrap();
        let empty = p.new_volume("empty").unwrap();
        let err = p
            .receive_snapshot(&info_for(&p, "empty", &empty), &mut buf.as_slice(), "r")
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<DiffError>(),
            Some(DiffError::Mismatch(_))
        ));
    }
}
