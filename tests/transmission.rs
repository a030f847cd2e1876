use anyhow::Result;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quivervol::provider::diff::{DiffEntry, DiffReader, DiffWriter};
use quivervol::{FsProvider, FsProviderConfig, Manager, ManagerConfig, Provider, VolumeError};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("qv-{}-{}-{}", prefix, pid, t))
}

fn open(root: &Path, cfg: ManagerConfig) -> Result<Manager> {
    let prov = root.join("provider");
    let m = Manager::open_with_config(root.join("volumes.db"), cfg, move || {
        let p = FsProvider::create(FsProviderConfig::new(&prov))?;
        Ok(Arc::new(p) as Arc<dyn Provider>)
    })?;
    Ok(m)
}

/// Все записи потока (без данных файлов).
fn stream_entries(bytes: &[u8]) -> Result<Vec<DiffEntry>> {
    let mut r = DiffReader::new(Cursor::new(bytes))?;
    let mut out = Vec::new();
    loop {
        let e = r.next_entry()?;
        if let DiffEntry::File { .. } = e {
            r.read_file_data(&mut std::io::sink())?;
        }
        let end = matches!(e, DiffEntry::End { .. });
        out.push(e);
        if end {
            return Ok(out);
        }
    }
}

/// Дерево каталога как отсортированный список (путь, содержимое); каталоги с пустым содержимым.
fn tree(dir: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(base)?
                .to_string_lossy()
                .replace('\\', "/");
            if entry.file_type()?.is_dir() {
                out.push((format!("{}/", rel), Vec::new()));
                walk(base, &entry.path(), out)?;
            } else {
                out.push((rel, fs::read(entry.path())?));
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

#[test]
fn fresh_volume_has_no_haves() -> Result<()> {
    init_logs();
    let root = unique_root("haves");
    let m = open(&root, ManagerConfig::default())?;
    let v = m.new_volume()?;
    assert!(m.list_haves(v.id())?.is_empty());

    fs::write(v.location().join("alpha"), b"alpha")?;
    assert_eq!(m.list_haves(v.id())?.len(), 1);

    assert!(m.list_haves("no-such-volume").unwrap_err().is_not_found());
    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn full_send_reproduces_snapshot() -> Result<()> {
    init_logs();
    let root = unique_root("full");
    let m = open(&root, ManagerConfig::default())?;

    let v = m.new_volume()?;
    fs::create_dir_all(v.location().join("a").join("b"))?;
    fs::write(v.location().join("alpha"), b"alpha")?;
    fs::write(v.location().join("a").join("b").join("deep"), vec![0x5Au8; 200_000])?;
    fs::create_dir_all(v.location().join("empty"))?;
    let snap = m.create_snapshot(v.id())?;

    let v2 = m.new_volume()?;
    let mut buf = Vec::new();
    m.send_snapshot(snap.id(), &m.list_haves(v2.id())?, &mut buf)?;
    let got = m.receive_snapshot(v2.id(), &mut buf.as_slice())?;

    assert!(got.is_snapshot());
    assert_eq!(tree(got.location())?, tree(snap.location())?);
    assert_eq!(got.origin(), Some(v2.id()));
    // target - только база, сам он не меняется
    assert!(tree(v2.location())?.is_empty());
    assert_eq!(m.volumes()?.len(), 4);

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn incremental_send_skips_what_receiver_has() -> Result<()> {
    init_logs();
    let root = unique_root("incr");
    let m = open(&root, ManagerConfig::default())?;

    let v = m.new_volume()?;
    fs::write(v.location().join("same"), vec![1u8; 64 * 1024])?;
    fs::write(v.location().join("changed"), b"v1")?;
    fs::write(v.location().join("removed"), b"bye")?;
    let snap1 = m.create_snapshot(v.id())?;

    let v2 = m.new_volume()?;
    let mut full = Vec::new();
    m.send_snapshot(snap1.id(), &m.list_haves(v2.id())?, &mut full)?;
    let got1 = m.receive_snapshot(v2.id(), &mut full.as_slice())?;

    fs::write(v.location().join("changed"), b"v2")?;
    fs::remove_file(v.location().join("removed"))?;
    fs::write(v.location().join("added"), b"new")?;
    let snap2 = m.create_snapshot(v.id())?;

    // следующий шаг строится против последнего принятого снапшота
    let haves = m.list_haves(got1.id())?;
    assert_eq!(haves.len(), 3);
    let mut incr = Vec::new();
    m.send_snapshot(snap2.id(), &haves, &mut incr)?;

    let entries = stream_entries(&incr)?;
    let kept: Vec<&str> = entries
        .iter()
        .filter_map(|e| match e {
            DiffEntry::Keep { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(kept, vec!["same"]);
    assert!(incr.len() < full.len(), "incremental stream must be smaller");

    let got = m.receive_snapshot(got1.id(), &mut incr.as_slice())?;
    assert_eq!(tree(got.location())?, tree(snap2.location())?);
    assert_eq!(tree(got1.location())?, tree(snap1.location())?);
    assert!(!got.location().join("removed").exists());
    assert_eq!(fs::read(got.location().join("changed"))?, b"v2");

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn compressed_stream_is_self_describing() -> Result<()> {
    init_logs();
    let root = unique_root("zstd");
    let m = open(&root, ManagerConfig::default().with_diff_compress(true))?;

    let v = m.new_volume()?;
    fs::write(v.location().join("text"), "lorem ipsum ".repeat(10_000))?;
    let snap = m.create_snapshot(v.id())?;

    let mut buf = Vec::new();
    m.send_snapshot(snap.id(), &Default::default(), &mut buf)?;
    assert!(DiffReader::new(Cursor::new(&buf))?.is_compressed());
    assert!(buf.len() < 120_000 / 4);

    let v2 = m.new_volume()?;
    let got = m.receive_snapshot(v2.id(), &mut buf.as_slice())?;
    assert_eq!(tree(got.location())?, tree(snap.location())?);

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn bad_streams_are_protocol_errors_and_change_nothing() -> Result<()> {
    init_logs();
    let root = unique_root("proto");
    let m = open(&root, ManagerConfig::default())?;

    let v = m.new_volume()?;
    fs::write(v.location().join("alpha"), vec![7u8; 10_000])?;
    let snap = m.create_snapshot(v.id())?;
    let mut good = Vec::new();
    m.send_snapshot(snap.id(), &Default::default(), &mut good)?;

    let target = m.new_volume()?;
    fs::write(target.location().join("mine"), b"untouched")?;
    let before = tree(target.location())?;
    let count = m.volumes()?.len();

    let mut flipped = good.clone();
    let mid = flipped.len() / 2;
    flipped[mid] ^= 0xFF;
    let mut trailing = good.clone();
    trailing.extend_from_slice(b"junk");

    let cases: Vec<(&str, Vec<u8>)> = vec![
        ("empty", Vec::new()),
        ("garbage", b"definitely not a diff stream".to_vec()),
        ("truncated", good[..good.len() - 1].to_vec()),
        ("flipped", flipped),
        ("trailing", trailing),
    ];
    for (what, bytes) in cases {
        let err = m
            .receive_snapshot(target.id(), &mut bytes.as_slice())
            .unwrap_err();
        assert!(err.is_protocol(), "{}: {}", what, err);
        assert_eq!(tree(target.location())?, before, "{}: target changed", what);
        assert_eq!(m.volumes()?.len(), count, "{}: volume registered", what);
    }

    // поток, посчитанный против чужой базы
    let base = m.new_volume()?;
    fs::write(base.location().join("alpha"), vec![7u8; 10_000])?;
    let mut against_base = Vec::new();
    m.send_snapshot(snap.id(), &m.list_haves(base.id())?, &mut against_base)?;
    let err = m
        .receive_snapshot(target.id(), &mut against_base.as_slice())
        .unwrap_err();
    assert!(err.is_protocol(), "{}", err);
    assert_eq!(tree(target.location())?, before);

    // а к своей базе он применяется
    m.receive_snapshot(base.id(), &mut against_base.as_slice())?;

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn send_and_receive_check_ids() -> Result<()> {
    init_logs();
    let root = unique_root("ids");
    let m = open(&root, ManagerConfig::default())?;
    let v = m.new_volume()?;

    let mut sink = Vec::new();
    let err = m.send_snapshot("nope", &Default::default(), &mut sink).unwrap_err();
    assert!(err.is_not_found());
    // живой том - не снапшот
    let err = m.send_snapshot(v.id(), &Default::default(), &mut sink).unwrap_err();
    assert!(matches!(err, VolumeError::NotFound(_)));
    assert!(sink.is_empty());

    let err = m.receive_snapshot("nope", &mut std::io::empty()).unwrap_err();
    assert!(err.is_not_found());

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn stream_cannot_write_through_links_or_files() -> Result<()> {
    init_logs();
    let root = unique_root("escape");
    let m = open(&root, ManagerConfig::default())?;
    let outside = root.join("outside");
    fs::create_dir_all(&outside)?;

    let target = m.new_volume()?;
    fs::write(target.location().join("mine"), b"mine")?;
    let before = tree(target.location())?;
    let count = m.volumes()?.len();

    // ссылка наружу, потом файл "под" ней
    let mut via_link = Vec::new();
    {
        let mut w = DiffWriter::new(&mut via_link, false, 4096)?;
        w.link("l", &outside.to_string_lossy())?;
        w.file("l/evil", 0o644, 5, &mut &b"pwned"[..])?;
        w.finish()?;
    }
    // каталог под обычным файлом
    let mut via_file = Vec::new();
    {
        let mut w = DiffWriter::new(&mut via_file, false, 4096)?;
        w.file("f", 0o644, 1, &mut &b"x"[..])?;
        w.dir("f/sub", 0o755)?;
        w.finish()?;
    }

    for (what, bytes) in [("link", via_link), ("file", via_file)] {
        let err = m
            .receive_snapshot(target.id(), &mut bytes.as_slice())
            .unwrap_err();
        assert!(err.is_protocol(), "{}: {}", what, err);
        assert!(tree(&outside)?.is_empty(), "{}: wrote outside the volume", what);
        assert_eq!(tree(target.location())?, before, "{}: target changed", what);
        assert_eq!(m.volumes()?.len(), count, "{}: volume registered", what);
    }

    // ссылка сама по себе допустима
    let mut link_only = Vec::new();
    {
        let mut w = DiffWriter::new(&mut link_only, false, 4096)?;
        w.link("l", &outside.to_string_lossy())?;
        w.finish()?;
    }
    let got = m.receive_snapshot(target.id(), &mut link_only.as_slice())?;
    assert_eq!(fs::read_link(got.location().join("l"))?, outside);

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn incremental_receive_reproduces_file_modes() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    init_logs();
    let root = unique_root("modes");
    let m = open(&root, ManagerConfig::default())?;
    let mode = |p: &Path| -> Result<u32> { Ok(fs::metadata(p)?.permissions().mode() & 0o7777) };

    let v = m.new_volume()?;
    let tool = v.location().join("tool");
    fs::write(&tool, b"#!/bin/sh\n")?;
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755))?;
    fs::write(v.location().join("plain"), b"plain")?;
    fs::set_permissions(v.location().join("plain"), fs::Permissions::from_mode(0o644))?;
    let snap = m.create_snapshot(v.id())?;

    // те же байты, другие права
    let v2 = m.new_volume()?;
    fs::write(v2.location().join("tool"), b"#!/bin/sh\n")?;
    fs::set_permissions(v2.location().join("tool"), fs::Permissions::from_mode(0o600))?;
    fs::write(v2.location().join("plain"), b"plain")?;
    fs::set_permissions(v2.location().join("plain"), fs::Permissions::from_mode(0o644))?;

    let mut buf = Vec::new();
    m.send_snapshot(snap.id(), &m.list_haves(v2.id())?, &mut buf)?;
    let kept: Vec<String> = stream_entries(&buf)?
        .into_iter()
        .filter_map(|e| match e {
            DiffEntry::Keep { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(kept, vec!["plain".to_string()]);

    let got = m.receive_snapshot(v2.id(), &mut buf.as_slice())?;
    assert_eq!(mode(&got.location().join("tool"))?, 0o755);
    assert_eq!(mode(&got.location().join("plain"))?, 0o644);
    assert_eq!(mode(&v2.location().join("tool"))?, 0o600);

    fs::remove_dir_all(&root)?;
    Ok(())
}

/// Отдаёт поток и на его исходе вызывает `at_end` (один раз).
struct HookAtEnd<'a, F: FnMut()> {
    data: &'a [u8],
    at_end: Option<F>,
}

impl<'a, F: FnMut()> Read for HookAtEnd<'a, F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.data.read(buf)?;
        if n == 0 {
            if let Some(mut f) = self.at_end.take() {
                f();
            }
        }
        Ok(n)
    }
}

#[test]
fn close_during_receive_rolls_back() -> Result<()> {
    init_logs();
    let root = unique_root("recv-close");
    let store = root.join("volumes.db");
    let prov = root.join("provider");
    let m = open(&root, ManagerConfig::default())?;

    let v = m.new_volume()?;
    fs::write(v.location().join("alpha"), b"new content")?;
    let snap = m.create_snapshot(v.id())?;
    let target = m.new_volume()?;
    fs::write(target.location().join("alpha"), b"old content")?;
    let before = tree(target.location())?;

    let mut buf = Vec::new();
    m.send_snapshot(snap.id(), &Default::default(), &mut buf)?;

    let mut input = HookAtEnd {
        data: &buf,
        at_end: Some(|| {
            m.close().expect("close mid-receive");
        }),
    };
    let err = m.receive_snapshot(target.id(), &mut input).unwrap_err();
    assert!(err.is_closed(), "{}", err);
    assert_eq!(tree(target.location())?, before);
    // ни одного лишнего каталога у провайдера
    assert_eq!(fs::read_dir(prov.join("mnt"))?.count(), 3);
    drop(m);

    let m = Manager::open_with_config(&store, ManagerConfig::default(), || {
        panic!("provider factory must not run against an initialized store")
    })?;
    assert_eq!(m.volumes()?.len(), 3);
    assert_eq!(tree(m.volume(target.id())?.location())?, before);

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn target_cannot_be_destroyed_while_receiving() -> Result<()> {
    init_logs();
    let root = unique_root("recv-destroy");
    let m = open(&root, ManagerConfig::default())?;

    let v = m.new_volume()?;
    fs::write(v.location().join("alpha"), b"alpha")?;
    let snap = m.create_snapshot(v.id())?;
    let target = m.new_volume()?;

    let mut buf = Vec::new();
    m.send_snapshot(snap.id(), &Default::default(), &mut buf)?;

    let mut refused = None;
    let mut input = HookAtEnd {
        data: &buf,
        at_end: Some(|| refused = Some(m.destroy_volume(target.id()))),
    };
    let got = m.receive_snapshot(target.id(), &mut input)?;
    match refused {
        Some(Err(VolumeError::Conflict(_))) => {}
        Some(Err(other)) => panic!("unexpected error: {}", other),
        Some(Ok(())) => panic!("destroy must be refused while receiving"),
        None => panic!("hook did not run"),
    }
    assert!(target.location().is_dir());
    assert_eq!(fs::read(got.location().join("alpha"))?, b"alpha");

    // после receive уничтожение снова разрешено
    m.destroy_volume(target.id())?;

    fs::remove_dir_all(&root)?;
    Ok(())
}
