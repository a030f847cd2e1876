//! diff - самоописывающий поток различий между снапшотом и базой получателя.
//!
//! Формат (LE):
//!   header(12) = [MAGIC8 "QVDIFF01"][ver u16 = 1][flags u16]   flags bit0 = zstd chunks
//!   frame      = [tag u8][len u32][crc32 u32] + payload[len]   crc по tag+len+payload
//!
//! Кадры:
//!   DIR   (path, mode u32)
//!   FILE  (path, mode u32, size u64) + CHUNK-кадры, пока не набрано size байт
//!   CHUNK raw | [raw_len u32] + zstd
//!   LINK  (path, target)
//!   KEEP  (path, marker)          - у получателя уже есть этот файл с этим содержимым
//!   END   (entries u64, bytes u64) - обязательный, после него - EOF
//!
//! Строки: [len u32] + utf-8. Пути относительные, через '/', без пустых, "." и ".." компонент.
//! Отсутствие END (оборванный поток) - всегда ошибка.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::consts::{
    DIFF_CHUNK_MAX, DIFF_CHUNK_MIN, DIFF_FLAG_ZSTD, DIFF_FRAME_HDR_SIZE, DIFF_HDR_SIZE,
    DIFF_MAGIC, DIFF_MAX_FRAME, DIFF_TAG_CHUNK, DIFF_TAG_DIR, DIFF_TAG_END, DIFF_TAG_FILE,
    DIFF_TAG_KEEP, DIFF_TAG_LINK, DIFF_VERSION,
};
use crate::provider::Marker;

const ZSTD_LEVEL: i32 = 3;

/// Stream-shape failures. Anything of this type is a protocol violation.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("bad stream magic {0:?}")]
    BadMagic([u8; 8]),
    #[error("unsupported stream version {0}")]
    Version(u16),
    #[error("unknown stream flags {0:#x}")]
    Flags(u16),
    #[error("unknown frame tag {0:#x}")]
    UnknownTag(u8),
    #[error("frame crc mismatch (tag {0:#x})")]
    Crc(u8),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("truncated stream: {0}")]
    Truncated(&'static str),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid path in stream: {0:?}")]
    BadPath(String),
    #[error("stream does not apply: {0}")]
    Mismatch(String),
    #[error("trailing bytes after end of stream")]
    Trailing,
}

impl DiffError {
    fn into_anyhow(self) -> anyhow::Error {
        anyhow::Error::new(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    Dir { path: String, mode: u32 },
    /// File content follows; consume it with `DiffReader::read_file_data`.
    File { path: String, mode: u32, size: u64 },
    Link { path: String, target: String },
    Keep { path: String, marker: Marker },
    End { entries: u64, bytes: u64 },
}

impl DiffEntry {
    pub fn path(&self) -> Option<&str> {
        match self {
            DiffEntry::Dir { path, .. }
            | DiffEntry::File { path, .. }
            | DiffEntry::Link { path, .. }
            | DiffEntry::Keep { path, .. } => Some(path),
            DiffEntry::End { .. } => None,
        }
    }
}

/// Relative, '/'-separated, no empty/"."/".." components, no NUL.
pub fn validate_rel_path(path: &str) -> std::result::Result<(), DiffError> {
    if path.is_empty() || path.starts_with('/') || path.contains('\0') {
        return Err(DiffError::BadPath(path.to_string()));
    }
    for comp in path.split('/') {
        if comp.is_empty() || comp == "." || comp == ".." {
            return Err(DiffError::BadPath(path.to_string()));
        }
    }
    Ok(())
}

// -------------------- counting wrappers --------------------

pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

// -------------------- payload helpers --------------------

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u32::try_from(s.len()).map_err(|_| anyhow!("string too long: {}", s.len()))?;
    put_u32(buf, len);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Курсор по payload кадра; любые выходы за границы - Malformed.
struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
    tag: u8,
}

impl<'a> Payload<'a> {
    fn new(buf: &'a [u8], tag: u8) -> Self {
        Self { buf, pos: 0, tag }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], DiffError> {
        if self.buf.len() - self.pos < n {
            return Err(DiffError::Malformed(format!(
                "short payload in frame {:#x}",
                self.tag
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> std::result::Result<u32, DiffError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> std::result::Result<u64, DiffError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn string(&mut self) -> std::result::Result<String, DiffError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| DiffError::Malformed(format!("non-utf8 string in frame {:#x}", self.tag)))
    }

    fn path(&mut self) -> std::result::Result<String, DiffError> {
        let p = self.string()?;
        validate_rel_path(&p)?;
        Ok(p)
    }

    fn finish(self) -> std::result::Result<(), DiffError> {
        if self.pos != self.buf.len() {
            return Err(DiffError::Malformed(format!(
                "{} extra byte(s) in frame {:#x}",
                self.buf.len() - self.pos,
                self.tag
            )));
        }
        Ok(())
    }
}

fn frame_crc(hdr: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(&hdr[0..5]);
    hasher.update(payload);
    hasher.finalize()
}

// -------------------- writer --------------------

pub struct DiffWriter<W: Write> {
    out: CountingWriter<W>,
    compress: bool,
    chunk_size: usize,
    entries: u64,
    bytes: u64,
}

impl<W: Write> DiffWriter<W> {
    /// Write the stream header.
    pub fn new(out: W, compress: bool, chunk_size: usize) -> Result<Self> {
        let mut out = CountingWriter::new(out);
        let mut hdr = [0u8; DIFF_HDR_SIZE];
        hdr[0..8].copy_from_slice(DIFF_MAGIC);
        LittleEndian::write_u16(&mut hdr[8..10], DIFF_VERSION);
        LittleEndian::write_u16(&mut hdr[10..12], if compress { DIFF_FLAG_ZSTD } else { 0 });
        out.write_all(&hdr).context("write diff header")?;
        Ok(Self {
            out,
            compress,
            chunk_size: chunk_size.clamp(DIFF_CHUNK_MIN, DIFF_CHUNK_MAX),
            entries: 0,
            bytes: 0,
        })
    }

    fn frame(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > DIFF_MAX_FRAME {
            return Err(anyhow!("frame too large: {}", payload.len()));
        }
        let mut hdr = [0u8; DIFF_FRAME_HDR_SIZE];
        hdr[0] = tag;
        LittleEndian::write_u32(&mut hdr[1..5], payload.len() as u32);
        let crc = frame_crc(&hdr, payload);
        LittleEndian::write_u32(&mut hdr[5..9], crc);
        self.out.write_all(&hdr).context("write diff frame header")?;
        if !payload.is_empty() {
            self.out.write_all(payload).context("write diff frame payload")?;
        }
        Ok(())
    }

    pub fn dir(&mut self, path: &str, mode: u32) -> Result<()> {
        validate_rel_path(path).map_err(DiffError::into_anyhow)?;
        let mut p = Vec::with_capacity(path.len() + 8);
        put_str(&mut p, path)?;
        put_u32(&mut p, mode);
        self.frame(DIFF_TAG_DIR, &p)?;
        self.entries += 1;
        Ok(())
    }

    pub fn link(&mut self, path: &str, target: &str) -> Result<()> {
        validate_rel_path(path).map_err(DiffError::into_anyhow)?;
        let mut p = Vec::with_capacity(path.len() + target.len() + 8);
        put_str(&mut p, path)?;
        put_str(&mut p, target)?;
        self.frame(DIFF_TAG_LINK, &p)?;
        self.entries += 1;
        Ok(())
    }

    pub fn keep(&mut self, path: &str, marker: &Marker) -> Result<()> {
        validate_rel_path(path).map_err(DiffError::into_anyhow)?;
        let mut p = Vec::with_capacity(path.len() + marker.as_str().len() + 8);
        put_str(&mut p, path)?;
        put_str(&mut p, marker.as_str())?;
        self.frame(DIFF_TAG_KEEP, &p)?;
        self.entries += 1;
        Ok(())
    }

    /// FILE frame followed by exactly `size` bytes of `data` as CHUNK frames.
    pub fn file<R: Read>(&mut self, path: &str, mode: u32, size: u64, data: &mut R) -> Result<()> {
        validate_rel_path(path).map_err(DiffError::into_anyhow)?;
        let mut p = Vec::with_capacity(path.len() + 16);
        put_str(&mut p, path)?;
        put_u32(&mut p, mode);
        put_u64(&mut p, size);
        self.frame(DIFF_TAG_FILE, &p)?;

        let mut remaining = size;
        let mut buf = vec![0u8; self.chunk_size];
        while remaining > 0 {
            let want = remaining.min(self.chunk_size as u64) as usize;
            data.read_exact(&mut buf[..want])
                .with_context(|| format!("read source data for {}", path))?;
            if self.compress {
                let packed = zstd::bulk::compress(&buf[..want], ZSTD_LEVEL)
                    .with_context(|| format!("zstd compress chunk of {}", path))?;
                let mut c = Vec::with_capacity(packed.len() + 4);
                put_u32(&mut c, want as u32);
                c.extend_from_slice(&packed);
                self.frame(DIFF_TAG_CHUNK, &c)?;
            } else {
                self.frame(DIFF_TAG_CHUNK, &buf[..want])?;
            }
            remaining -= want as u64;
        }
        // Источник не должен был вырасти во время чтения.
        let mut probe = [0u8; 1];
        if data.read(&mut probe).context("probe end of source data")? != 0 {
            return Err(anyhow!("source for {} grew while being sent", path));
        }
        self.entries += 1;
        self.bytes += size;
        Ok(())
    }

    /// Write END, flush and return the total number of stream bytes.
    pub fn finish(mut self) -> Result<u64> {
        let mut p = Vec::with_capacity(16);
        put_u64(&mut p, self.entries);
        put_u64(&mut p, self.bytes);
        self.frame(DIFF_TAG_END, &p)?;
        self.out.flush().context("flush diff stream")?;
        Ok(self.out.count())
    }
}

// -------------------- reader --------------------

pub struct DiffReader<R: Read> {
    input: R,
    compressed: bool,
    // Остаток байт текущего FILE, ещё не прочитанных через read_file_data.
    pending: u64,
    entries: u64,
    bytes: u64,
    done: bool,
}

/// read_exact, где EOF означает оборванный поток.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8], what: &'static str) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(DiffError::Truncated(what).into_anyhow())
        }
        Err(e) => Err(anyhow::Error::new(e).context("read diff stream")),
    }
}

impl<R: Read> DiffReader<R> {
    /// Read and validate the stream header.
    pub fn new(mut input: R) -> Result<Self> {
        let mut hdr = [0u8; DIFF_HDR_SIZE];
        read_full(&mut input, &mut hdr, "header")?;
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&hdr[0..8]);
        if &magic != DIFF_MAGIC {
            return Err(DiffError::BadMagic(magic).into_anyhow());
        }
        let version = LittleEndian::read_u16(&hdr[8..10]);
        if version != DIFF_VERSION {
            return Err(DiffError::Version(version).into_anyhow());
        }
        let flags = LittleEndian::read_u16(&hdr[10..12]);
        if flags & !DIFF_FLAG_ZSTD != 0 {
            return Err(DiffError::Flags(flags).into_anyhow());
        }
        Ok(Self {
            input,
            compressed: flags & DIFF_FLAG_ZSTD != 0,
            pending: 0,
            entries: 0,
            bytes: 0,
            done: false,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut hdr = [0u8; DIFF_FRAME_HDR_SIZE];
        read_full(&mut self.input, &mut hdr, "frame header")?;
        let tag = hdr[0];
        let len = LittleEndian::read_u32(&hdr[1..5]) as usize;
        if len > DIFF_MAX_FRAME {
            return Err(DiffError::FrameTooLarge(len).into_anyhow());
        }
        let mut payload = vec![0u8; len];
        read_full(&mut self.input, &mut payload, "frame payload")?;
        let crc_expected = LittleEndian::read_u32(&hdr[5..9]);
        if frame_crc(&hdr, &payload) != crc_expected {
            return Err(DiffError::Crc(tag).into_anyhow());
        }
        Ok((tag, payload))
    }

    /// Next entry. After `End` the stream has been checked for trailing bytes.
    pub fn next_entry(&mut self) -> Result<DiffEntry> {
        if self.done {
            return Err(anyhow!("next_entry called after end of stream"));
        }
        if self.pending != 0 {
            return Err(anyhow!(
                "{} byte(s) of file data not consumed before next entry",
                self.pending
            ));
        }
        let (tag, payload) = self.read_frame()?;
        let mut p = Payload::new(&payload, tag);
        let entry = match tag {
            DIFF_TAG_DIR => {
                let path = p.path()?;
                let mode = p.u32()?;
                DiffEntry::Dir { path, mode }
            }
            DIFF_TAG_FILE => {
                let path = p.path()?;
                let mode = p.u32()?;
                let size = p.u64()?;
                self.pending = size;
                DiffEntry::File { path, mode, size }
            }
            DIFF_TAG_LINK => {
                let path = p.path()?;
                let target = p.string()?;
                DiffEntry::Link { path, target }
            }
            DIFF_TAG_KEEP => {
                let path = p.path()?;
                let marker = Marker(p.string()?);
                DiffEntry::Keep { path, marker }
            }
            DIFF_TAG_END => {
                let entries = p.u64()?;
                let bytes = p.u64()?;
                DiffEntry::End { entries, bytes }
            }
            DIFF_TAG_CHUNK => {
                return Err(DiffError::Malformed("chunk frame outside of a file".into()).into_anyhow())
            }
            other => return Err(DiffError::UnknownTag(other).into_anyhow()),
        };
        p.finish()?;

        match &entry {
            DiffEntry::End { entries, bytes } => {
                if *entries != self.entries || *bytes != self.bytes {
                    return Err(DiffError::Malformed(format!(
                        "end frame says {} entries/{} bytes, stream carried {}/{}",
                        entries, bytes, self.entries, self.bytes
                    ))
                    .into_anyhow());
                }
                let mut probe = [0u8; 1];
                match self.input.read(&mut probe) {
                    Ok(0) => {}
                    Ok(_) => return Err(DiffError::Trailing.into_anyhow()),
                    Err(e) => return Err(anyhow::Error::new(e).context("read diff stream")),
                }
                self.done = true;
            }
            DiffEntry::File { size, .. } => {
                self.entries += 1;
                self.bytes += size;
            }
            _ => self.entries += 1,
        }
        Ok(entry)
    }

    /// Copy the data of the current FILE entry into `out`.
    pub fn read_file_data(&mut self, out: &mut dyn Write) -> Result<u64> {
        let total = self.pending;
        while self.pending > 0 {
            let (tag, payload) = self.read_frame()?;
            if tag != DIFF_TAG_CHUNK {
                return Err(DiffError::Malformed(format!(
                    "expected chunk frame, got tag {:#x} with {} byte(s) of file left",
                    tag, self.pending
                ))
                .into_anyhow());
            }
            let data = if self.compressed {
                if payload.len() < 4 {
                    return Err(DiffError::Malformed("short compressed chunk".into()).into_anyhow());
                }
                let raw_len = LittleEndian::read_u32(&payload[0..4]) as usize;
                if raw_len > DIFF_MAX_FRAME {
                    return Err(DiffError::FrameTooLarge(raw_len).into_anyhow());
                }
                let raw = zstd::bulk::decompress(&payload[4..], raw_len).map_err(|e| {
                    DiffError::Malformed(format!("zstd chunk: {}", e)).into_anyhow()
                })?;
                if raw.len() != raw_len {
                    return Err(DiffError::Malformed(format!(
                        "zstd chunk decoded to {} byte(s), header says {}",
                        raw.len(),
                        raw_len
                    ))
                    .into_anyhow());
                }
                raw
            } else {
                payload
            };
            if data.is_empty() || data.len() as u64 > self.pending {
                return Err(DiffError::Malformed(format!(
                    "chunk of {} byte(s) with {} byte(s) of file left",
                    data.len(),
                    self.pending
                ))
                .into_anyhow());
            }
            out.write_all(&data).context("write received file data")?;
            self.pending -= data.len() as u64;
        }
        Ok(total)
    }
}
