//! Общие константы форматов (store file, diff stream, provider layout).

// -------- Durable store --------
pub const STORE_MAGIC: &[u8; 8] = b"QVSTORE1";
pub const STORE_VERSION: u32 = 1;
// Суффиксы соседних файлов: <store>.lock, <store>.tmp
pub const STORE_LOCK_SUFFIX: &str = "lock";
pub const STORE_TMP_SUFFIX: &str = "tmp";

// Buckets
pub const BUCKET_META: &str = "meta";
pub const BUCKET_VOLUMES: &str = "volumes";
pub const BUCKET_NAMES: &str = "names";

// Keys inside BUCKET_META
pub const META_KEY_PROVIDER: &[u8] = b"provider";

// -------- Diff stream --------
pub const DIFF_MAGIC: &[u8; 8] = b"QVDIFF01";
pub const DIFF_VERSION: u16 = 1;
pub const DIFF_HDR_SIZE: usize = 12; // [magic8][ver u16][flags u16]

pub const DIFF_FLAG_ZSTD: u16 = 0x1;

// Frame header: [tag u8][len u32][crc32 u32] - crc over tag+len+payload
pub const DIFF_FRAME_HDR_SIZE: usize = 9;
// Upper bound for a single frame payload (chunk max + zstd slack)
pub const DIFF_MAX_FRAME: usize = 32 * 1024 * 1024;

pub const DIFF_TAG_DIR: u8 = 1;
pub const DIFF_TAG_FILE: u8 = 2;
pub const DIFF_TAG_CHUNK: u8 = 3;
pub const DIFF_TAG_LINK: u8 = 4;
pub const DIFF_TAG_KEEP: u8 = 5;
pub const DIFF_TAG_END: u8 = 0xFF;

pub const DIFF_CHUNK_DEFAULT: usize = 1024 * 1024;
pub const DIFF_CHUNK_MIN: usize = 4 * 1024;
pub const DIFF_CHUNK_MAX: usize = 16 * 1024 * 1024;

// -------- FsProvider layout --------
pub const FS_PROVIDER_KIND: &str = "fs";
pub const FS_MNT_DIR: &str = "mnt";
pub const FS_POOL_DIR: &str = "pool";
pub const FS_STAGING_DIR: &str = "staging";
pub const FS_PROVIDER_MARKER: &str = ".provider";
