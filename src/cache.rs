use crate::prelude::*;
use ring::digest;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

// Some filesystems don't cope well with a single directory containing lots
// of files, so entries are dispersed over nested single-character
// directories: ${BASE}/${C}/${C}/${C}/${C}/${C}/${ENTRY}, where the
// characters are the leading hex digits of the entry's own name.
const DIR_NEST_DEPTH: usize = 5;

/// Counters for one cache instance. `pass` counts misses, the gets that
/// passed through to a real fetch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub pass: u64,
    pub sets: u64,
}

/// Content-addressed store for small immutable blobs (extracted METADATA
/// files, mostly), keyed by arbitrary strings. Writes go to a sibling temp
/// file first and are renamed into place, so concurrent walkers sharing a
/// cache directory can't see torn values.
///
/// The no-op variant is what `--no-cache` plugs in: every get misses, every
/// set is discarded.
pub enum Cache {
    Disk(DiskCache),
    Noop,
}

impl Cache {
    pub fn disk(base: &Path) -> Cache {
        Cache::Disk(DiskCache {
            base: base.to_path_buf(),
            hits: AtomicU64::new(0),
            pass: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        })
    }

    pub fn noop() -> Cache {
        Cache::Noop
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self {
            Cache::Disk(disk) => disk.get(key),
            Cache::Noop => None,
        }
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        match self {
            Cache::Disk(disk) => disk.set(key, value),
            Cache::Noop => Ok(()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        match self {
            Cache::Disk(disk) => CacheStats {
                hits: disk.hits.load(Ordering::Relaxed),
                pass: disk.pass.load(Ordering::Relaxed),
                sets: disk.sets.load(Ordering::Relaxed),
            },
            Cache::Noop => CacheStats::default(),
        }
    }
}

pub struct DiskCache {
    base: PathBuf,
    hits: AtomicU64,
    pass: AtomicU64,
    sets: AtomicU64,
}

impl DiskCache {
    fn path_for_key(&self, key: &str) -> PathBuf {
        // sha-1 is fine here: these are cache paths, not integrity checks
        let scrambled = data_encoding::HEXLOWER.encode(
            digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, key.as_bytes()).as_ref(),
        );
        let mut path = self.base.clone();
        for i in 0..DIR_NEST_DEPTH {
            path.push(&scrambled[i..i + 1]);
        }
        path.push(&scrambled);
        path
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        match fs::read(self.path_for_key(key)) {
            Ok(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            Err(_) => {
                self.pass.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for_key(key);
        // unwrap rationale: path_for_key always produces nested paths
        let parent = path.parent().unwrap();
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(value)?;
        tmp.persist(&path)
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
