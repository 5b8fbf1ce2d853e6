//! PSVI (Partseek Vector Index) on-disk snapshot format.
//!
//! Layout (little-endian):
//!
//! Header:
//!   Magic: "PSVI" (4 bytes)
//!   Version: u16
//!   ModelVersion length: u16
//!   ModelVersion: bytes
//!   Dimension: u32
//!   Count: u32
//!   BuiltAtMs: i64
//!   HeaderCRC32: u32 (CRC32 of header bytes before this field)
//!
//! Id table (Count entries):
//!   IdLength: u16
//!   Id: bytes
//!
//! Vector slab:
//!   Count x Dimension f32, row-major, already unit-normalized.
//!
//! The HNSW graph is not serialized; it is rebuilt from the slab on load,
//! which keeps the file format independent of graph parameters.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use memmap2::Mmap;

use crate::index::snapshot::IndexSnapshot;

pub const PSVI_MAGIC: [u8; 4] = *b"PSVI";
pub const PSVI_VERSION: u16 = 1;

/// Raw snapshot parts read back from disk, before graph rebuild.
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub model_version: String,
    pub dimension: usize,
    pub ids: Vec<String>,
    pub slab: Vec<f32>,
    pub built_at_ms: i64,
}

/// Write a snapshot to `path` via temp file + atomic rename.
pub fn save_snapshot(snapshot: &IndexSnapshot, path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let temp_path = path.with_extension("psvi.tmp");
    let file = File::create(&temp_path)
        .with_context(|| format!("create temp snapshot file {temp_path:?}"))?;
    let mut writer = BufWriter::new(file);

    let mut header = Vec::new();
    header.extend_from_slice(&PSVI_MAGIC);
    header.extend_from_slice(&PSVI_VERSION.to_le_bytes());

    let mv_bytes = snapshot.model_version.as_bytes();
    let mv_len =
        u16::try_from(mv_bytes.len()).map_err(|_| anyhow!("model version too long"))?;
    header.extend_from_slice(&mv_len.to_le_bytes());
    header.extend_from_slice(mv_bytes);

    header.extend_from_slice(&(snapshot.dimension as u32).to_le_bytes());
    header.extend_from_slice(&(snapshot.len() as u32).to_le_bytes());
    header.extend_from_slice(&snapshot.built_at_ms.to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    let crc = hasher.finalize();

    writer.write_all(&header)?;
    writer.write_all(&crc.to_le_bytes())?;

    for id in snapshot.ids() {
        let id_bytes = id.as_bytes();
        let id_len = u16::try_from(id_bytes.len()).map_err(|_| anyhow!("id too long: {id}"))?;
        writer.write_all(&id_len.to_le_bytes())?;
        writer.write_all(id_bytes)?;
    }

    for &value in snapshot.slab() {
        writer.write_all(&value.to_le_bytes())?;
    }

    writer.flush()?;
    drop(writer);

    std::fs::rename(&temp_path, path)?;
    tracing::info!(?path, count = snapshot.len(), "saved index snapshot");
    Ok(())
}

/// Read a snapshot file back into its raw parts.
pub fn load_snapshot(path: &Path) -> Result<LoadedSnapshot> {
    let file = File::open(path).with_context(|| format!("open snapshot file {path:?}"))?;
    // Safety: the file is opened read-only and the mapping is dropped before return.
    let mmap = unsafe { Mmap::map(&file) }.context("mmap snapshot file")?;
    let buf: &[u8] = &mmap;
    let mut pos = 0usize;

    let magic = take(buf, &mut pos, 4).context("read magic")?;
    if magic != PSVI_MAGIC {
        bail!("invalid PSVI magic: {magic:?}");
    }
    let version = u16::from_le_bytes(take(buf, &mut pos, 2)?.try_into()?);
    if version != PSVI_VERSION {
        bail!("unsupported PSVI version: {version}");
    }

    let mv_len = u16::from_le_bytes(take(buf, &mut pos, 2)?.try_into()?) as usize;
    let model_version = String::from_utf8(take(buf, &mut pos, mv_len)?.to_vec())
        .context("model version is not valid UTF-8")?;

    let dimension = u32::from_le_bytes(take(buf, &mut pos, 4)?.try_into()?) as usize;
    let count = u32::from_le_bytes(take(buf, &mut pos, 4)?.try_into()?) as usize;
    let built_at_ms = i64::from_le_bytes(take(buf, &mut pos, 8)?.try_into()?);

    if dimension == 0 {
        bail!("snapshot dimension must be non-zero");
    }

    let header_end = pos;
    let crc_expected = u32::from_le_bytes(take(buf, &mut pos, 4)?.try_into()?);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..header_end]);
    let crc_actual = hasher.finalize();
    if crc_actual != crc_expected {
        bail!("header CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})");
    }

    // Every record needs at least a 2-byte id length plus its slab row;
    // bound the claimed count by the bytes actually present before any
    // count-sized allocation.
    let slab_bytes_len = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| anyhow!("snapshot size overflows"))?;
    let min_needed = count
        .checked_mul(2)
        .and_then(|n| n.checked_add(slab_bytes_len))
        .ok_or_else(|| anyhow!("snapshot size overflows"))?;
    let remaining = buf.len() - pos;
    if min_needed > remaining {
        bail!("snapshot claims {count} records but only {remaining} bytes remain");
    }

    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let id_len = u16::from_le_bytes(take(buf, &mut pos, 2)?.try_into()?) as usize;
        let id = String::from_utf8(take(buf, &mut pos, id_len)?.to_vec())
            .context("record id is not valid UTF-8")?;
        ids.push(id);
    }

    let slab_len = count * dimension;
    let slab_bytes = take(buf, &mut pos, slab_bytes_len).context("read vector slab")?;
    let mut slab = Vec::with_capacity(slab_len);
    for chunk in slab_bytes.chunks_exact(4) {
        slab.push(f32::from_le_bytes(chunk.try_into()?));
    }

    Ok(LoadedSnapshot {
        model_version,
        dimension,
        ids,
        slab,
        built_at_ms,
    })
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| anyhow!("snapshot file truncated at offset {pos}"))?;
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::snapshot::normalize;
    use tempfile::TempDir;

    fn sample_snapshot() -> IndexSnapshot {
        let dimension = 4;
        let mut ids = Vec::new();
        let mut slab = Vec::new();
        for (id, raw) in [
            ("BBa_J23100", [1.0, 0.2, 0.0, 0.0]),
            ("BBa_B0034", [0.0, 1.0, 0.3, 0.0]),
            ("BBa_E0040", [0.0, 0.0, 1.0, 0.4]),
        ] {
            let mut v = raw.to_vec();
            normalize(&mut v);
            ids.push(id.to_string());
            slab.extend_from_slice(&v);
        }
        IndexSnapshot::assemble("fnv1a-4-v1".into(), dimension, ids, slab, None, 1_700_000_000_000)
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.psvi");
        let snap = sample_snapshot();

        save_snapshot(&snap, &path).unwrap();
        let loaded = load_snapshot(&path).unwrap();

        assert_eq!(loaded.model_version, "fnv1a-4-v1");
        assert_eq!(loaded.dimension, 4);
        assert_eq!(loaded.ids, snap.ids());
        assert_eq!(loaded.slab, snap.slab());
        assert_eq!(loaded.built_at_ms, 1_700_000_000_000);
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.psvi");
        save_snapshot(&sample_snapshot(), &path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] ^= 0xFF; // inside the model-version length field
        std::fs::write(&path, &bytes).unwrap();

        assert!(load_snapshot(&path).is_err());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.psvi");
        save_snapshot(&sample_snapshot(), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("truncated") || err.to_string().contains("slab"));
    }

    #[test]
    fn oversized_count_in_a_valid_header_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.psvi");

        // A well-formed header (CRC included) whose count field vastly
        // exceeds the file contents must fail before allocating for it.
        let mut header = Vec::new();
        header.extend_from_slice(&PSVI_MAGIC);
        header.extend_from_slice(&PSVI_VERSION.to_le_bytes());
        let mv = b"fnv1a-4-v1";
        header.extend_from_slice(&(mv.len() as u16).to_le_bytes());
        header.extend_from_slice(mv);
        header.extend_from_slice(&4u32.to_le_bytes());
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        header.extend_from_slice(&0i64.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        let crc = hasher.finalize();

        let mut bytes = header;
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 64]);
        std::fs::write(&path, &bytes).unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("bytes remain"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.psvi");
        std::fs::write(&path, b"NOPE0000000000000000").unwrap();
        assert!(load_snapshot(&path).is_err());
    }
}
