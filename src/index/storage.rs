//! On-disk format of the embedding index.
//!
//! ```text
//! magic "FTIX" | version u32 | dimension u32 | rows u64 | rows * dimension f32
//! ```
//! All integers and floats little-endian.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::IndexError;

const MAGIC: &[u8; 4] = b"FTIX";
const VERSION: u32 = 1;

/// Read `(dimension, flat vector data)` from `path`.
pub fn read(path: &Path) -> Result<(usize, Vec<f32>), IndexError> {
    let file = File::open(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let io_err = |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(io_err)?;
    if &magic != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }

    let version = read_u32(&mut reader).map_err(io_err)?;
    if version != VERSION {
        return Err(corrupt(path, &format!("unsupported version {version}")));
    }

    let dimension = read_u32(&mut reader).map_err(io_err)? as usize;
    if dimension == 0 {
        return Err(corrupt(path, "zero dimension"));
    }

    let rows = read_u64(&mut reader).map_err(io_err)?;
    let expected_bytes = rows
        .checked_mul(dimension as u64)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt(path, "row count overflow"))?;

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).map_err(io_err)?;
    if bytes.len() as u64 != expected_bytes {
        return Err(corrupt(
            path,
            &format!("expected {expected_bytes} bytes of vectors, found {}", bytes.len()),
        ));
    }

    Ok((dimension, bytes_to_vectors(&bytes)))
}

/// Write the index to a sibling temp file, sync it, then rename over `path`.
pub fn write(path: &Path, dimension: usize, data: &[f32]) -> Result<(), IndexError> {
    let io_err = |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let tmp = temp_path(path);
    {
        let file = File::create(&tmp).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        let rows = (data.len() / dimension) as u64;

        writer.write_all(MAGIC).map_err(io_err)?;
        writer.write_all(&VERSION.to_le_bytes()).map_err(io_err)?;
        writer.write_all(&(dimension as u32).to_le_bytes()).map_err(io_err)?;
        writer.write_all(&rows.to_le_bytes()).map_err(io_err)?;
        for value in data {
            writer.write_all(&value.to_le_bytes()).map_err(io_err)?;
        }

        let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;
    }

    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "index".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt(path: &Path, reason: &str) -> IndexError {
    IndexError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn read_u32(reader: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn bytes_to_vectors(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("faces.index");
        write(&path, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(matches!(read(&path), Err(IndexError::Corrupt { .. })));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("faces.index");
        fs::write(&path, b"JUNKJUNKJUNKJUNKJUNKJUNK").unwrap();

        assert!(matches!(read(&path), Err(IndexError::Corrupt { .. })));
    }

    #[test]
    fn test_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("faces.index");
        write(&path, 3, &[0.5; 6]).unwrap();

        assert!(path.exists());
        assert!(!temp_path(&path).exists());
        let (dimension, data) = read(&path).unwrap();
        assert_eq!(dimension, 3);
        assert_eq!(data, vec![0.5; 6]);
    }
}
