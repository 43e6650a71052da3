use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use arboard::Clipboard;
use log::debug;
use rand::Rng;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use zip::read::ZipArchive;
use zip::write::{FileOptions, ZipWriter};

use crate::error::TransferError;
use crate::COPY_BUF_SIZE;

/// Sentinel source string meaning "read the payload from standard input".
pub const STDIN_SOURCE: &str = "stdin";

/// A source resolved for sending, after any stream capture.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub path: PathBuf,
    /// Display name shown to the receiver.
    pub name: String,
    pub is_directory: bool,
    /// True only when the source was synthesized from a stream and must be
    /// cleaned up once the send is finalized.
    pub delete_after_send: bool,
}

/// Resolves a named filesystem path for sending.
///
/// Fails with [`TransferError::NotFound`] if the path does not exist. The
/// stdin sentinel is handled by [`resolve_stream`], not here.
pub fn resolve_source(source: &str) -> Result<ResolvedSource, TransferError> {
    let path = PathBuf::from(source);
    if !path.exists() {
        return Err(TransferError::NotFound(path));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string());
    let is_directory = path.is_dir();
    Ok(ResolvedSource {
        path,
        name,
        is_directory,
        delete_after_send: false,
    })
}

/// Drains a stream into a uniquely named file under `staging_dir` and
/// resolves it as a send source marked for cleanup.
pub fn resolve_stream<R: Read + ?Sized>(
    reader: &mut R,
    staging_dir: &Path,
) -> Result<ResolvedSource, TransferError> {
    let path = capture_stream(reader, staging_dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| STDIN_SOURCE.to_string());
    Ok(ResolvedSource {
        path,
        name,
        is_directory: false,
        delete_after_send: true,
    })
}

/// Copies `reader` into a fresh collision-free file under `staging_dir`.
pub fn capture_stream<R: Read + ?Sized>(
    reader: &mut R,
    staging_dir: &Path,
) -> Result<PathBuf, TransferError> {
    loop {
        let path = temp_file_name(staging_dir, "stdin");
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        };
        let captured = io::copy(reader, &mut file)?;
        file.flush()?;
        debug!("captured {} bytes from stream into {}", captured, path.display());
        return Ok(path);
    }
}

/// A unique path under `dir`, named from the process id and a random tag.
pub fn temp_file_name(dir: &Path, prefix: &str) -> PathBuf {
    let mut rng = rand::rng();
    let tag: u64 = rng.random();
    dir.join(format!("{}-{}-{:016x}", prefix, std::process::id(), tag))
}

fn zip_error(err: zip::result::ZipError) -> TransferError {
    match err {
        zip::result::ZipError::Io(io) => TransferError::Io(io),
        other => TransferError::Format(other.to_string()),
    }
}

fn walk_error(err: walkdir::Error) -> TransferError {
    match err.into_io_error() {
        Some(io) => TransferError::Io(io),
        None => TransferError::Io(io::Error::other("filesystem loop while walking source")),
    }
}

/// Archives a file or directory tree into a single zip blob at `output`.
///
/// Directory entries keep their structure relative to `source`; a single
/// file becomes a one-entry archive under its own name, so restoring into a
/// directory recreates it in place.
pub fn archive(source: &Path, output: &Path, compress: bool) -> Result<(), TransferError> {
    let method = if compress {
        zip::CompressionMethod::Deflated
    } else {
        zip::CompressionMethod::Stored
    };
    let options = FileOptions::<()>::default()
        .compression_method(method)
        .unix_permissions(0o755);

    let mut zip = ZipWriter::new(File::create(output)?);

    if source.is_dir() {
        for entry in WalkDir::new(source) {
            let entry = entry.map_err(walk_error)?;
            let path = entry.path();
            if path == source {
                continue;
            }

            let relative = path
                .strip_prefix(source)
                .map_err(|_| TransferError::Io(io::Error::other("walked outside the source root")))?;
            let name = relative
                .to_str()
                .ok_or_else(|| TransferError::Io(io::Error::other("path is not valid UTF-8")))?;

            if path.is_file() {
                debug!("adding file: {}", name);
                zip.start_file(name, options).map_err(zip_error)?;
                let mut f = File::open(path)?;
                io::copy(&mut f, &mut zip)?;
            } else if path.is_dir() {
                debug!("adding directory: {}/", name);
                zip.add_directory(format!("{}/", name), options).map_err(zip_error)?;
            }
        }
    } else {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::Io(io::Error::other("source has no usable file name")))?;
        zip.start_file(name, options).map_err(zip_error)?;
        let mut f = File::open(source)?;
        io::copy(&mut f, &mut zip)?;
    }

    zip.finish().map_err(zip_error)?;
    Ok(())
}

/// Hex-encoded SHA-256 digest and byte length of the blob at `path`.
pub fn identity(path: &Path) -> Result<(String, u64), TransferError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Extracts the archive at `blob` into `dest_dir`, recreating names,
/// directory structure and content bytes exactly; permissions best-effort.
///
/// Fails with [`TransferError::Format`] if the blob is not a valid archive
/// or an entry name would escape the destination.
pub fn restore(blob: &Path, dest_dir: &Path) -> Result<(), TransferError> {
    let mut archive = ZipArchive::new(File::open(blob)?).map_err(zip_error)?;
    fs::create_dir_all(dest_dir)?;

    debug!("extracting {} entries", archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        let relative = match entry.enclosed_name() {
            Some(name) => name,
            None => {
                return Err(TransferError::Format(format!(
                    "entry '{}' escapes the destination",
                    entry.name()
                )))
            }
        };
        let outpath = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

/// Generates a random 6-digit code phrase and copies it to the clipboard.
///
/// Clipboard access may fail on headless systems; the code phrase is still
/// returned and the transfer proceeds.
pub fn generate_code_phrase() -> u32 {
    let mut rng = rand::rng();
    let code: u32 = rng.random_range(100_000..=999_999);

    if let Ok(mut clipboard) = Clipboard::new() {
        let _ = clipboard.set_text(code.to_string());
    }

    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("archive_{}_{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_resolve_source_missing_path() {
        let result = resolve_source("/definitely/not/a/real/path");
        assert!(matches!(result, Err(TransferError::NotFound(_))));
    }

    #[test]
    fn test_resolve_source_file() {
        let dir = temp_dir("resolve");
        let path = dir.join("notes.txt");
        fs::write(&path, b"hello").unwrap();

        let resolved = resolve_source(path.to_str().unwrap()).unwrap();
        assert_eq!(resolved.name, "notes.txt");
        assert!(!resolved.is_directory);
        assert!(!resolved.delete_after_send);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resolve_source_directory() {
        let dir = temp_dir("resolve_dir");
        let resolved = resolve_source(dir.to_str().unwrap()).unwrap();
        assert!(resolved.is_directory);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resolve_stream_marks_cleanup() {
        let dir = temp_dir("stream");
        let mut input = Cursor::new(b"hello".to_vec());

        let resolved = resolve_stream(&mut input, &dir).unwrap();
        assert!(resolved.delete_after_send);
        assert!(!resolved.is_directory);
        assert_eq!(fs::read(&resolved.path).unwrap(), b"hello");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_capture_stream_unique_names() {
        let dir = temp_dir("capture");
        let mut a = Cursor::new(b"one".to_vec());
        let mut b = Cursor::new(b"two".to_vec());

        let path_a = capture_stream(&mut a, &dir).unwrap();
        let path_b = capture_stream(&mut b, &dir).unwrap();
        assert_ne!(path_a, path_b);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_archive_roundtrip() {
        let dir = temp_dir("file_rt");
        let source = dir.join("data.bin");
        fs::write(&source, vec![0xABu8; 5000]).unwrap();

        let blob = dir.join("blob.zip");
        archive(&source, &blob, true).unwrap();

        let dest = dir.join("out");
        restore(&blob, &dest).unwrap();

        assert_eq!(fs::read(dest.join("data.bin")).unwrap(), vec![0xABu8; 5000]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_tree_archive_roundtrip() {
        let dir = temp_dir("tree_rt");
        let source = dir.join("tree");
        fs::create_dir_all(source.join("sub/nested")).unwrap();
        fs::write(source.join("root.txt"), b"root").unwrap();
        fs::write(source.join("sub/inner.txt"), b"inner").unwrap();
        fs::write(source.join("sub/nested/deep.txt"), b"deep").unwrap();

        let blob = dir.join("tree.zip");
        archive(&source, &blob, true).unwrap();

        let dest = dir.join("out");
        restore(&blob, &dest).unwrap();

        assert_eq!(fs::read(dest.join("root.txt")).unwrap(), b"root");
        assert_eq!(fs::read(dest.join("sub/inner.txt")).unwrap(), b"inner");
        assert_eq!(fs::read(dest.join("sub/nested/deep.txt")).unwrap(), b"deep");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_archive_without_compression_roundtrip() {
        let dir = temp_dir("stored_rt");
        let source = dir.join("plain.txt");
        fs::write(&source, b"uncompressed payload").unwrap();

        let blob = dir.join("plain.zip");
        archive(&source, &blob, false).unwrap();

        let dest = dir.join("out");
        restore(&blob, &dest).unwrap();
        assert_eq!(fs::read(dest.join("plain.txt")).unwrap(), b"uncompressed payload");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_identity_hash_and_size() {
        let dir = temp_dir("identity");
        let path = dir.join("hashed.bin");
        fs::write(&path, vec![1u8; 1234]).unwrap();

        let (hash, size) = identity(&path).unwrap();
        assert_eq!(size, 1234);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // Same content, same digest.
        let copy = dir.join("copy.bin");
        fs::write(&copy, vec![1u8; 1234]).unwrap();
        let (hash2, _) = identity(&copy).unwrap();
        assert_eq!(hash, hash2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_restore_rejects_non_archive() {
        let dir = temp_dir("bad_blob");
        let blob = dir.join("not_a_zip.bin");
        fs::write(&blob, b"this is not an archive at all").unwrap();

        let result = restore(&blob, &dir.join("out"));
        assert!(matches!(result, Err(TransferError::Format(_))));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_generate_code_phrase_range() {
        for _ in 0..100 {
            let code = generate_code_phrase();
            assert!((100_000..=999_999).contains(&code));
        }
    }
}
