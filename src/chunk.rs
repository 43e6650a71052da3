use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::TransferError;

/// Path of the chunk with the given 0-based index, derived from the blob path.
pub fn chunk_path(base: &Path, index: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Splits `input` into exactly `chunk_count` files named `input.0` through
/// `input.(chunk_count-1)`, covering the blob byte-for-byte with no overlap
/// and no gaps, in read order. Sizes are `total / chunk_count` with the last
/// chunk absorbing the remainder.
///
/// On failure the partial chunk set is not valid; the caller owns cleanup.
pub fn split(input: &Path, chunk_count: usize) -> Result<Vec<PathBuf>, TransferError> {
    if chunk_count == 0 {
        return Err(TransferError::Io(io::Error::other(
            "chunk count must be at least 1",
        )));
    }

    let total = fs::metadata(input)?.len();
    let per_chunk = total / chunk_count as u64;
    debug!("splitting {} ({} bytes) into {} chunks", input.display(), total, chunk_count);

    let mut reader = BufReader::new(File::open(input)?);
    let mut paths = Vec::with_capacity(chunk_count);
    for index in 0..chunk_count {
        let path = chunk_path(input, index);
        let mut writer = BufWriter::new(File::create(&path)?);

        // The last chunk takes whatever remains of the blob.
        let limit = if index == chunk_count - 1 { u64::MAX } else { per_chunk };
        let written = io::copy(&mut reader.by_ref().take(limit), &mut writer)?;
        writer.flush()?;

        debug!("wrote chunk {} ({} bytes)", index, written);
        paths.push(path);
    }

    Ok(paths)
}

/// Concatenates `chunks` into `output` in the given order, which must be
/// ascending index order: no per-chunk checksum exists, so a reordering is
/// only caught by the whole-blob content hash at the very end of a transfer.
///
/// With `delete_after`, each chunk is removed only once it has been fully
/// copied into the output. Partial output after an error is not valid.
pub fn join(chunks: &[PathBuf], output: &Path, delete_after: bool) -> Result<(), TransferError> {
    let mut writer = BufWriter::new(File::create(output)?);

    for chunk in chunks {
        debug!("joining chunk {}", chunk.display());
        let mut reader = File::open(chunk)?;
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        if delete_after {
            fs::remove_file(chunk)?;
        }
    }

    writer.flush()?;
    Ok(())
}
