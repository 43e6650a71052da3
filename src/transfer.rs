use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::archive::{self, ResolvedSource};
use crate::chunk;
use crate::cryptography;
use crate::display::{self, TransferDisplay};
use crate::error::TransferError;
use crate::session::{FileMetadata, ReceiverPhase, SenderPhase, Session, SessionState};

/// Knobs for one transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub use_encryption: bool,
    pub use_compression: bool,
    /// Directory for transient blobs: stdin captures, archives, chunks.
    pub staging_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            use_encryption: true,
            use_compression: true,
            staging_dir: std::env::temp_dir(),
        }
    }
}

/// Removes its file on drop unless released to a new owner. Every transient
/// blob in the pipeline is held by one of these, so no exit path leaks it.
struct TempArtifact {
    path: PathBuf,
    armed: bool,
}

impl TempArtifact {
    fn new(path: PathBuf) -> Self {
        TempArtifact { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Hands ownership of the file to the caller; it will not be removed.
    fn release(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// The transfer state machine for one session and role.
///
/// Sender: `Idle → PreparingSend → AwaitingKey → Encrypting → Chunking →
/// Announced`, driven by [`Transfer::prepare_outbound`] and
/// [`Transfer::finalize_and_announce`]. Receiver: `Idle → AwaitingChunks →
/// Reassembling → Decrypting → Verifying → Unarchiving → Done|Failed`,
/// driven by [`Transfer::receive_and_verify`].
#[derive(Clone)]
pub struct Transfer {
    session: Arc<Session>,
    config: TransferConfig,
    display: Arc<dyn TransferDisplay>,
}

impl Transfer {
    pub fn new(
        session: Arc<Session>,
        config: TransferConfig,
        display: Arc<dyn TransferDisplay>,
    ) -> Self {
        Transfer {
            session,
            config,
            display,
        }
    }

    /// Sender side: archive the source, record its identity, and publish the
    /// metadata into the session.
    ///
    /// The stdin sentinel drains standard input into a staging file first.
    /// Errors from preparation propagate unchanged, and no partial metadata
    /// is ever published.
    pub async fn prepare_outbound(&self, source: &str) -> Result<(), TransferError> {
        if source == archive::STDIN_SOURCE {
            let mut stdin = io::stdin();
            return self.prepare_outbound_stream(&mut stdin).await;
        }

        debug!("processing file '{}'", source);
        let resolved = archive::resolve_source(source)?;
        self.publish_prepared(resolved).await
    }

    /// Like [`Transfer::prepare_outbound`], but for an arbitrary byte
    /// stream. The captured staging file is marked for removal once the send
    /// is finalized.
    pub async fn prepare_outbound_stream(
        &self,
        reader: &mut (dyn Read + Send),
    ) -> Result<(), TransferError> {
        debug!("processing stream source");
        let resolved = archive::resolve_stream(reader, &self.config.staging_dir)?;
        self.publish_prepared(resolved).await
    }

    async fn publish_prepared(&self, resolved: ResolvedSource) -> Result<(), TransferError> {
        {
            let mut state = self.session.lock().await;
            state.sender_phase = SenderPhase::PreparingSend;
        }

        // Until the metadata is published, these guards own the on-disk
        // artifacts; any early return cleans them up.
        let source_guard = resolved
            .delete_after_send
            .then(|| TempArtifact::new(resolved.path.clone()));

        let archived = TempArtifact::new(archive::temp_file_name(
            &self.config.staging_dir,
            "archive",
        ));
        debug!("archiving {}", resolved.path.display());
        archive::archive(&resolved.path, archived.path(), self.config.use_compression)?;
        let (content_hash, size) = archive::identity(archived.path())?;
        debug!("archived blob: {} bytes, hash {}", size, content_hash);

        let metadata = FileMetadata {
            name: resolved.name,
            is_directory: resolved.is_directory,
            is_compressed: self.config.use_compression,
            is_encrypted: self.config.use_encryption,
            size,
            content_hash,
            delete_source_after_send: resolved.delete_after_send,
        };

        let code_phrase = self.session.lock().await.code_phrase;
        self.session
            .publish_metadata(
                metadata.clone(),
                archived.release(),
                source_guard.map(TempArtifact::release),
            )
            .await;
        display::notify_intro(self.display.clone(), code_phrase, metadata);

        debug!("finished processing file");
        Ok(())
    }

    /// Sender-side convergence point: wait for metadata, derive the session
    /// key, encrypt, split into one chunk per port, seal the metadata
    /// envelope, and announce readiness.
    ///
    /// The snapshot push happens-before the `file_ready` flip, which runs on
    /// its own task, so a racing reader never observes `file_ready` with a
    /// stale snapshot. Returns the chunk paths for the chunk transport to
    /// deliver.
    pub async fn finalize_and_announce(&self) -> Result<Vec<PathBuf>, TransferError> {
        debug!("getting files ready");
        {
            let mut state = self.session.lock().await;
            state.pending_metadata_send = true;
        }

        let mut metadata = self.session.wait_for_metadata().await;

        let (shared_secret, port_count, staged_archive, staged_source) = {
            let mut state = self.session.lock().await;
            state.sender_phase = SenderPhase::AwaitingKey;
            (
                state.shared_secret.clone(),
                state.ports.len(),
                state.staged_archive.take(),
                state.staged_source.take(),
            )
        };
        let archived = TempArtifact::new(staged_archive.ok_or_else(|| {
            TransferError::Io(io::Error::other("no staged archive for this session"))
        })?);

        // The stdin capture has served its purpose once the archive exists.
        if metadata.delete_source_after_send {
            if let Some(source) = staged_source {
                let _ = fs::remove_file(&source);
            }
        }

        let key = shared_secret.session_key()?;

        let blob = if self.config.use_encryption {
            {
                let mut state = self.session.lock().await;
                state.sender_phase = SenderPhase::Encrypting;
            }
            let encrypted = TempArtifact::new(archive::temp_file_name(
                &self.config.staging_dir,
                "encrypted",
            ));
            debug!("encrypting archive to {}", encrypted.path().display());
            cryptography::encrypt_file(archived.path(), encrypted.path(), &key)?;
            // The plaintext archive is superseded; drop removes it.
            drop(archived);

            metadata.is_encrypted = true;
            {
                let mut state = self.session.lock().await;
                if let Some(md) = state.file_metadata.as_mut() {
                    md.is_encrypted = true;
                }
            }
            encrypted
        } else {
            archived
        };

        {
            let mut state = self.session.lock().await;
            state.sender_phase = SenderPhase::Chunking;
        }
        debug!("splitting {}", blob.path().display());
        let chunks = match chunk::split(blob.path(), port_count) {
            Ok(paths) => paths,
            Err(err) => {
                for index in 0..port_count {
                    let _ = fs::remove_file(chunk::chunk_path(blob.path(), index));
                }
                return Err(err);
            }
        };
        // Chunks are now the only on-disk representation of the payload.
        drop(blob);

        let envelope =
            serde_json::to_vec(&metadata).map_err(|e| TransferError::Format(e.to_string()))?;
        let sealed = cryptography::encrypt_bytes(&envelope, &key)?;

        {
            let mut state = self.session.lock().await;
            state.encrypted_file_metadata = sealed;
            state.pending_metadata_send = false;
            state.sender_phase = SenderPhase::Announced;
            debug!("updating channel with file information");
            state.publish().await;
        }

        // file_ready flips on a separate, later step; the snapshot above is
        // already visible by the time any reader can observe the flag.
        let session = self.session.clone();
        tokio::spawn(async move {
            let mut state = session.lock().await;
            state.file_ready = true;
            state.publish().await;
        });

        debug!("files ready");
        Ok(chunks)
    }

    /// Receiver-side convergence point, invoked once all chunks have arrived
    /// out-of-band: join, decrypt, verify the content hash, unarchive.
    ///
    /// Holds the session lock for its full duration, and always publishes
    /// one final snapshot with `file_received` set, even when an internal
    /// step failed.
    pub async fn receive_and_verify(
        &self,
        chunk_base: &Path,
        dest_dir: &Path,
    ) -> Result<(), TransferError> {
        let mut state = self.session.lock().await;
        state.file_received = true;

        let result = self.receive_inner(&mut state, chunk_base, dest_dir);

        state.receiver_phase = if result.is_ok() {
            state.finished_successfully = true;
            ReceiverPhase::Done
        } else {
            ReceiverPhase::Failed
        };
        state.publish().await;
        result
    }

    fn receive_inner(
        &self,
        state: &mut SessionState,
        chunk_base: &Path,
        dest_dir: &Path,
    ) -> Result<(), TransferError> {
        state.receiver_phase = ReceiverPhase::Reassembling;
        let chunk_paths: Vec<PathBuf> = (0..state.ports.len())
            .map(|index| chunk::chunk_path(chunk_base, index))
            .collect();

        debug!("joining {} chunks into {}", chunk_paths.len(), chunk_base.display());
        let joined = TempArtifact::new(chunk_base.to_path_buf());
        chunk::join(&chunk_paths, joined.path(), true)?;

        let key = state.shared_secret.session_key()?;

        let metadata = if let Some(md) = &state.file_metadata {
            md.clone()
        } else {
            let envelope = cryptography::decrypt_bytes(&state.encrypted_file_metadata, &key)?;
            let md: FileMetadata = serde_json::from_slice(&envelope)
                .map_err(|e| TransferError::Format(e.to_string()))?;
            state.file_metadata = Some(md.clone());
            md
        };

        state.receiver_phase = ReceiverPhase::Decrypting;
        let plain = if metadata.is_encrypted {
            let decrypted = TempArtifact::new(archive::temp_file_name(
                &self.config.staging_dir,
                "plain",
            ));
            cryptography::decrypt_file(joined.path(), decrypted.path(), &key)?;
            // The encrypted form is superseded; drop removes it.
            drop(joined);
            decrypted
        } else {
            joined
        };

        state.receiver_phase = ReceiverPhase::Verifying;
        debug!("checking hash");
        let (actual, _) = archive::identity(plain.path())?;
        if actual != metadata.content_hash {
            // The guard removes the corrupt reconstruction on return.
            return Err(TransferError::Integrity {
                expected: metadata.content_hash,
                actual,
            });
        }
        debug!("hashes match");

        state.receiver_phase = ReceiverPhase::Unarchiving;
        archive::restore(plain.path(), dest_dir)?;
        drop(plain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_artifact_removes_on_drop() {
        let path = std::env::temp_dir().join(format!("artifact_drop_{}", std::process::id()));
        fs::write(&path, b"transient").unwrap();

        {
            let _artifact = TempArtifact::new(path.clone());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_temp_artifact_release_keeps_file() {
        let path = std::env::temp_dir().join(format!("artifact_keep_{}", std::process::id()));
        fs::write(&path, b"kept").unwrap();

        let artifact = TempArtifact::new(path.clone());
        let released = artifact.release();
        assert_eq!(released, path);
        assert!(path.exists());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_default_config_points_at_temp_dir() {
        let config = TransferConfig::default();
        assert!(config.use_encryption);
        assert!(config.use_compression);
        assert_eq!(config.staging_dir, std::env::temp_dir());
    }
}
