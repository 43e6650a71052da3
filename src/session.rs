use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::cryptography::SharedSecret;
use crate::sync::StateChannel;

/// Describes the logical payload being transferred.
///
/// `content_hash` is computed over the archived-but-unencrypted blob before
/// encryption, and is the sole end-to-end integrity check: the receiver
/// recomputes it after decryption, before unarchiving. `is_encrypted` is the
/// only field mutated after creation, flipped once encryption is actually
/// applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub is_directory: bool,
    pub is_compressed: bool,
    pub is_encrypted: bool,
    pub size: u64,
    pub content_hash: String,
    /// True only when the source was synthesized from standard input and
    /// must be cleaned up once the send is finalized.
    pub delete_source_after_send: bool,
}

/// The serializable subset of session state pushed through the
/// synchronization channel. Plaintext metadata never travels; only the
/// encrypted envelope does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub ports: Vec<u16>,
    pub encrypted_file_metadata: Vec<u8>,
    pub pending_metadata_send: bool,
    pub file_ready: bool,
    pub file_received: bool,
    pub finished_successfully: bool,
    pub update_pending: bool,
}

/// Sender progress through a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPhase {
    Idle,
    PreparingSend,
    AwaitingKey,
    Encrypting,
    Chunking,
    Announced,
}

/// Receiver progress through a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverPhase {
    Idle,
    AwaitingChunks,
    Reassembling,
    Decrypting,
    Verifying,
    Unarchiving,
    Done,
    Failed,
}

/// The single source of truth for one transfer.
///
/// Lives behind the session lock for its whole lifetime; every read and
/// write goes through [`Session::lock`] or one of the scoped accessors, and
/// the channel is written only under the lock, wrapped in an
/// `update_pending` transition.
pub struct SessionState {
    /// Ordered transport channel identifiers; length determines chunk count.
    pub ports: Vec<u16>,
    pub code_phrase: u32,
    /// `None` until the sender has fully prepared the payload.
    pub file_metadata: Option<FileMetadata>,
    /// Transmitted form of `file_metadata`, sealed with the session key.
    pub encrypted_file_metadata: Vec<u8>,
    pub pending_metadata_send: bool,
    pub file_ready: bool,
    pub file_received: bool,
    pub finished_successfully: bool,
    pub update_pending: bool,
    /// Read-only once the exchange completes; shared freely after that.
    pub shared_secret: Arc<SharedSecret>,
    pub sender_phase: SenderPhase,
    pub receiver_phase: ReceiverPhase,
    /// Archived blob staged by `prepare_outbound` for `finalize_and_announce`.
    pub staged_archive: Option<PathBuf>,
    /// Stdin capture awaiting removal once the send is finalized.
    pub staged_source: Option<PathBuf>,
    channel: Box<dyn StateChannel>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            ports: self.ports.clone(),
            encrypted_file_metadata: self.encrypted_file_metadata.clone(),
            pending_metadata_send: self.pending_metadata_send,
            file_ready: self.file_ready,
            file_received: self.file_received,
            finished_successfully: self.finished_successfully,
            update_pending: self.update_pending,
        }
    }

    /// Pushes one snapshot through the synchronization channel, wrapped in
    /// the `update_pending` transition. Channel errors are logged and never
    /// fatal to the local state transition.
    pub async fn publish(&mut self) {
        self.update_pending = true;
        let snapshot = self.snapshot();
        if let Err(err) = self.channel.publish(snapshot).await {
            warn!("failed to publish session snapshot: {}", err);
        }
        self.update_pending = false;
    }
}

impl Drop for SessionState {
    // A discarded session takes its staged artifacts with it.
    fn drop(&mut self) {
        for staged in [self.staged_archive.take(), self.staged_source.take()]
            .into_iter()
            .flatten()
        {
            let _ = std::fs::remove_file(&staged);
        }
    }
}

/// Lock-guarded wrapper around [`SessionState`], plus the one-shot
/// "metadata published" signal that replaces fixed-interval polling.
pub struct Session {
    state: Mutex<SessionState>,
    metadata_ready: Notify,
}

impl Session {
    pub fn new(
        code_phrase: u32,
        ports: Vec<u16>,
        shared_secret: Arc<SharedSecret>,
        channel: Box<dyn StateChannel>,
    ) -> Arc<Self> {
        Arc::new(Session {
            state: Mutex::new(SessionState {
                ports,
                code_phrase,
                file_metadata: None,
                encrypted_file_metadata: Vec::new(),
                pending_metadata_send: false,
                file_ready: false,
                file_received: false,
                finished_successfully: false,
                update_pending: false,
                shared_secret,
                sender_phase: SenderPhase::Idle,
                receiver_phase: ReceiverPhase::Idle,
                staged_archive: None,
                staged_source: None,
                channel,
            }),
            metadata_ready: Notify::new(),
        })
    }

    /// The one exclusive lock guarding all session state.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Attaches fully prepared metadata and the staged artifacts backing it.
    ///
    /// Setting the metadata is the last mutation under the lock, and the
    /// ready signal fires only after the lock is released, so a waiter never
    /// observes partial state: publication happens-before observation.
    pub async fn publish_metadata(
        &self,
        metadata: FileMetadata,
        archive: PathBuf,
        source: Option<PathBuf>,
    ) {
        {
            let mut state = self.state.lock().await;
            state.staged_archive = Some(archive);
            state.staged_source = source;
            state.file_metadata = Some(metadata);
        }
        self.metadata_ready.notify_waiters();
        debug!("metadata published");
    }

    /// Blocks until metadata has been published, then returns it. Never
    /// returns empty metadata.
    pub async fn wait_for_metadata(&self) -> FileMetadata {
        loop {
            let notified = self.metadata_ready.notified();
            tokio::pin!(notified);
            // Enlist as a waiter before checking, so a publish that lands
            // between the check and the await is not missed.
            notified.as_mut().enable();
            if let Some(metadata) = self.state.lock().await.file_metadata.clone() {
                return metadata;
            }
            notified.await;
        }
    }

    /// Folds a snapshot received from the peer into local state.
    pub async fn apply_snapshot(&self, snapshot: SessionSnapshot) {
        let mut state = self.state.lock().await;
        state.ports = snapshot.ports;
        state.encrypted_file_metadata = snapshot.encrypted_file_metadata;
        state.file_ready = snapshot.file_ready;
        if state.file_ready && state.receiver_phase == ReceiverPhase::Idle {
            state.receiver_phase = ReceiverPhase::AwaitingChunks;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptography::create_session_id;
    use crate::sync::MemoryChannel;
    use std::time::Duration;

    fn test_session(ports: Vec<u16>) -> (Arc<Session>, tokio::sync::mpsc::UnboundedReceiver<SessionSnapshot>) {
        let code_phrase = 123456;
        let identity = create_session_id(code_phrase);
        let secret = Arc::new(SharedSecret::start(code_phrase, &identity));
        let (channel, rx) = MemoryChannel::pair();
        (Session::new(code_phrase, ports, secret, Box::new(channel)), rx)
    }

    fn metadata() -> FileMetadata {
        FileMetadata {
            name: "notes.txt".to_string(),
            is_directory: false,
            is_compressed: true,
            is_encrypted: true,
            size: 42,
            content_hash: "abcd".to_string(),
            delete_source_after_send: false,
        }
    }

    #[tokio::test]
    async fn test_new_session_is_empty() {
        let (session, _rx) = test_session(vec![9001]);
        let state = session.lock().await;
        assert!(state.file_metadata.is_none());
        assert!(!state.file_ready);
        assert!(!state.finished_successfully);
        assert_eq!(state.sender_phase, SenderPhase::Idle);
        assert_eq!(state.receiver_phase, ReceiverPhase::Idle);
    }

    #[tokio::test]
    async fn test_wait_for_metadata_blocks_until_published() {
        let (session, _rx) = test_session(vec![9001]);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_metadata().await })
        };

        // The waiter cannot finish before anything is published.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        session
            .publish_metadata(metadata(), PathBuf::from("/tmp/blob"), None)
            .await;

        let observed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(observed.name, "notes.txt");
    }

    #[tokio::test]
    async fn test_wait_for_metadata_returns_immediately_when_set() {
        let (session, _rx) = test_session(vec![9001]);
        session
            .publish_metadata(metadata(), PathBuf::from("/tmp/blob"), None)
            .await;

        let observed = session.wait_for_metadata().await;
        assert_eq!(observed.size, 42);
    }

    #[tokio::test]
    async fn test_publish_wraps_update_pending() {
        let (session, mut rx) = test_session(vec![9001, 9002]);

        {
            let mut state = session.lock().await;
            state.file_ready = true;
            state.publish().await;
            // Cleared again once the push is done.
            assert!(!state.update_pending);
        }

        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.update_pending);
        assert!(snapshot.file_ready);
        assert_eq!(snapshot.ports, vec![9001, 9002]);
    }

    #[tokio::test]
    async fn test_apply_snapshot_folds_peer_view() {
        let (session, _rx) = test_session(vec![]);
        session
            .apply_snapshot(SessionSnapshot {
                ports: vec![7001, 7002],
                encrypted_file_metadata: vec![9, 9, 9],
                pending_metadata_send: false,
                file_ready: true,
                file_received: false,
                finished_successfully: false,
                update_pending: false,
            })
            .await;

        let state = session.lock().await;
        assert_eq!(state.ports, vec![7001, 7002]);
        assert_eq!(state.encrypted_file_metadata, vec![9, 9, 9]);
        assert!(state.file_ready);
        assert_eq!(state.receiver_phase, ReceiverPhase::AwaitingChunks);
    }
}
