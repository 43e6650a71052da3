use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::session::FileMetadata;

/// Human-facing collaborator, shown the code phrase and metadata once a
/// payload is prepared. Never on a blocking path.
#[async_trait]
pub trait TransferDisplay: Send + Sync {
    async fn show_intro(&self, code_phrase: u32, metadata: &FileMetadata);
}

/// Default display, printing to the terminal.
pub struct ConsoleDisplay;

#[async_trait]
impl TransferDisplay for ConsoleDisplay {
    async fn show_intro(&self, code_phrase: u32, metadata: &FileMetadata) {
        let kind = if metadata.is_directory { "folder" } else { "file" };
        println!("Code phrase (copied to clipboard): \x1b[4m\x1b[1m{}\x1b[0m", code_phrase);
        println!("Sending {} '{}' ({} bytes)", kind, metadata.name, metadata.size);
    }
}

/// Fire-and-forget intro notification on a detached task. Failure or
/// slowness here never affects transfer state.
pub fn notify_intro(display: Arc<dyn TransferDisplay>, code_phrase: u32, metadata: FileMetadata) {
    tokio::spawn(async move {
        display.show_intro(code_phrase, &metadata).await;
        debug!("intro shown for '{}'", metadata.name);
    });
}
