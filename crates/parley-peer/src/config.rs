pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const MESSAGE_CHANNEL_LABEL: &str = "message";
pub const FILE_CHANNEL_LABEL: &str = "file";

/// Endpoint-side tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Bytes per file chunk written to the file channel.
    pub chunk_size: usize,
    /// Label of the chat data channel.
    pub message_label: String,
    /// Label of the file data channel.
    pub file_label: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            message_label: MESSAGE_CHANNEL_LABEL.to_string(),
            file_label: FILE_CHANNEL_LABEL.to_string(),
        }
    }
}

impl PeerConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}
