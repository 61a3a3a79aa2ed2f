use shared::{
    domain::{ConversationId, MessageId},
    error::ChannelErrorCode,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("push channel is not connected")]
    NotConnected,
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("{}", .0.describe())]
    Authorization(ChannelErrorCode),
    /// The optimistic entry has been rolled back; `draft` is the text to restore.
    #[error("failed to send message in {conversation_id}: {reason}")]
    SendFailed {
        conversation_id: ConversationId,
        temp_id: MessageId,
        draft: String,
        reason: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Draft text to put back into the compose field, if any.
    pub fn draft(&self) -> Option<&str> {
        match self {
            Self::SendFailed { draft, .. } => Some(draft),
            _ => None,
        }
    }
}
