use shared::{
    domain::{CallType, ConversationId, Message, MessageId, UserId},
    error::ChannelError,
    protocol::{CallSignal, RawMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Domain events published by the connection manager.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    MessageReceived {
        conversation_id: ConversationId,
        message: RawMessage,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ConversationCleared {
        conversation_id: ConversationId,
    },
    BlockUpdated {
        conversation_id: ConversationId,
        blocked_by: Vec<UserId>,
    },
    Signal {
        from: UserId,
        call_type: CallType,
        signal: CallSignal,
    },
    ConnectionStateChanged(SessionState),
    ChannelError(ChannelError),
    Error(String),
}

/// Events published by the chat session once the conversation logs reflect them.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    MessageAppended {
        conversation_id: ConversationId,
        message: Message,
    },
    MessageConfirmed {
        conversation_id: ConversationId,
        temp_id: MessageId,
        message: Message,
    },
    MessageFailed {
        conversation_id: ConversationId,
        temp_id: MessageId,
        draft: String,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ConversationCleared {
        conversation_id: ConversationId,
    },
    BlockUpdated {
        conversation_id: ConversationId,
        blocked_by: Vec<UserId>,
    },
    Signal {
        from: UserId,
        call_type: CallType,
        signal: CallSignal,
    },
    ConnectionStateChanged(SessionState),
    ChannelError(ChannelError),
    Error(String),
}
