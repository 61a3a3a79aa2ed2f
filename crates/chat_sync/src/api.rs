use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use shared::{
    domain::{Conversation, ConversationKind, MessageId},
    error::ApiError,
    protocol::{HistoryPage, RawMessage, SendMessageRequest, SendMessageResponse},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: u32,
    pub before: Option<MessageId>,
}

/// REST collaborator for conversation history and sends.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn fetch_history(
        &self,
        conversation: &Conversation,
        query: HistoryQuery,
    ) -> Result<Vec<RawMessage>>;
    async fn send_message(&self, conversation: &Conversation, text: &str) -> Result<RawMessage>;
    async fn clear_history(&self, conversation: &Conversation) -> Result<()>;
    async fn set_blocked(&self, conversation: &Conversation, blocked: bool) -> Result<()>;
}

#[derive(Serialize)]
struct ListMessagesQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
}

pub struct HttpConversationApi {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn messages_url(&self, conversation: &Conversation) -> String {
        match &conversation.kind {
            ConversationKind::Direct { partner } => {
                format!("{}/chats/{}/messages", self.base_url, partner)
            }
            ConversationKind::Circle => {
                format!("{}/social/circles/{}/messages", self.base_url, conversation.id)
            }
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Turns a non-2xx response into an error, using the server's `ApiError` body when present.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) if !api_error.message.is_empty() => {
            Err(anyhow!("{status}: {}", api_error.message))
        }
        _ => Err(anyhow!("{status}")),
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_history(
        &self,
        conversation: &Conversation,
        query: HistoryQuery,
    ) -> Result<Vec<RawMessage>> {
        let response = self
            .authorized(self.http.get(self.messages_url(conversation)))
            .query(&ListMessagesQuery {
                limit: query.limit,
                before: query.before.as_ref().map(MessageId::as_str),
            })
            .send()
            .await?;
        let page: HistoryPage = ensure_success(response).await?.json().await?;
        Ok(page.messages)
    }

    async fn send_message(&self, conversation: &Conversation, text: &str) -> Result<RawMessage> {
        let response = self
            .authorized(self.http.post(self.messages_url(conversation)))
            .json(&SendMessageRequest {
                text: text.to_string(),
            })
            .send()
            .await?;
        let body: SendMessageResponse = ensure_success(response).await?.json().await?;
        Ok(body.message)
    }

    async fn clear_history(&self, conversation: &Conversation) -> Result<()> {
        if !matches!(conversation.kind, ConversationKind::Direct { .. }) {
            return Err(anyhow!("clearing history applies to direct conversations"));
        }
        let response = self
            .authorized(self.http.delete(self.messages_url(conversation)))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn set_blocked(&self, conversation: &Conversation, blocked: bool) -> Result<()> {
        let ConversationKind::Direct { partner } = &conversation.kind else {
            return Err(anyhow!("blocking applies to direct conversations"));
        };
        let url = format!("{}/chats/{}/block", self.base_url, partner);
        let request = if blocked {
            self.http.post(url)
        } else {
            self.http.delete(url)
        };
        ensure_success(self.authorized(request).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
