pub mod client;
pub mod error;
pub mod types;

use std::future::Future;

pub use client::AnthropicClient;
pub use error::AnthropicError;
pub use types::{ContentBlock, Message, MessagesRequest, MessagesResponse, Usage};

/// Anything that can answer a Messages API request.
///
/// Implemented by [`AnthropicClient`] and by test mocks. The returned future
/// must be `Send` so drains can run on spawned tasks.
pub trait MessageSender: Send + Sync {
    fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> impl Future<Output = Result<MessagesResponse, AnthropicError>> + Send;
}

impl MessageSender for AnthropicClient {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        AnthropicClient::send_message(self, req).await
    }
}
