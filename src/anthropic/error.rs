//! Tipos de erro para o cliente da API Anthropic.
//!
//! Os erros são tipados na origem: o executor de escalonamento decide a
//! categoria de falha pela variante, nunca pelo texto da mensagem.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// A chamada excedeu o timeout configurado para o tier.
    #[error("request timed out")]
    Timeout,

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, corpo ilegível).
    #[error("network error: {0}")]
    NetworkError(String),
}

impl AnthropicError {
    /// Transport-level failures that are worth retrying at the same tier.
    pub fn is_transient(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. }
            | AnthropicError::Timeout
            | AnthropicError::NetworkError(_) => true,
            AnthropicError::ApiError { status, .. } => *status >= 500,
        }
    }
}

impl From<reqwest::Error> for AnthropicError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnthropicError::Timeout
        } else {
            AnthropicError::NetworkError(err.to_string())
        }
    }
}
