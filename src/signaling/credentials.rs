use crate::error::{CallError, Result};
use async_trait::async_trait;

/// Переменная окружения с токеном для [`EnvTokenProvider`]
pub const ENV_TOKEN: &str = "ARCALL_TOKEN";

/// Источник bearer-токена. Значения по умолчанию нет: без провайдера
/// запросы к серверу не выполняются.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Токен, полученный заранее (например, после входа по QR-коду)
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(CallError::Credentials("token is empty".into()));
        }
        Ok(self.token.clone())
    }
}

/// Читает токен из окружения на каждый запрос
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new(ENV_TOKEN)
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn token(&self) -> Result<String> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(CallError::Credentials(format!("{} is not set", self.var))),
        }
    }
}
