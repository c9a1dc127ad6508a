use crate::peer::types::ServerConfig;
use rand::Rng;
use tokio::sync::watch;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Миллисекунды Unix-времени
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Ждёт, пока поколение в `cancel` перестанет быть равным `generation`.
/// Закрытый канал тоже считается отменой.
pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        let changed = *cancel.borrow_and_update() != generation;
        if changed {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
