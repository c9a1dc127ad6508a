use crate::config::LocalIdentity;
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Тип аннотации поверх видео
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnotationType {
    Arrow,
    Circle,
    Rectangle,
    Freehand,
}

/// Точка в нормализованных координатах кадра, обе оси в [0, 1]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    /// Координаты за пределами кадра прижимаются к границе
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }

    pub fn is_normalized(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Annotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AnnotationType,
    pub points: Vec<Point>,
    /// Упакованный ARGB
    pub color: i32,
    pub timestamp: i64,
}

impl Annotation {
    pub fn new(kind: AnnotationType, points: Vec<Point>, color: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            points,
            color,
            timestamp: now_millis(),
        }
    }

    /// Пустые и выходящие за кадр аннотации от удалённой стороны не принимаем
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.points.is_empty() && self.points.iter().all(Point::is_normalized)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(sender: &LocalIdentity, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender.user_id.clone(),
            sender_name: sender.display_name.clone(),
            text: text.into(),
            timestamp: now_millis(),
        }
    }
}

/// Ссылка на файл, уже доступный по URL
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SharedFileRef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub url: String,
    pub size: u64,
    pub sender_id: String,
    pub sender_name: String,
    pub timestamp: i64,
}

/// Итог звонка, пишется в журнал один раз при завершении
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallLogRecord {
    pub call_id: String,
    pub user_id: String,
    pub user_name: String,
    /// Собеседник: id пользователя при исходящем звонке, комната при ответе
    pub peer: String,
    pub start_time: i64,
    pub duration_seconds: u64,
    pub timestamp: i64,
}
