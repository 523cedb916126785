use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluation::Evaluation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    Ai,
    User,
    FinalPrompt,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Addresses a session in the store: anonymous sessions have no user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRef {
    pub id: String,
    pub user_id: Option<String>,
}

impl SessionRef {
    pub fn new(id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
    pub status: SessionStatus,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    #[serde(default)]
    pub evaluation: Option<Evaluation>,
}

impl Session {
    /// A fresh active session. Without a usable `name`, `default_name` is
    /// called with the local `YYYY-MM-DD HH:MM` timestamp.
    pub fn new(name: Option<String>, user_id: Option<String>, default_name: impl FnOnce(String) -> String) -> Self {
        let now = Utc::now();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(Local::now().format("%Y-%m-%d %H:%M").to_string()));
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            user_id,
            created_at: now,
            updated_at: now,
            message_count: 0,
            status: SessionStatus::Active,
            last_message: None,
            messages: Vec::new(),
            evaluation: None,
        }
    }

    pub fn session_ref(&self) -> SessionRef {
        SessionRef::new(self.id.clone(), self.user_id.clone())
    }

    pub fn push_message(&mut self, message: SessionMessage) {
        self.last_message = Some(message.content.clone());
        self.messages.push(message);
        self.message_count = self.messages.len();
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_default_name() {
        let session = Session::new(None, None, |ts| format!("Session {ts}"));
        assert!(session.name.starts_with("Session "));
        assert_eq!(session.status, SessionStatus::Active);
        assert!(Uuid::parse_str(&session.id).is_ok());

        let named = Session::new(Some("Aria".to_string()), Some("u1".to_string()), |ts| ts);
        assert_eq!(named.name, "Aria");
        assert_eq!(named.session_ref().user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_blank_name_uses_default() {
        let session = Session::new(Some("   ".to_string()), None, |_| "fallback".to_string());
        assert_eq!(session.name, "fallback");
    }

    #[test]
    fn test_push_message_updates_counters() {
        let mut session = Session::new(None, None, |ts| ts);
        session.push_message(SessionMessage::new(MessageKind::User, "hello"));
        session.push_message(SessionMessage::new(MessageKind::Ai, "hi there"));
        assert_eq!(session.message_count, 2);
        assert_eq!(session.last_message.as_deref(), Some("hi there"));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&SessionStatus::Completed).unwrap(), "\"completed\"");
        assert_eq!(serde_json::to_string(&MessageKind::FinalPrompt).unwrap(), "\"final_prompt\"");
    }
}
