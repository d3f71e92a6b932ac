//! Handshake phases and their wire payloads.
//!
//! | Phase | Filter key | Request | Response |
//! |---|---|---|---|
//! | Discover | server identity | any | `{server}` |
//! | Accept | server identity | `{server}` | `{key}` |
//! | NewChat | client session | `{chat?}` | `{server, key}` |
//! | RegisterDevice | chat session | `{device}` | `{server}` |
//! | SendNotification | chat session | any JSON | none |

use serde::{Deserialize, Serialize};

use crate::constants::{
    PHASE_ACCEPT, PHASE_DISCOVER, PHASE_NEW_CHAT, PHASE_REGISTER_DEVICE, PHASE_SEND_NOTIFICATION,
};
use crate::topic::{derive_topic, TopicId};

/// One step of the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Client looks for a server.
    Discover,
    /// Client asks the named server for a client session.
    Accept,
    /// Client session holder asks for a chat session.
    NewChat,
    /// Chat key holder registers a device token.
    RegisterDevice,
    /// Chat key holder asks for a notification to everyone else.
    SendNotification,
}

impl Phase {
    /// Every phase, in handshake order.
    pub const ALL: [Phase; 5] = [
        Phase::Discover,
        Phase::Accept,
        Phase::NewChat,
        Phase::RegisterDevice,
        Phase::SendNotification,
    ];

    /// Protocol name the topic is derived from.
    pub fn name(self) -> &'static str {
        match self {
            Self::Discover => PHASE_DISCOVER,
            Self::Accept => PHASE_ACCEPT,
            Self::NewChat => PHASE_NEW_CHAT,
            Self::RegisterDevice => PHASE_REGISTER_DEVICE,
            Self::SendNotification => PHASE_SEND_NOTIFICATION,
        }
    }

    /// Transport topic of this phase.
    pub fn topic(self) -> TopicId {
        derive_topic(self.name())
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Phase topics, derived once per service.
#[derive(Clone, Copy, Debug)]
pub struct PhaseTopics([TopicId; 5]);

impl PhaseTopics {
    /// Derive all five topics.
    pub fn derive() -> Self {
        Self(Phase::ALL.map(Phase::topic))
    }

    /// Topic of `phase`.
    pub fn get(&self, phase: Phase) -> TopicId {
        self.0[phase as usize]
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Body naming a server: Accept request, Discover and RegisterDevice responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPayload {
    /// Server id.
    pub server: String,
}

/// Accept response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPayload {
    /// `0x` hex of the client session key.
    pub key: String,
}

/// NewChat request. An empty body is accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatRequest {
    /// Application-level chat id.
    #[serde(default)]
    pub chat: Option<String>,
}

/// NewChat response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatResponse {
    /// Server id.
    pub server: String,
    /// `0x` hex of the chat key.
    pub key: String,
}

/// RegisterDevice request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDeviceRequest {
    /// Push token of the requester's device.
    #[serde(default)]
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_phase_topics_are_distinct_and_indexed() {
        let topics = PhaseTopics::derive();
        let distinct: HashSet<_> = Phase::ALL.iter().map(|p| topics.get(*p)).collect();
        assert_eq!(distinct.len(), Phase::ALL.len());
        for phase in Phase::ALL {
            assert_eq!(topics.get(phase), derive_topic(phase.name()));
        }
    }

    #[test]
    fn test_new_chat_request_accepts_missing_chat() {
        let request: NewChatRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.chat, None);
        let request: NewChatRequest = serde_json::from_str(r#"{"chat":"c1"}"#).unwrap();
        assert_eq!(request.chat.as_deref(), Some("c1"));
    }

    #[test]
    fn test_new_chat_response_shape() {
        let body = serde_json::to_value(NewChatResponse {
            server: "abc".to_string(),
            key: "0x00".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"server": "abc", "key": "0x00"}));
    }
}
