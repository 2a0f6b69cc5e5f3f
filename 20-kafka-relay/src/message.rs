use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON body accepted by the HTTP ingress and carried by inbound stream frames.
///
/// Missing fields decode as empty strings so that validation, not the JSON
/// decoder, decides which field is reported as missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub data: String,
}

impl MessagePayload {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Topic is missing")]
    MissingTopic,
    #[error("Data is missing")]
    MissingData,
}

/// A validated message on its way to the broker and to stream subscribers.
///
/// Fields are private: once a `Message` exists it has a non-empty topic and
/// payload, and nothing downstream can change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    key: Option<String>,
    payload: String,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        key: Option<String>,
        payload: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let topic = topic.into();
        let payload = payload.into();

        if topic.is_empty() {
            return Err(ValidationError::MissingTopic);
        }
        if payload.is_empty() {
            return Err(ValidationError::MissingData);
        }

        Ok(Self {
            topic,
            key: key.filter(|key| !key.is_empty()),
            payload,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl TryFrom<MessagePayload> for Message {
    type Error = ValidationError;

    fn try_from(payload: MessagePayload) -> Result<Self, Self::Error> {
        Message::new(payload.topic, Some(payload.key), payload.data)
    }
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    data: &'a str,
}

/// Decodes one inbound stream frame.
pub fn decode_frame(bytes: &[u8]) -> Result<MessagePayload, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Encodes a message as the JSON text frame written to stream clients.
pub fn encode_frame(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundFrame {
        topic: message.topic(),
        key: message.key(),
        data: message.payload(),
    })
}
