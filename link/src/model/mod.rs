use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::ser::Serializer;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::TryFrom;
use thiserror::Error;

/// Message annotation carrying the broker assigned sequence number.
pub const SEQUENCE_NUMBER_ANNOTATION: &str = "x-opt-sequence-number";
/// Message annotation carrying the enqueue time (ms since the Unix epoch).
pub const ENQUEUED_TIME_ANNOTATION: &str = "x-opt-enqueued-time";
/// Message annotation carrying the stream offset.
pub const OFFSET_ANNOTATION: &str = "x-opt-offset";
/// Message annotation carrying the partition key.
pub const PARTITION_KEY_ANNOTATION: &str = "x-opt-partition-key";

/// Value of a message annotation or application property.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    String(String),
    Long(i64),
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
    Bool(bool),
}

/// One transfer as handed over by the transport once all of its frames
/// have arrived.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub tag: Vec<u8>,
    pub body: Vec<u8>,
    pub message_annotations: HashMap<String, AnnotationValue>,
    pub application_properties: HashMap<String, AnnotationValue>,
}

impl Delivery {
    pub fn new(tag: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: tag.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: AnnotationValue) -> Self {
        self.message_annotations.insert(key.into(), value);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: AnnotationValue) -> Self {
        self.application_properties.insert(key.into(), value);
        self
    }
}

/// A message decoded from a [`Delivery`], with broker metadata attached.
///
/// # Examples
///
/// ```no_run
/// use link::model::{AnnotationValue, Delivery, ReceivedMessage, SEQUENCE_NUMBER_ANNOTATION};
///
/// let delivery = Delivery::new(vec![1], br#"{"id": 7}"#.to_vec())
///     .with_annotation(SEQUENCE_NUMBER_ANNOTATION, AnnotationValue::Long(42));
/// let message = ReceivedMessage::try_from(delivery)?;
/// assert_eq!(message.sequence_number, Some(42));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct ReceivedMessage {
    /// Sequence number assigned by the broker
    pub sequence_number: Option<i64>,
    /// When the message was enqueued
    pub enqueued_time: Option<DateTime<Utc>>,
    /// Position of the message in the partition stream
    pub offset: Option<String>,
    pub partition_key: Option<String>,
    #[serde(skip)]
    pub delivery_tag: Vec<u8>,
    /// The message body content
    pub body: BodyData,
    pub application_properties: HashMap<String, AnnotationValue>,
}

impl ReceivedMessage {
    /// Parses the message body.
    ///
    /// Attempts JSON first and falls back to raw string data.
    fn parse_body(bytes: &[u8]) -> BodyData {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(val) => BodyData::ValidJson(val),
            Err(_) => BodyData::RawString(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    fn sequence_number(
        annotations: &HashMap<String, AnnotationValue>,
    ) -> Result<Option<i64>, MessageDecodeError> {
        match annotations.get(SEQUENCE_NUMBER_ANNOTATION) {
            None => Ok(None),
            Some(AnnotationValue::Long(value)) => Ok(Some(*value)),
            Some(_) => Err(MessageDecodeError::InvalidAnnotation {
                key: SEQUENCE_NUMBER_ANNOTATION,
                expected: "long",
            }),
        }
    }

    fn enqueued_time(
        annotations: &HashMap<String, AnnotationValue>,
    ) -> Result<Option<DateTime<Utc>>, MessageDecodeError> {
        let millis = match annotations.get(ENQUEUED_TIME_ANNOTATION) {
            None => return Ok(None),
            Some(AnnotationValue::Timestamp(millis)) | Some(AnnotationValue::Long(millis)) => {
                *millis
            }
            Some(_) => {
                return Err(MessageDecodeError::InvalidAnnotation {
                    key: ENQUEUED_TIME_ANNOTATION,
                    expected: "timestamp",
                });
            }
        };

        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Some)
            .ok_or(MessageDecodeError::TimestampOutOfRange(millis))
    }

    fn partition_key(
        annotations: &HashMap<String, AnnotationValue>,
    ) -> Result<Option<String>, MessageDecodeError> {
        match annotations.get(PARTITION_KEY_ANNOTATION) {
            None => Ok(None),
            Some(AnnotationValue::String(key)) => Ok(Some(key.clone())),
            Some(_) => Err(MessageDecodeError::InvalidAnnotation {
                key: PARTITION_KEY_ANNOTATION,
                expected: "string",
            }),
        }
    }

    fn offset(
        annotations: &HashMap<String, AnnotationValue>,
    ) -> Result<Option<String>, MessageDecodeError> {
        match annotations.get(OFFSET_ANNOTATION) {
            None => Ok(None),
            Some(AnnotationValue::String(value)) => Ok(Some(value.clone())),
            Some(AnnotationValue::Long(value)) => Ok(Some(value.to_string())),
            Some(_) => Err(MessageDecodeError::InvalidAnnotation {
                key: OFFSET_ANNOTATION,
                expected: "string",
            }),
        }
    }
}

/// Represents the body content of a received message.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyData {
    /// Message body contains valid JSON data
    ValidJson(Value),
    /// Message body contains raw string data (including invalid JSON)
    RawString(String),
}

impl Serialize for BodyData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            BodyData::ValidJson(val) => val.serialize(serializer),
            BodyData::RawString(s) => serializer.serialize_str(s),
        }
    }
}

/// Errors that can occur when decoding a [`Delivery`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageDecodeError {
    #[error("Annotation '{key}' has an unexpected type, expected {expected}")]
    InvalidAnnotation {
        key: &'static str,
        expected: &'static str,
    },

    #[error("Enqueued time {0}ms is out of range")]
    TimestampOutOfRange(i64),
}

impl TryFrom<Delivery> for ReceivedMessage {
    type Error = MessageDecodeError;

    fn try_from(delivery: Delivery) -> Result<Self, Self::Error> {
        let annotations = &delivery.message_annotations;
        let sequence_number = Self::sequence_number(annotations)?;
        let enqueued_time = Self::enqueued_time(annotations)?;
        let offset = Self::offset(annotations)?;
        let partition_key = Self::partition_key(annotations)?;

        Ok(Self {
            sequence_number,
            enqueued_time,
            offset,
            partition_key,
            body: Self::parse_body(&delivery.body),
            delivery_tag: delivery.tag,
            application_properties: delivery.application_properties,
        })
    }
}
