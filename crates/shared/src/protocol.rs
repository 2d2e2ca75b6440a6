use std::fmt;

use serde::{
    de::{self, value::MapAccessDeserializer, IgnoredAny, MapAccess, SeqAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};

use crate::error::ApiError;

// RFC 6455 §7.4.1 close codes.
pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const INTERNAL_ERROR: u16 = 1011;

pub fn is_normal_closure(code: u16) -> bool {
    code == NORMAL_CLOSURE
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NestedEnvelope {
    #[serde(default, rename = "type", deserialize_with = "string_or_none")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "string_or_none")]
    pub code: Option<String>,
}

/// Minimal routing view of an inbound socket message.
///
/// Deserializing this skips everything except `type`, `payload.type` and
/// `payload.code`, so routers can decide whether a message is theirs before
/// paying for a full payload decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "nested_or_none")]
    pub payload: Option<NestedEnvelope>,
}

// `payload.code` may be an HTTP status number and `payload.type` anything at
// all; neither may stop the direct `type` from routing.
fn string_or_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => Some(text),
        _ => None,
    })
}

// A `payload` that is not an object (string, array, number) carries no
// routing fields but must not make the whole envelope unparseable.
fn nested_or_none<'de, D>(deserializer: D) -> Result<Option<NestedEnvelope>, D::Error>
where
    D: Deserializer<'de>,
{
    struct NestedVisitor;

    impl<'de> Visitor<'de> for NestedVisitor {
        type Value = Option<NestedEnvelope>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("any JSON value")
        }

        fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Self::Value, A::Error> {
            NestedEnvelope::deserialize(MapAccessDeserializer::new(map)).map(Some)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            while seq.next_element::<IgnoredAny>()?.is_some() {}
            Ok(None)
        }

        fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(NestedVisitor)
}

impl Envelope {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// The direct `type` field, falling back to `payload.type`.
    pub fn discriminator(&self) -> Option<&str> {
        self.kind.as_deref().or_else(|| {
            self.payload
                .as_ref()
                .and_then(|nested| nested.kind.as_deref())
        })
    }

    pub fn error_code(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|nested| nested.code.as_deref())
    }
}

/// Server-side error event as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ErrorEvent {
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn prefers_direct_type_over_nested_type() {
        let envelope =
            Envelope::parse(r#"{"type":"outer","payload":{"type":"inner"}}"#).expect("envelope");
        assert_eq!(envelope.discriminator(), Some("outer"));
    }

    #[test]
    fn falls_back_to_nested_type() {
        let envelope =
            Envelope::parse(r#"{"payload":{"type":"typing","room":4}}"#).expect("envelope");
        assert_eq!(envelope.discriminator(), Some("typing"));
    }

    #[test]
    fn reads_error_code_from_error_event() {
        let text = serde_json::to_string(&ErrorEvent::Error(ApiError::new(
            ErrorCode::RateLimited,
            "slow down",
        )))
        .expect("json");
        let envelope = Envelope::parse(&text).expect("envelope");
        assert_eq!(envelope.discriminator(), Some("error"));
        assert_eq!(envelope.error_code(), Some(ErrorCode::RateLimited.as_str()));
    }

    #[test]
    fn tolerates_scalar_payloads() {
        let envelope = Envelope::parse(r#"{"type":"note","payload":"hi"}"#).expect("envelope");
        assert_eq!(envelope.discriminator(), Some("note"));
        assert_eq!(envelope.payload, None);

        let envelope =
            Envelope::parse(r#"{"type":"batch","payload":[1,{"a":2}]}"#).expect("envelope");
        assert_eq!(envelope.discriminator(), Some("batch"));
    }

    #[test]
    fn non_string_nested_fields_do_not_block_direct_type() {
        let envelope =
            Envelope::parse(r#"{"type":"http_status","payload":{"code":404}}"#).expect("envelope");
        assert_eq!(envelope.discriminator(), Some("http_status"));
        assert_eq!(envelope.error_code(), None);

        let envelope =
            Envelope::parse(r#"{"type":"http_status","payload":{"type":7}}"#).expect("envelope");
        assert_eq!(envelope.discriminator(), Some("http_status"));

        let envelope = Envelope::parse(r#"{"payload":{"type":null}}"#).expect("envelope");
        assert_eq!(envelope.discriminator(), None);
    }

    #[test]
    fn rejects_non_object_messages() {
        assert!(Envelope::parse("not json").is_none());
        assert!(Envelope::parse("[1,2,3]").is_none());
    }

    #[test]
    fn only_1000_is_normal_closure() {
        assert!(is_normal_closure(NORMAL_CLOSURE));
        assert!(!is_normal_closure(1001));
        assert!(!is_normal_closure(INTERNAL_ERROR));
    }
}
