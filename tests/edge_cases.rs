//! Malformed and boundary inputs for the value codec and message layers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::{BufMut, Bytes, BytesMut};

use quassel_protocol::core::features::{FeatureSet, QuasselFeature};
use quassel_protocol::core::models::MsgId;
use quassel_protocol::core::serializer::SerializerRegistry;
use quassel_protocol::core::variant::QVariant;
use quassel_protocol::error::{constants, ProtocolError};
use quassel_protocol::protocol::handshake::HandshakeMessage;
use quassel_protocol::protocol::signal_proxy::SignalProxyMessage;

const USER_TYPE: i32 = 127;

fn decode(raw: BytesMut) -> Result<QVariant, ProtocolError> {
    SerializerRegistry::standard().deserialize(&mut raw.freeze(), &FeatureSet::all())
}

/// A frame payload holding a `QVariantList` of the given boxed values.
fn list_payload(items: &[QVariant]) -> Bytes {
    let registry = SerializerRegistry::standard();
    let mut buf = BytesMut::new();
    registry
        .serialize_list(&mut buf, items, &FeatureSet::none())
        .unwrap();
    buf.freeze()
}

#[test]
fn test_unknown_wire_type() {
    let mut raw = BytesMut::new();
    raw.put_i32(999);
    raw.put_u8(0);
    assert!(matches!(decode(raw), Err(ProtocolError::UnknownWireType(999))));
}

#[test]
fn test_unknown_user_type() {
    let mut raw = BytesMut::new();
    raw.put_i32(USER_TYPE);
    raw.put_u8(0);
    raw.put_i32(6);
    raw.put_slice(b"Bogus\0");
    assert!(matches!(
        decode(raw),
        Err(ProtocolError::UnknownCustomType(name)) if name == "Bogus"
    ));
}

#[test]
fn test_null_user_type_name() {
    let mut raw = BytesMut::new();
    raw.put_i32(USER_TYPE);
    raw.put_u8(0);
    raw.put_i32(-1);
    assert!(matches!(
        decode(raw),
        Err(ProtocolError::MalformedValue(text)) if text == constants::ERR_NULL_TYPE_NAME
    ));
}

#[test]
fn test_truncated_int() {
    let mut raw = BytesMut::new();
    raw.put_i32(2);
    raw.put_u8(0);
    raw.put_u16(7);
    assert!(matches!(
        decode(raw),
        Err(ProtocolError::Truncated { needed: 4, remaining: 2 })
    ));
}

#[test]
fn test_string_length_past_end() {
    let mut raw = BytesMut::new();
    raw.put_i32(10);
    raw.put_u8(0);
    raw.put_i32(100);
    raw.put_u16(0x41);
    assert!(matches!(decode(raw), Err(ProtocolError::Truncated { .. })));
}

#[test]
fn test_negative_list_count() {
    let mut raw = BytesMut::new();
    raw.put_i32(9);
    raw.put_u8(0);
    raw.put_i32(-5);
    assert!(matches!(decode(raw), Err(ProtocolError::MalformedValue(_))));
}

#[test]
fn test_huge_list_count_does_not_preallocate() {
    let mut raw = BytesMut::new();
    raw.put_i32(9);
    raw.put_u8(0);
    raw.put_i32(i32::MAX);
    assert!(matches!(decode(raw), Err(ProtocolError::Truncated { .. })));
}

#[test]
fn test_null_and_empty_strings_differ() {
    let registry = SerializerRegistry::standard();
    for value in [QVariant::QString(None), QVariant::QString(Some(String::new()))] {
        let mut buf = BytesMut::new();
        registry.serialize(&mut buf, &value, &FeatureSet::none()).unwrap();
        let decoded = registry
            .deserialize(&mut buf.freeze(), &FeatureSet::none())
            .unwrap();
        assert_eq!(decoded, value);
    }
}

#[test]
fn test_msg_id_width_follows_features() {
    let registry = SerializerRegistry::standard();
    let long = FeatureSet::from_features([QuasselFeature::LongMessageId]);

    let mut wide = BytesMut::new();
    registry
        .serialize(&mut wide, &QVariant::MsgId(MsgId(1 << 40)), &long)
        .unwrap();
    let mut narrow = BytesMut::new();
    registry
        .serialize(&mut narrow, &QVariant::MsgId(MsgId(5)), &FeatureSet::none())
        .unwrap();
    assert_eq!(wide.len(), narrow.len() + 4);

    let decoded = registry.deserialize(&mut wide.freeze(), &long).unwrap();
    assert_eq!(decoded, QVariant::MsgId(MsgId(1 << 40)));
}

#[test]
fn test_unregistered_type_cannot_be_written() {
    let registry = SerializerRegistry::empty();
    let mut buf = BytesMut::new();
    let result = registry.serialize(&mut buf, &QVariant::Int(1), &FeatureSet::none());
    assert!(matches!(result, Err(ProtocolError::UnknownWireType(2))));
}

#[test]
fn test_odd_handshake_list() {
    let payload = list_payload(&[
        QVariant::byte_string("MsgType"),
        QVariant::from("ClientLoginAck"),
        QVariant::byte_string("Dangling"),
    ]);
    let result = HandshakeMessage::deserialize(payload, &SerializerRegistry::standard(), &FeatureSet::none());
    assert!(matches!(
        result,
        Err(ProtocolError::MalformedValue(text)) if text == constants::ERR_ODD_HANDSHAKE_LIST
    ));
}

#[test]
fn test_handshake_without_msg_type() {
    let payload = list_payload(&[QVariant::byte_string("User"), QVariant::from("alice")]);
    let result = HandshakeMessage::deserialize(payload, &SerializerRegistry::standard(), &FeatureSet::none());
    assert!(matches!(
        result,
        Err(ProtocolError::MalformedValue(text)) if text == constants::ERR_MISSING_MSG_TYPE
    ));
}

#[test]
fn test_unknown_handshake_type() {
    let payload = list_payload(&[QVariant::byte_string("MsgType"), QVariant::from("ClientShrug")]);
    let result = HandshakeMessage::deserialize(payload, &SerializerRegistry::standard(), &FeatureSet::none());
    assert!(matches!(
        result,
        Err(ProtocolError::UnexpectedMessage(kind)) if kind == "ClientShrug"
    ));
}

#[test]
fn test_handshake_accepts_string_keys() {
    let payload = list_payload(&[
        QVariant::from("MsgType"),
        QVariant::from("ClientLoginReject"),
        QVariant::from("Error"),
        QVariant::from("Invalid password"),
    ]);
    let message = HandshakeMessage::deserialize(payload, &SerializerRegistry::standard(), &FeatureSet::none()).unwrap();
    assert_eq!(
        message,
        HandshakeMessage::ClientLoginReject {
            error: Some("Invalid password".into())
        }
    );
}

#[test]
fn test_empty_signal_proxy_list() {
    let result = SignalProxyMessage::deserialize(list_payload(&[]), &SerializerRegistry::standard(), &FeatureSet::none());
    assert!(matches!(
        result,
        Err(ProtocolError::MalformedValue(text)) if text == constants::ERR_EMPTY_SIGNAL_PROXY
    ));
}

#[test]
fn test_unknown_signal_proxy_type() {
    let result = SignalProxyMessage::deserialize(
        list_payload(&[QVariant::Int(42)]),
        &SerializerRegistry::standard(),
        &FeatureSet::none(),
    );
    assert!(matches!(result, Err(ProtocolError::MalformedValue(_))));
}

#[test]
fn test_sync_with_missing_names() {
    let result = SignalProxyMessage::deserialize(
        list_payload(&[QVariant::Int(1), QVariant::byte_string("Network")]),
        &SerializerRegistry::standard(),
        &FeatureSet::none(),
    );
    assert!(result.is_err());
}

#[test]
fn test_dispatch_and_handshake_error_classes() {
    assert!(ProtocolError::SyncableNotFound {
        class_name: "Network".into(),
        object_name: "1".into()
    }
    .is_dispatch_error());
    assert!(!ProtocolError::ConnectionClosed.is_dispatch_error());
    assert!(ProtocolError::LoginError("nope".into()).is_handshake_error());
    assert!(!ProtocolError::Timeout.is_handshake_error());
}
