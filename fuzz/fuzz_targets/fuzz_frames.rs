#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use quassel_protocol::core::codec::FrameCodec;
use quassel_protocol::core::features::FeatureSet;
use quassel_protocol::core::serializer::SerializerRegistry;
use quassel_protocol::protocol::handshake::HandshakeMessage;
use quassel_protocol::protocol::signal_proxy::SignalProxyMessage;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let registry = SerializerRegistry::standard();
    let mut codec = FrameCodec::new(64 * 1024);
    let mut input = BytesMut::from(data);
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = codec.decode(&mut input) {
        frames.push(frame);
    }
    // The raw input doubles as a single frame payload
    frames.push(Bytes::copy_from_slice(data));

    for frame in frames {
        let _ = HandshakeMessage::deserialize(frame.clone(), &registry, &FeatureSet::none());
        let _ = SignalProxyMessage::deserialize(frame, &registry, &FeatureSet::all());
    }
});
