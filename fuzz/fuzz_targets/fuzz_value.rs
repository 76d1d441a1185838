#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use quassel_protocol::core::features::FeatureSet;
use quassel_protocol::core::serializer::SerializerRegistry;

fuzz_target!(|data: &[u8]| {
    let registry = SerializerRegistry::standard();
    // Feature-dependent layouts (MsgId, Message) decode differently per set
    for features in [FeatureSet::none(), FeatureSet::all()] {
        let mut input = Bytes::copy_from_slice(data);
        if let Ok(value) = registry.deserialize(&mut input, &features) {
            // Anything that decodes must encode again
            let mut out = BytesMut::new();
            assert!(registry.serialize(&mut out, &value, &features).is_ok());
        }
    }
});
