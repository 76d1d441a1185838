#![no_main]

use libfuzzer_sys::fuzz_target;
use quassel_protocol::transport::compression::DeflateStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fuzz_target!(|data: &[u8]| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    rt.block_on(async {
        // Arbitrary bytes on the compressed side: errors are fine, panics are not
        let mut reader = DeflateStream::new(data, 6);
        let mut sink = Vec::new();
        let _ = reader.read_to_end(&mut sink).await;

        let mut writer = DeflateStream::new(Vec::new(), 6);
        if writer.write_all(data).await.is_err() || writer.flush().await.is_err() {
            return;
        }
        let compressed = writer.into_inner();
        let mut reader = DeflateStream::new(compressed.as_slice(), 6);
        let mut restored = vec![0u8; data.len()];
        assert!(reader.read_exact(&mut restored).await.is_ok());
        assert_eq!(restored, data);
    });
});
