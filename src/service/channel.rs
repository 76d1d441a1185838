//! # Message Channel
//!
//! Owns a negotiated stream once framing starts. Two tasks are spawned:
//!
//! - a **writer** draining an unbounded queue of encoded frames, so sending
//!   never blocks and works from synchronous dispatch code
//! - a **reader** cutting frames and feeding them to a chain of
//!   [`ConnectionHandler`]s, one at a time
//!
//! A handler signals it is done by returning `true` from `read`; the next
//! frame then goes to the following handler. The handshake handler finishes
//! on `SessionInit` and hands over to the signal proxy handler for good.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::codec::FrameCodec;
use crate::core::features::FeatureSet;
use crate::core::serializer::SerializerRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::HandshakeMessage;
use crate::protocol::signal_proxy::SignalProxyMessage;
use crate::utils::metrics::Metrics;

/// Serializer registry plus the feature set frames are currently encoded
/// with. The feature set changes once, when the core acknowledges init.
#[derive(Debug)]
pub struct CodecContext {
    registry: SerializerRegistry,
    features: RwLock<Arc<FeatureSet>>,
}

impl CodecContext {
    pub fn new(registry: SerializerRegistry) -> Self {
        Self {
            registry,
            features: RwLock::new(Arc::new(FeatureSet::none())),
        }
    }

    pub fn registry(&self) -> &SerializerRegistry {
        &self.registry
    }

    pub fn features(&self) -> Arc<FeatureSet> {
        match self.features.read() {
            Ok(features) => features.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_features(&self, features: FeatureSet) {
        let mut guard = match self.features.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(features);
    }

    pub fn decode_handshake(&self, payload: Bytes) -> Result<HandshakeMessage> {
        HandshakeMessage::deserialize(payload, &self.registry, &self.features())
    }

    pub fn decode_signal_proxy(&self, payload: Bytes) -> Result<SignalProxyMessage> {
        SignalProxyMessage::deserialize(payload, &self.registry, &self.features())
    }
}

impl Default for CodecContext {
    fn default() -> Self {
        Self::new(SerializerRegistry::standard())
    }
}

/// Non-blocking handle for sending frames. Cheap to clone.
#[derive(Clone)]
pub struct FrameSink {
    sender: mpsc::UnboundedSender<Bytes>,
    context: Arc<CodecContext>,
    metrics: Arc<Metrics>,
}

impl FrameSink {
    pub fn new(
        sender: mpsc::UnboundedSender<Bytes>,
        context: Arc<CodecContext>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sender,
            context,
            metrics,
        }
    }

    /// Queue one raw frame payload.
    pub fn emit(&self, payload: Bytes) -> Result<()> {
        let len = payload.len() as u64;
        self.sender
            .send(payload)
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.metrics.frame_sent(len);
        Ok(())
    }

    pub fn emit_handshake(&self, message: &HandshakeMessage) -> Result<()> {
        trace!(msg_type = message.msg_type(), "Sending handshake message");
        let payload = message.serialize(self.context.registry(), &self.context.features())?;
        self.emit(payload)
    }

    pub fn emit_signal_proxy(&self, message: &SignalProxyMessage) -> Result<()> {
        let payload = message.serialize(self.context.registry(), &self.context.features())?;
        self.emit(payload)
    }

    pub fn context(&self) -> &Arc<CodecContext> {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// One stage of inbound frame processing.
pub trait ConnectionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called when this handler becomes the active one.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Process one frame. `Ok(true)` hands the following frames to the next
    /// handler in the chain.
    fn read(&self, frame: Bytes) -> Result<bool>;

    /// Called once this handler has finished.
    fn done(&self) {}

    /// The connection is gone; fail anything still waiting.
    fn close(&self) {}
}

/// A running connection: the writer and reader tasks plus the sink.
pub struct MessageChannel {
    sink: FrameSink,
    handlers: Arc<Vec<Arc<dyn ConnectionHandler>>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    closed: watch::Receiver<bool>,
}

impl MessageChannel {
    /// A sink and the receiving end its frames are queued on.
    ///
    /// Lets handlers that send be built before the channel exists.
    pub fn outbound(
        context: Arc<CodecContext>,
        metrics: Arc<Metrics>,
    ) -> (FrameSink, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (FrameSink::new(sender, context, metrics), receiver)
    }

    /// Split `stream` and spawn the reader and writer.
    pub fn spawn<S>(
        stream: S,
        context: Arc<CodecContext>,
        handlers: Vec<Arc<dyn ConnectionHandler>>,
        metrics: Arc<Metrics>,
        max_frame_size: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, receiver) = Self::outbound(context, metrics.clone());
        Self::spawn_with_sink(stream, sink, receiver, handlers, metrics, max_frame_size)
    }

    /// Like [`spawn`](Self::spawn) with a sink from [`outbound`](Self::outbound).
    pub fn spawn_with_sink<S>(
        stream: S,
        sink: FrameSink,
        receiver: mpsc::UnboundedReceiver<Bytes>,
        handlers: Vec<Arc<dyn ConnectionHandler>>,
        metrics: Arc<Metrics>,
        max_frame_size: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let codec = FrameCodec::new(max_frame_size);
        let (closed_tx, closed) = watch::channel(false);
        let handlers = Arc::new(handlers);

        let write_task = tokio::spawn(write_loop(FramedWrite::new(writer, codec), receiver));
        let read_task = tokio::spawn(read_loop(
            FramedRead::new(reader, codec),
            handlers.clone(),
            metrics,
            closed_tx,
        ));

        Self {
            sink,
            handlers,
            read_task,
            write_task,
            closed,
        }
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the read loop has ended.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Stop both tasks and fail every pending waiter.
    pub fn close(&self) {
        for handler in self.handlers.iter() {
            handler.close();
        }
        self.read_task.abort();
        self.write_task.abort();
        debug!("Message channel closed");
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

async fn write_loop<W>(mut framed: FramedWrite<W, FrameCodec>, mut receiver: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = receiver.recv().await {
        // `send` writes length and payload, then flushes.
        if let Err(e) = framed.send(frame).await {
            error!(error = %e, "Failed to write frame");
            break;
        }
    }
    trace!("Writer finished");
}

#[instrument(skip_all)]
async fn read_loop<R>(
    mut framed: FramedRead<R, FrameCodec>,
    handlers: Arc<Vec<Arc<dyn ConnectionHandler>>>,
    metrics: Arc<Metrics>,
    closed: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut chain: VecDeque<Arc<dyn ConnectionHandler>> = handlers.iter().cloned().collect();
    let mut current = chain.pop_front();
    if let Some(handler) = &current {
        if let Err(e) = handler.init() {
            error!(handler = handler.name(), error = %e, "Handler failed to start");
            current = None;
        }
    }

    while let Some(handler) = current.clone() {
        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                error!(error = %e, "Failed to read frame");
                break;
            }
            None => {
                info!("Connection closed by peer");
                break;
            }
        };
        metrics.frame_received(frame.len() as u64);

        match handler.read(frame) {
            Ok(false) => {}
            Ok(true) => {
                debug!(handler = handler.name(), "Handler finished");
                handler.done();
                current = chain.pop_front();
                if let Some(next) = &current {
                    if let Err(e) = next.init() {
                        error!(handler = next.name(), error = %e, "Handler failed to start");
                        break;
                    }
                }
            }
            Err(e) if e.is_dispatch_error() => {
                metrics.dispatch_error();
                warn!(handler = handler.name(), error = %e, "Dropped message");
            }
            Err(e) => {
                error!(handler = handler.name(), error = %e, "Closing connection");
                break;
            }
        }
    }

    for handler in handlers.iter() {
        handler.close();
    }
    closed.send_replace(true);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Bytes>>,
        finish_after: usize,
        closed: Mutex<bool>,
    }

    impl ConnectionHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn read(&self, frame: Bytes) -> Result<bool> {
            let mut frames = self.frames.lock().unwrap();
            frames.push(frame);
            Ok(self.finish_after > 0 && frames.len() >= self.finish_after)
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[tokio::test]
    async fn frames_move_along_the_chain() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let first = Arc::new(Recorder {
            finish_after: 1,
            ..Default::default()
        });
        let second = Arc::new(Recorder::default());
        let metrics = Arc::new(Metrics::new());
        let channel = MessageChannel::spawn(
            local,
            Arc::new(CodecContext::default()),
            vec![first.clone(), second.clone()],
            metrics.clone(),
            1024,
        );

        remote.write_all(&[0, 0, 0, 1, b'a', 0, 0, 0, 2, b'b', b'c']).await.unwrap();
        drop(remote);
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();

        assert_eq!(first.frames.lock().unwrap().as_slice(), &[Bytes::from_static(b"a")]);
        assert_eq!(second.frames.lock().unwrap().as_slice(), &[Bytes::from_static(b"bc")]);
        assert!(*first.closed.lock().unwrap());
        assert!(*second.closed.lock().unwrap());
        assert_eq!(metrics.snapshot().frames_received, 2);
    }

    #[tokio::test]
    async fn emitted_frames_are_length_prefixed() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let channel = MessageChannel::spawn(
            local,
            Arc::new(CodecContext::default()),
            vec![Arc::new(Recorder::default())],
            Arc::new(Metrics::new()),
            1024,
        );
        channel.sink().emit(Bytes::from_static(b"xyz")).unwrap();
        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 3, b'x', b'y', b'z']);
    }

    #[tokio::test]
    async fn oversized_frames_end_the_connection() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let channel = MessageChannel::spawn(
            local,
            Arc::new(CodecContext::default()),
            vec![recorder.clone()],
            Arc::new(Metrics::new()),
            8,
        );
        remote.write_all(&[0, 0, 1, 0]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
        assert!(channel.is_closed());
        assert!(recorder.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn feature_set_switches_once() {
        let context = CodecContext::default();
        assert_eq!(*context.features(), FeatureSet::none());
        context.set_features(FeatureSet::all());
        assert_eq!(*context.features(), FeatureSet::all());
    }
}
