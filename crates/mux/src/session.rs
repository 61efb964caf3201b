use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::{
    channel::mpsc,
    io::{AsyncRead, AsyncWrite},
    Stream,
};
use parking_lot::Mutex;

use crate::{
    frame::{Frame, FrameBody, FrameDecoder, Role},
    registry::Registry,
    stream::{EndHook, MuxStream},
    Error, Result,
};

/// Default upper bound on the bytes carried by a single `Data` frame.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Default capacity of the session's shared outbound frame queue.
pub const DEFAULT_SEND_QUEUE_LEN: usize = 32;

/// Distinguishes sessions in logs and in generated stream ids.
static SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Hook invoked with a stream handle, see [`Config`].
pub type StreamHook = Box<dyn Fn(MuxStream) + Send + Sync>;

/// [`Session`] tuning knobs and lifecycle hooks.
pub struct Config {
    /// Upper bound on the bytes carried by a single `Data` frame; larger
    /// writes are fragmented.
    pub max_chunk_size: usize,
    /// Capacity of the shared outbound frame queue. Writers suspend when it
    /// is full, which is the session's only backpressure point.
    pub send_queue_len: usize,
    /// Invoked for every stream the peer opens, with the local handle.
    pub on_incoming_stream: Option<StreamHook>,
    /// Invoked once per stream when it reaches its terminal state, after it
    /// has been removed from the session's bookkeeping.
    pub on_stream_end: Option<StreamHook>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            send_queue_len: DEFAULT_SEND_QUEUE_LEN,
            on_incoming_stream: None,
            on_stream_end: None,
        }
    }
}

/// Frames queued by streams but not yet flushed to the connection.
struct Outbound {
    frames: mpsc::Receiver<Frame>,
    /// Encoded bytes of frames already pulled off the queue, pending
    /// delivery to a reader that offered a short buffer.
    buf: Vec<u8>,
}

struct Shared {
    name: String,
    config: Config,
    registry: Mutex<Registry>,
    /// Latched by the first shutdown, whatever its cause.
    ended: AtomicBool,
    /// Prototype sender cloned into every stream handle.
    outbound: mpsc::Sender<Frame>,
    outbound_rx: Mutex<Outbound>,
    next_stream: AtomicU64,
    decoder: Mutex<FrameDecoder>,
}

impl Shared {
    /// Terminal-state callback of every stream: drops it from the registry
    /// and reports it to the configured hook.
    fn stream_ended(self: &Arc<Self>, role: Role, id: &str) {
        let removed = self.registry.lock().remove(role, id);

        if let Some(stream) = removed {
            log::trace!("{} retired stream ({}) {}", self.name, id, role);

            if let Some(hook) = &self.config.on_stream_end {
                hook(stream);
            }
        }
    }
}

/// One multiplexing session bound to one underlying duplex connection.
///
/// The session is an in-memory state machine: bytes read from the
/// connection are fed in with [`recv`](Session::recv), bytes owed to the
/// connection are pulled with [`drain_outbound`](Session::drain_outbound).
/// The [`AsyncRead`]/[`AsyncWrite`] impls package the same two halves for
/// direct use with connection copy loops.
///
/// Handles are cheaply cloneable and share the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(Config::default())
    }
}

impl Session {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = mpsc::channel(config.send_queue_len);

        let name = format!("muxer:{}", SESSION_ID.fetch_add(1, Ordering::SeqCst));

        log::trace!("{} created", name);

        Session {
            shared: Arc::new(Shared {
                name,
                config,
                registry: Mutex::new(Registry::default()),
                ended: AtomicBool::new(false),
                outbound: tx,
                outbound_rx: Mutex::new(Outbound {
                    frames: rx,
                    buf: Vec::new(),
                }),
                next_stream: AtomicU64::new(0),
                decoder: Mutex::new(FrameDecoder::new()),
            }),
        }
    }

    /// The session's log/debug name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the session has been shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    /// Opens a new outbound stream, registered under the `initiator` role.
    ///
    /// With `name` the caller picks the stream id; otherwise a
    /// session-unique id is generated. The peer learns about the stream
    /// lazily: the `Create` frame is queued together with the stream's
    /// first outbound frame.
    pub fn open_stream(&self, name: Option<&str>) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let id = match name {
            Some(name) => name.to_string(),
            None => format!(
                "{}:stream:{}",
                self.shared.name,
                self.shared.next_stream.fetch_add(1, Ordering::SeqCst)
            ),
        };

        let stream = self.add_stream(id, Role::Initiator)?;

        log::trace!("{} open stream ({})", self.shared.name, stream.id());

        Ok(stream)
    }

    fn add_stream(&self, id: String, role: Role) -> Result<MuxStream> {
        // The end hook holds a weak reference: streams must not keep the
        // session alive.
        let weak = Arc::downgrade(&self.shared);

        let on_end: EndHook = Box::new(move |role, id| {
            if let Some(shared) = weak.upgrade() {
                shared.stream_ended(role, id);
            }
        });

        let stream = MuxStream::new(
            id,
            role,
            self.shared.config.max_chunk_size,
            self.shared.outbound.clone(),
            on_end,
        );

        self.shared.registry.lock().try_insert(role, stream.clone())?;

        Ok(stream)
    }

    /// Feeds bytes read from the underlying connection into the session.
    ///
    /// Complete frames are dispatched to their streams in strict arrival
    /// order; a trailing partial record is buffered for the next call. Any
    /// session-scope error (malformed record, duplicate create, unknown
    /// stream, data after close) shuts the whole session down with that
    /// cause before it is returned.
    pub fn recv(&self, bytes: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        self.shared.decoder.lock().push(bytes);

        loop {
            let frame = match self.shared.decoder.lock().next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    self.shutdown(Some(err.clone()));
                    return Err(err);
                }
            };

            if let Err(err) = self.dispatch(frame) {
                self.shutdown(Some(err.clone()));
                return Err(err);
            }
        }

        Ok(bytes.len())
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        // Frames carry the sender's perspective of the stream; locally the
        // same stream lives under the mirror role.
        let role = frame.direction.flip();

        log::trace!(
            "{} dispatch {:?} for stream ({}) {}",
            self.shared.name,
            frame.body,
            frame.id,
            role
        );

        match frame.body {
            FrameBody::Create => {
                let stream = self.add_stream(frame.id, role)?;

                if let Some(hook) = &self.shared.config.on_incoming_stream {
                    hook(stream);
                }

                Ok(())
            }
            FrameBody::Data { chunk } => self.lookup(role, &frame.id)?.push_inbound(chunk),
            FrameBody::Close => {
                self.lookup(role, &frame.id)?.remote_close();

                Ok(())
            }
            FrameBody::Reset => {
                self.lookup(role, &frame.id)?.remote_reset();

                Ok(())
            }
        }
    }

    fn lookup(&self, role: Role, id: &str) -> Result<MuxStream> {
        self.shared
            .registry
            .lock()
            .get(role, id)
            .ok_or_else(|| Error::UnknownStream(id.to_string()))
    }

    /// All currently live streams, both roles.
    pub fn streams(&self) -> Vec<MuxStream> {
        self.shared.registry.lock().snapshot()
    }

    /// Removes queued outbound frames and returns their wire encoding.
    ///
    /// Never suspends; returns an empty buffer when nothing is queued. The
    /// caller writes the bytes to the underlying connection as-is.
    pub fn drain_outbound(&self) -> Result<Vec<u8>> {
        let mut out = self.shared.outbound_rx.lock();

        while let Ok(Some(frame)) = out.frames.try_next() {
            let bytes = frame.encode()?;

            out.buf.extend_from_slice(&bytes);
        }

        Ok(std::mem::take(&mut out.buf))
    }

    /// Shuts the session down.
    ///
    /// Every live stream is aborted with `cause` (no `Reset` frames are
    /// emitted: the connection is assumed unusable), further
    /// [`open_stream`](Session::open_stream)/[`recv`](Session::recv) calls
    /// fail with [`Error::SessionClosed`], and suspended writers are woken.
    /// Only the first call has effect.
    pub fn shutdown(&self, cause: Option<Error>) {
        if self.shared.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        log::debug!("{} shutdown, cause: {:?}", self.shared.name, cause);

        let streams = self.shared.registry.lock().snapshot();

        for stream in streams {
            stream.abort(cause.clone());
        }

        // Lets readers of the outbound half observe the end of the queue.
        self.shared.outbound_rx.lock().frames.close();
    }
}

impl AsyncRead for Session {
    /// Reads the wire bytes owed to the underlying connection. Returns
    /// `Ok(0)` only after shutdown drained the queue.
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut out = self.shared.outbound_rx.lock();

        loop {
            if !out.buf.is_empty() {
                let read_size = out.buf.len().min(buf.len());

                buf[..read_size].copy_from_slice(&out.buf[..read_size]);
                out.buf.drain(..read_size);

                return Poll::Ready(Ok(read_size));
            }

            match Pin::new(&mut out.frames).poll_next(cx) {
                Poll::Ready(Some(frame)) => {
                    let bytes = frame.encode().map_err(io::Error::from)?;

                    out.buf.extend_from_slice(&bytes);
                }
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Session {
    /// Feeds bytes read from the underlying connection, see
    /// [`recv`](Session::recv).
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.recv(buf) {
            Ok(read_size) => Poll::Ready(Ok(read_size)),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdown(None);

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn init() {
        let _ = pretty_env_logger::try_init();
    }

    /// A session whose incoming streams are collected for inspection.
    fn collecting_session() -> (Session, Arc<Mutex<Vec<MuxStream>>>) {
        let incoming = Arc::new(Mutex::new(Vec::new()));
        let sink = incoming.clone();

        let session = Session::new(Config {
            on_incoming_stream: Some(Box::new(move |stream| sink.lock().push(stream))),
            ..Config::default()
        });

        (session, incoming)
    }

    /// Shuttles queued bytes between two sessions until both are idle.
    fn pump(a: &Session, b: &Session) {
        loop {
            let a_to_b = a.drain_outbound().unwrap();
            let b_to_a = b.drain_outbound().unwrap();

            if a_to_b.is_empty() && b_to_a.is_empty() {
                return;
            }

            if !a_to_b.is_empty() {
                b.recv(&a_to_b).unwrap();
            }

            if !b_to_a.is_empty() {
                a.recv(&b_to_a).unwrap();
            }
        }
    }

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();

        decoder.push(bytes);

        let mut frames = vec![];

        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }

        frames
    }

    #[futures_test::test]
    async fn test_echo_scenario() {
        init();

        let a = Session::default();
        let (b, incoming) = collecting_session();

        let stream = a.open_stream(None).unwrap();

        stream.write(b"hello").await.unwrap();
        stream.close().await.unwrap();

        let bytes = a.drain_outbound().unwrap();

        assert_eq!(
            decode_all(&bytes),
            vec![
                Frame::create(stream.id(), Role::Initiator),
                Frame::data(stream.id(), Role::Initiator, b"hello".to_vec()),
                Frame::close(stream.id(), Role::Initiator),
            ]
        );

        assert_eq!(b.recv(&bytes).unwrap(), bytes.len());

        let echo = incoming.lock().pop().unwrap();

        assert_eq!(echo.id(), stream.id());
        assert_eq!(echo.role(), Role::Recipient);

        assert_eq!(echo.read().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(echo.read().await.unwrap(), None);

        echo.write(b"world").await.unwrap();
        echo.close().await.unwrap();

        pump(&a, &b);

        assert_eq!(stream.read().await.unwrap(), Some(b"world".to_vec()));
        assert_eq!(stream.read().await.unwrap(), None);

        // Both sides fully closed the stream, both registries are empty.
        assert!(a.streams().is_empty());
        assert!(b.streams().is_empty());
    }

    #[futures_test::test]
    async fn test_generated_ids_are_unique() {
        let a = Session::default();

        let first = a.open_stream(None).unwrap();
        let second = a.open_stream(None).unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(a.streams().len(), 2);
    }

    #[futures_test::test]
    async fn test_same_name_on_both_sides() {
        init();

        let (a, a_incoming) = collecting_session();
        let (b, b_incoming) = collecting_session();

        let from_a = a.open_stream(Some("x")).unwrap();
        let from_b = b.open_stream(Some("x")).unwrap();

        from_a.write(b"from a").await.unwrap();
        from_b.write(b"from b").await.unwrap();

        pump(&a, &b);

        // Two distinct streams named "x" exist on each side, one per role.
        assert_eq!(a.streams().len(), 2);
        assert_eq!(b.streams().len(), 2);

        let at_b = b_incoming.lock().pop().unwrap();
        let at_a = a_incoming.lock().pop().unwrap();

        assert_eq!(at_b.read().await.unwrap(), Some(b"from a".to_vec()));
        assert_eq!(at_a.read().await.unwrap(), Some(b"from b".to_vec()));
    }

    #[futures_test::test]
    async fn test_duplicate_create_is_fatal() {
        init();

        let (b, incoming) = collecting_session();

        let create = Frame::create("dup", Role::Initiator).encode().unwrap();

        b.recv(&create).unwrap();

        assert_eq!(
            b.recv(&create).unwrap_err(),
            Error::DuplicateStream("dup".to_string())
        );

        // The violation tears the whole session down with the cause.
        assert!(b.is_closed());
        assert!(b.streams().is_empty());
        assert_eq!(b.open_stream(None).unwrap_err(), Error::SessionClosed);
        assert_eq!(b.recv(b"").unwrap_err(), Error::SessionClosed);

        let orphan = incoming.lock().pop().unwrap();

        assert_eq!(
            orphan.read().await.unwrap_err(),
            Error::DuplicateStream("dup".to_string())
        );
    }

    #[futures_test::test]
    async fn test_unknown_stream_is_fatal() {
        let b = Session::default();

        let data = Frame::data("ghost", Role::Initiator, b"x".to_vec())
            .encode()
            .unwrap();

        assert_eq!(
            b.recv(&data).unwrap_err(),
            Error::UnknownStream("ghost".to_string())
        );

        assert!(b.is_closed());
    }

    #[futures_test::test]
    async fn test_malformed_record_is_fatal() {
        let b = Session::default();

        b.recv(b"not json\n")
            .expect_err("garbage input must end the session");

        assert!(b.is_closed());
    }

    #[futures_test::test]
    async fn test_data_after_close_is_fatal() {
        init();

        let a = Session::default();
        let (b, _incoming) = collecting_session();

        let stream = a.open_stream(None).unwrap();

        stream.close().await.unwrap();

        pump(&a, &b);

        // A data frame after the sender's close violates frame ordering.
        let late = Frame::data(stream.id(), Role::Initiator, b"late".to_vec())
            .encode()
            .unwrap();

        b.recv(&late)
            .expect_err("data after close must end the session");

        assert!(b.is_closed());
    }

    #[futures_test::test]
    async fn test_remote_reset_is_not_echoed() {
        init();

        let a = Session::default();
        let (b, incoming) = collecting_session();

        let stream = a.open_stream(None).unwrap();

        stream.write(b"hello").await.unwrap();

        pump(&a, &b);

        incoming.lock().pop().unwrap().reset().await;

        let bytes = b.drain_outbound().unwrap();

        assert_eq!(decode_all(&bytes), vec![Frame::reset(stream.id(), Role::Recipient)]);

        a.recv(&bytes).unwrap();

        assert_eq!(stream.read().await.unwrap_err(), Error::StreamReset);
        assert_eq!(stream.write(b"x").await.unwrap_err(), Error::StreamReset);

        // Receiving a reset retires the stream without answering it.
        assert_eq!(a.drain_outbound().unwrap(), Vec::<u8>::new());
        assert!(a.streams().is_empty());
        assert!(b.streams().is_empty());
    }

    #[futures_test::test]
    async fn test_shutdown_cascades_silently() {
        init();

        let ended = Arc::new(AtomicUsize::new(0));
        let counter = ended.clone();

        let a = Session::new(Config {
            on_stream_end: Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Config::default()
        });

        let first = a.open_stream(None).unwrap();
        let second = a.open_stream(None).unwrap();

        first.write(b"hello").await.unwrap();

        a.shutdown(None);
        a.shutdown(None);

        assert_eq!(ended.load(Ordering::SeqCst), 2);
        assert!(a.streams().is_empty());

        assert_eq!(first.read().await.unwrap_err(), Error::StreamAborted);
        assert_eq!(second.write(b"x").await.unwrap_err(), Error::StreamAborted);
        assert_eq!(a.open_stream(None).unwrap_err(), Error::SessionClosed);

        // Aborts emit nothing; only frames queued before the shutdown are
        // left in the outbound queue.
        let frames = decode_all(&a.drain_outbound().unwrap());

        assert_eq!(
            frames,
            vec![
                Frame::create(first.id(), Role::Initiator),
                Frame::data(first.id(), Role::Initiator, b"hello".to_vec()),
            ]
        );
    }

    #[futures_test::test]
    async fn test_shutdown_cancels_parked_writer() {
        init();

        let a = Session::new(Config {
            send_queue_len: 0,
            ..Config::default()
        });

        let stream = a.open_stream(None).unwrap();

        // The write's queue slot is spent on the `Create` announcement, the
        // `Data` frame parks on backpressure.
        let mut write = Box::pin(stream.write(b"hello"));

        assert!(futures::poll!(&mut write).is_pending());

        a.shutdown(None);

        assert_eq!(write.await.unwrap_err(), Error::StreamAborted);
    }

    #[futures_test::test]
    async fn test_async_io_adapters() {
        init();

        let a = Session::default();
        let (b, incoming) = collecting_session();

        let stream = a.open_stream(None).unwrap();

        let mut writer = stream.clone();

        writer.write_all(b"hello").await.unwrap();
        writer.close().await.unwrap();

        // Pull the wire bytes through the session's read half, with a short
        // buffer to exercise partial record delivery.
        let mut reader = a.clone();
        let mut bytes = Vec::new();
        let mut buf = [0u8; 7];

        loop {
            let read_size = {
                let mut read = Box::pin(reader.read(&mut buf));

                match futures::poll!(&mut read) {
                    Poll::Ready(read_size) => read_size.unwrap(),
                    // Queue drained, session still live.
                    Poll::Pending => break,
                }
            };

            bytes.extend_from_slice(&buf[..read_size]);
        }

        let mut sink = b.clone();

        sink.write_all(&bytes).await.unwrap();

        let echo = incoming.lock().pop().unwrap();

        let mut received = Vec::new();

        echo.clone().read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");

        // Closing the session's write half shuts it down.
        sink.close().await.unwrap();
        assert!(b.is_closed());
    }
}
