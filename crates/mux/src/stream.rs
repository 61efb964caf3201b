use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Instant,
};

use bitmask_enum::bitmask;
use futures::{
    channel::mpsc,
    future::poll_fn,
    io::{AsyncRead, AsyncWrite},
    Sink, SinkExt,
};
use parking_lot::Mutex;

use crate::{
    frame::{Frame, Role},
    Error, Result,
};

/// Which halves of a stream have ended.
///
/// The two halves are tracked independently: a stream is fully closed only
/// when both flags are set. Relying on the ordered connection underneath, a
/// remote `Close` frame safely ends the read half because no valid `Data`
/// can follow it.
#[bitmask(u8)]
enum HalfClose {
    /// No more inbound data will be accepted.
    Read,
    /// No more outbound data will be produced.
    Write,
}

/// Open/close instants of one stream.
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    /// When the stream was created.
    pub open: Instant,
    /// Set exactly once, when both halves have ended.
    pub close: Option<Instant>,
}

/// Invoked exactly once per stream, when it reaches its terminal state
/// (fully closed, reset or aborted).
pub(crate) type EndHook = Box<dyn Fn(Role, &str) + Send + Sync>;

struct State {
    half_close: HalfClose,
    /// The first error recorded by either half termination event; later
    /// ends never overwrite it.
    end_err: Option<Error>,
    /// Whether the `Create` frame for this stream has been queued. Already
    /// set at construction for recipient streams, which never announce.
    create_sent: bool,
    /// Guards the `Close` frame; at most one is ever queued.
    close_sent: bool,
    /// Inbound chunks, delivered to readers in arrival order.
    inbound: VecDeque<Vec<u8>>,
    /// Tasks waiting for inbound data or for the read half to end.
    read_wakers: Vec<Waker>,
    /// Tasks parked in a write against outbound backpressure; woken by
    /// reset/abort so the cancellation cause is observed promptly.
    write_wakers: Vec<Waker>,
    timeline: Timeline,
    /// Guards the end hook; it fires at most once.
    finalized: bool,
}

impl State {
    /// Ends one half. Returns true when this call completed the pair and
    /// the close instant was recorded.
    fn end_half(&mut self, half: HalfClose, err: Option<Error>) -> bool {
        if self.half_close.contains(half) {
            return false;
        }

        self.half_close |= half;

        if let Some(err) = err {
            if self.end_err.is_none() {
                self.end_err = Some(err);
            }
        }

        if self.half_close.contains(HalfClose::Read | HalfClose::Write)
            && self.timeline.close.is_none()
        {
            self.timeline.close = Some(Instant::now());
            return true;
        }

        false
    }

    fn wake_readers(&mut self) {
        for waker in self.read_wakers.drain(..) {
            waker.wake();
        }
    }

    fn wake_writers(&mut self) {
        for waker in self.write_wakers.drain(..) {
            waker.wake();
        }
    }
}

struct Shared {
    id: String,
    role: Role,
    /// Upper bound on the bytes carried by a single `Data` frame.
    max_chunk: usize,
    state: Mutex<State>,
    on_end: EndHook,
}

impl Shared {
    /// Ends both halves abruptly with `cause`, discarding buffered inbound
    /// data and waking every parked reader and writer.
    ///
    /// Returns false when the stream is already terminal; only the first
    /// call has effect.
    fn terminate(&self, cause: Error) -> bool {
        let mut state = self.state.lock();

        if state.end_err.is_some()
            || state.half_close.contains(HalfClose::Read | HalfClose::Write)
        {
            return false;
        }

        state.inbound.clear();
        state.end_half(HalfClose::Read, Some(cause.clone()));
        state.end_half(HalfClose::Write, Some(cause));
        state.wake_readers();
        state.wake_writers();

        true
    }

    /// Fires the end hook, at most once.
    fn finalize(&self) {
        {
            let mut state = self.state.lock();

            if state.finalized {
                return;
            }

            state.finalized = true;
        }

        log::trace!("stream ended ({}) {}", self.id, self.role);

        (self.on_end)(self.role, &self.id);
    }

    /// Removes the pending `Create` announcement, if this stream still owes
    /// one to the peer.
    fn take_create_frame(&self) -> Option<Frame> {
        let mut state = self.state.lock();

        if state.create_sent {
            return None;
        }

        state.create_sent = true;

        Some(Frame::create(self.id.clone(), self.role))
    }

    /// Queues one `Data` frame carrying `chunk`, preceded by the `Create`
    /// announcement when it is still owed.
    ///
    /// Suspends while the session's outbound queue is full; a concurrent
    /// reset or abort cancels the suspended call with the recorded cause.
    fn poll_send_data(
        &self,
        tx: &mut mpsc::Sender<Frame>,
        cx: &mut Context<'_>,
        chunk: &[u8],
    ) -> Poll<Result<()>> {
        let mut state = self.state.lock();

        if let Some(err) = &state.end_err {
            return Poll::Ready(Err(err.clone()));
        }

        if state.close_sent || state.half_close.contains(HalfClose::Write) {
            return Poll::Ready(Err(Error::StreamClosed(self.id.clone())));
        }

        match tx.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::SessionClosed)),
            Poll::Pending => {
                state.write_wakers.push(cx.waker().clone());
                return Poll::Pending;
            }
        }

        if !state.create_sent {
            state.create_sent = true;

            if tx
                .start_send(Frame::create(self.id.clone(), self.role))
                .is_err()
            {
                return Poll::Ready(Err(Error::SessionClosed));
            }

            match tx.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::SessionClosed)),
                Poll::Pending => {
                    state.write_wakers.push(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }

        if tx
            .start_send(Frame::data(self.id.clone(), self.role, chunk.to_vec()))
            .is_err()
        {
            return Poll::Ready(Err(Error::SessionClosed));
        }

        Poll::Ready(Ok(()))
    }

    /// Ends the local write half, queueing the `Close` frame (and the
    /// `Create` announcement when still owed). Idempotent.
    fn poll_close_write(
        &self,
        tx: &mut mpsc::Sender<Frame>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<()>> {
        loop {
            {
                let state = self.state.lock();

                if state.close_sent
                    || state.half_close.contains(HalfClose::Write)
                    || state.end_err.is_some()
                {
                    return Poll::Ready(Ok(()));
                }
            }

            match tx.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::SessionClosed)),
                Poll::Pending => {
                    self.state.lock().write_wakers.push(cx.waker().clone());
                    return Poll::Pending;
                }
            }

            // One queue slot is available; emit the next frame owed by the
            // close handshake.
            let (frame, fully_closed) = {
                let mut state = self.state.lock();

                if !state.create_sent {
                    state.create_sent = true;

                    (Frame::create(self.id.clone(), self.role), false)
                } else {
                    state.close_sent = true;

                    let fully_closed = state.end_half(HalfClose::Write, None);

                    (Frame::close(self.id.clone(), self.role), fully_closed)
                }
            };

            if tx.start_send(frame).is_err() {
                return Poll::Ready(Err(Error::SessionClosed));
            }

            if fully_closed {
                self.finalize();
            }
        }
    }

    /// Removes the next inbound chunk, suspending while the queue is empty
    /// and the read half has not ended.
    fn poll_read_chunk(&self, cx: &mut Context<'_>) -> Poll<Result<Option<Vec<u8>>>> {
        let mut state = self.state.lock();

        if let Some(chunk) = state.inbound.pop_front() {
            return Poll::Ready(Ok(Some(chunk)));
        }

        if state.half_close.contains(HalfClose::Read) {
            return Poll::Ready(match &state.end_err {
                Some(err) => Err(err.clone()),
                None => Ok(None),
            });
        }

        state.read_wakers.push(cx.waker().clone());

        Poll::Pending
    }

    /// [`AsyncRead`] flavoured read: copies into `buf`, requeueing any
    /// remainder of a partially consumed chunk.
    fn poll_read_buf(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut state = self.state.lock();

        let Some(mut chunk) = state.inbound.pop_front() else {
            if state.half_close.contains(HalfClose::Read) {
                return Poll::Ready(match &state.end_err {
                    Some(err) => Err(err.clone().into()),
                    None => Ok(0),
                });
            }

            state.read_wakers.push(cx.waker().clone());

            return Poll::Pending;
        };

        let read_size = chunk.len().min(buf.len());

        if read_size < chunk.len() {
            state.inbound.push_front(chunk.split_off(read_size));
        }

        buf[..read_size].copy_from_slice(&chunk[..read_size]);

        Poll::Ready(Ok(read_size))
    }
}

/// One logical duplex byte channel multiplexed over a [`Session`](crate::Session).
///
/// Handles are cheaply cloneable and share the same underlying stream
/// state. The stream is consumed either through the async methods
/// ([`write`](MuxStream::write), [`read`](MuxStream::read), ...) or as a
/// generic duplex channel through its [`AsyncRead`]/[`AsyncWrite`] impls.
pub struct MuxStream {
    shared: Arc<Shared>,
    /// This handle's sender into the session's shared outbound frame queue.
    outbound: mpsc::Sender<Frame>,
}

impl Clone for MuxStream {
    fn clone(&self) -> Self {
        MuxStream {
            shared: self.shared.clone(),
            outbound: self.outbound.clone(),
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish()
    }
}

impl MuxStream {
    pub(crate) fn new(
        id: String,
        role: Role,
        max_chunk: usize,
        outbound: mpsc::Sender<Frame>,
        on_end: EndHook,
    ) -> Self {
        MuxStream {
            shared: Arc::new(Shared {
                id,
                role,
                max_chunk,
                state: Mutex::new(State {
                    half_close: HalfClose::none(),
                    end_err: None,
                    // Only the originating side announces the stream.
                    create_sent: role == Role::Recipient,
                    close_sent: false,
                    inbound: VecDeque::new(),
                    read_wakers: Vec::new(),
                    write_wakers: Vec::new(),
                    timeline: Timeline {
                        open: Instant::now(),
                        close: None,
                    },
                    finalized: false,
                }),
                on_end,
            }),
            outbound,
        }
    }

    /// The stream id, unique within (role, id) for the session's lifetime.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Which peer caused this stream to exist, from the local perspective.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open/close instants of this stream.
    pub fn timeline(&self) -> Timeline {
        self.shared.state.lock().timeline
    }

    /// Appends `buf` to the stream's outbound byte sequence.
    ///
    /// The bytes are fragmented into `Data` frames of at most the session's
    /// configured chunk size, preserving order within and across calls. The
    /// first frame queued by an initiator stream is always its `Create`
    /// announcement.
    ///
    /// Suspends while the session's outbound queue is full. A concurrent
    /// [`reset`](MuxStream::reset) or [`abort`](MuxStream::abort) cancels a
    /// suspended write with [`Error::StreamReset`] or
    /// [`Error::StreamAborted`] respectively, whichever fired first.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        let mut tx = self.outbound.clone();

        if buf.is_empty() {
            // A zero length write queues nothing but still surfaces the
            // stream's terminal state to the caller.
            let state = self.shared.state.lock();

            if let Some(err) = &state.end_err {
                return Err(err.clone());
            }

            if state.close_sent || state.half_close.contains(HalfClose::Write) {
                return Err(Error::StreamClosed(self.shared.id.clone()));
            }

            return Ok(());
        }

        for chunk in buf.chunks(self.shared.max_chunk) {
            poll_fn(|cx| self.shared.poll_send_data(&mut tx, cx, chunk)).await?;
        }

        Ok(())
    }

    /// Removes the next inbound chunk.
    ///
    /// Suspends while the queue is empty and the read half is open.
    /// `Ok(None)` signals a clean end of stream; a reset or aborted stream
    /// reports its terminal error consistently on every call.
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        poll_fn(|cx| self.shared.poll_read_chunk(cx)).await
    }

    /// Ends the local write half: a `Close` frame tells the peer that no
    /// more `Data` will follow. The read half is unaffected; the stream
    /// fully closes once the peer closes its own write half.
    ///
    /// Idempotent: at most one `Close` frame is ever emitted, and calling
    /// this on a reset or aborted stream has no effect.
    pub async fn close(&self) -> Result<()> {
        let mut tx = self.outbound.clone();

        poll_fn(|cx| self.shared.poll_close_write(&mut tx, cx)).await
    }

    /// Abrupt teardown of both halves with cause [`Error::StreamReset`].
    ///
    /// A locally triggered reset is announced to the peer with a `Reset`
    /// frame (preceded by the `Create` announcement when still owed, so the
    /// peer can attribute it). A reset caused by receiving a remote `Reset`
    /// never echoes one back. Idempotent.
    pub async fn reset(&self) {
        if !self.shared.terminate(Error::StreamReset) {
            return;
        }

        log::debug!("reset stream ({}) {}", self.shared.id, self.shared.role);

        self.shared.finalize();

        // The stream is already dead locally; announcing the reset to the
        // peer is best effort.
        let mut tx = self.outbound.clone();

        if let Some(frame) = self.shared.take_create_frame() {
            if tx.send(frame).await.is_err() {
                return;
            }
        }

        if tx
            .send(Frame::reset(self.shared.id.clone(), self.shared.role))
            .await
            .is_err()
        {
            log::trace!(
                "session gone, reset frame for stream ({}) dropped",
                self.shared.id
            );
        }
    }

    /// Unilateral, silent teardown of both halves.
    ///
    /// No frame is emitted: this is used when the underlying connection
    /// itself has failed and nothing can reach the peer anymore. The
    /// recorded cause is `err`, or [`Error::StreamAborted`] when absent.
    /// Cancels any in-flight write. Idempotent.
    pub fn abort(&self, err: Option<Error>) {
        let cause = err.unwrap_or(Error::StreamAborted);

        if self.shared.terminate(cause) {
            log::debug!("abort stream ({}) {}", self.shared.id, self.shared.role);

            self.shared.finalize();
        }
    }

    /// Queues one chunk received from the peer.
    ///
    /// A `Data` frame arriving after the read half ended is a protocol
    /// violation: the sender's `Close`/`Reset` already ended the sequence.
    pub(crate) fn push_inbound(&self, chunk: Vec<u8>) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let mut state = self.shared.state.lock();

        if state.half_close.contains(HalfClose::Read) {
            return Err(Error::ProtocolViolation(format!(
                "data frame after end of stream ({})",
                self.shared.id
            )));
        }

        state.inbound.push_back(chunk);
        state.wake_readers();

        Ok(())
    }

    /// Handles a remote `Close`: the read half ends cleanly, buffered
    /// chunks stay readable.
    pub(crate) fn remote_close(&self) {
        let fully_closed = {
            let mut state = self.shared.state.lock();

            let fully_closed = state.end_half(HalfClose::Read, None);

            state.wake_readers();

            fully_closed
        };

        if fully_closed {
            self.shared.finalize();
        }
    }

    /// Handles a remote `Reset`: both halves end with
    /// [`Error::StreamReset`] and no `Reset` is echoed back.
    pub(crate) fn remote_reset(&self) {
        if self.shared.terminate(Error::StreamReset) {
            self.shared.finalize();
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.shared.poll_read_buf(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let chunk_size = buf.len().min(this.shared.max_chunk);

        match this
            .shared
            .poll_send_data(&mut this.outbound, cx, &buf[..chunk_size])
        {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(chunk_size)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match Pin::new(&mut this.outbound).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::SessionClosed.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.shared.poll_close_write(&mut this.outbound, cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
