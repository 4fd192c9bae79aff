//! Message readers: turn a byte stream or an object channel into decoded
//! [`Message`] values handed to a callback.
use crate::jsonrpc::channel::ChannelReceiver;
use crate::jsonrpc::error::TransportError;
use crate::jsonrpc::events::Emitter;
use crate::jsonrpc::message_buffer::{content_length, MessageBuffer};
use crate::jsonrpc::message_parser::parse_message_from_str;
use crate::jsonrpc::types::Message;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

const ROLE: &str = "Reader";
const READ_CHUNK_SIZE: usize = 8192;

pub const DEFAULT_PARTIAL_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

pub type DataCallback = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// How long a started message may stay incomplete before
    /// `on_partial_message` fires. Zero disables the timer.
    pub partial_message_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            partial_message_timeout: DEFAULT_PARTIAL_MESSAGE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialMessageInfo {
    pub message_token: u64,
    pub waiting_time: Duration,
}

pub trait MessageReader: Send + Sync {
    fn on_error(&self) -> &Emitter<TransportError>;
    fn on_close(&self) -> &Emitter<()>;
    fn on_partial_message(&self) -> &Emitter<PartialMessageInfo>;

    /// Start delivering messages to `callback`. Must be called from within a
    /// Tokio runtime; a second call is ignored.
    fn listen(&self, callback: DataCallback);

    /// Stop reading. No close event is fired for a disposed reader.
    fn dispose(&self);
}

#[derive(Clone, Default)]
struct ReaderEvents {
    error: Emitter<TransportError>,
    close: Emitter<()>,
    partial_message: Emitter<PartialMessageInfo>,
}

impl ReaderEvents {
    fn dispose(&self) {
        self.error.dispose();
        self.close.dispose();
        self.partial_message.dispose();
    }
}

/// Reader for `Content-Length` framed messages over any `AsyncRead`.
pub struct StreamMessageReader<R> {
    source: Mutex<Option<R>>,
    events: ReaderEvents,
    options: ReaderOptions,
    shutdown: CancellationToken,
}

impl<R> StreamMessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(source: R) -> Self {
        Self::with_options(source, ReaderOptions::default())
    }

    pub fn with_options(source: R, options: ReaderOptions) -> Self {
        StreamMessageReader {
            source: Mutex::new(Some(source)),
            events: ReaderEvents::default(),
            options,
            shutdown: CancellationToken::new(),
        }
    }
}

impl<R> MessageReader for StreamMessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn on_error(&self) -> &Emitter<TransportError> {
        &self.events.error
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.events.close
    }

    fn on_partial_message(&self) -> &Emitter<PartialMessageInfo> {
        &self.events.partial_message
    }

    fn listen(&self, callback: DataCallback) {
        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(source) = source else {
            tracing::warn!("stream reader is already listening");
            return;
        };
        let state = FramedReadState::new(self.options.partial_message_timeout);
        tokio::spawn(read_stream(
            source,
            state,
            callback,
            self.events.clone(),
            self.shutdown.clone(),
        ));
    }

    fn dispose(&self) {
        self.shutdown.cancel();
        self.events.dispose();
    }
}

/// Framing state carried across chunks.
struct FramedReadState {
    buffer: MessageBuffer,
    next_message_length: Option<usize>,
    message_token: u64,
    partial_message_timeout: Duration,
    partial_deadline: Option<Instant>,
}

impl FramedReadState {
    fn new(partial_message_timeout: Duration) -> Self {
        FramedReadState {
            buffer: MessageBuffer::new(),
            next_message_length: None,
            message_token: 0,
            partial_message_timeout,
            partial_deadline: None,
        }
    }

    fn on_data(&mut self, data: &[u8], callback: &DataCallback, events: &ReaderEvents) {
        self.buffer.append(data);
        loop {
            let length = match self.next_message_length {
                Some(length) => length,
                None => match self.buffer.try_read_headers() {
                    Ok(None) => return,
                    Ok(Some(headers)) => match content_length(&headers) {
                        Ok(length) => {
                            self.next_message_length = Some(length);
                            length
                        }
                        Err(e) => {
                            events.error.fire(&e.into());
                            continue;
                        }
                    },
                    Err(e) => {
                        events.error.fire(&e.into());
                        continue;
                    }
                },
            };

            let Some(content) = self.buffer.try_read_content(length).transpose() else {
                self.arm_partial_timer();
                return;
            };
            self.next_message_length = None;
            self.message_token += 1;
            self.partial_deadline = None;

            match content.and_then(|text| parse_message_from_str(&text)) {
                Ok(message) => callback(message),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping undecodable message");
                    events.error.fire(&e.into());
                }
            }
        }
    }

    fn arm_partial_timer(&mut self) {
        if self.partial_message_timeout.is_zero() {
            self.partial_deadline = None;
            return;
        }
        self.partial_deadline = Some(Instant::now() + self.partial_message_timeout);
    }

    fn on_partial_timeout(&mut self, events: &ReaderEvents) {
        events.partial_message.fire(&PartialMessageInfo {
            message_token: self.message_token,
            waiting_time: self.partial_message_timeout,
        });
        self.arm_partial_timer();
    }
}

async fn read_stream<R>(
    mut source: R,
    mut state: FramedReadState,
    callback: DataCallback,
    events: ReaderEvents,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let deadline = state.partial_deadline;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            read = source.read(&mut chunk) => match read {
                Ok(0) => {
                    tracing::debug!("stream reader reached end of input");
                    events.close.fire(&());
                    return;
                }
                Ok(n) => state.on_data(&chunk[..n], &callback, &events),
                Err(e) => {
                    tracing::debug!(error = %e, "stream reader failed");
                    events.error.fire(&TransportError::io(ROLE, &e));
                    events.close.fire(&());
                    return;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                state.on_partial_timeout(&events);
            }
        }
    }
}

/// Reader over an object channel; messages are forwarded as they arrive.
pub struct ChannelMessageReader<C> {
    channel: Mutex<Option<C>>,
    events: ReaderEvents,
    shutdown: CancellationToken,
}

impl<C: ChannelReceiver> ChannelMessageReader<C> {
    pub fn new(channel: C) -> Self {
        ChannelMessageReader {
            channel: Mutex::new(Some(channel)),
            events: ReaderEvents::default(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl<C: ChannelReceiver> MessageReader for ChannelMessageReader<C> {
    fn on_error(&self) -> &Emitter<TransportError> {
        &self.events.error
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.events.close
    }

    fn on_partial_message(&self) -> &Emitter<PartialMessageInfo> {
        &self.events.partial_message
    }

    fn listen(&self, callback: DataCallback) {
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut channel) = channel else {
            tracing::warn!("channel reader is already listening");
            return;
        };
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    received = channel.recv() => match received {
                        Some(Ok(message)) => callback(message),
                        Some(Err(e)) => events.error.fire(&TransportError::channel(ROLE, &e)),
                        None => {
                            tracing::debug!("channel reader closed");
                            events.close.fire(&());
                            return;
                        }
                    },
                }
            }
        });
    }

    fn dispose(&self) {
        self.shutdown.cancel();
        self.events.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::channel::channel_pair;
    use crate::jsonrpc::error::FramingError;
    use crate::jsonrpc::types::{NotificationMessage, RequestId, RequestMessage};
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn collect(reader: &dyn MessageReader) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        reader.listen(Arc::new(move |message| {
            let _ = tx.send(message);
        }));
        rx
    }

    fn collect_errors(reader: &dyn MessageReader) -> mpsc::UnboundedReceiver<TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        reader.on_error().subscribe(move |e| {
            let _ = tx.send(e.clone());
        });
        rx
    }

    fn framed_state() -> (FramedReadState, DataCallback, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: DataCallback = Arc::new(move |m| sink.lock().unwrap().push(m));
        (FramedReadState::new(Duration::ZERO), callback, seen)
    }

    #[tokio::test]
    async fn test_read_message_from_duplex() {
        let (mut a, b) = duplex(1024);
        let reader = StreamMessageReader::new(b);
        let mut messages = collect(&reader);

        let body = r#"{"jsonrpc":"2.0","id":1,"method":"math/add","params":{"a":2,"b":3}}"#;
        a.write_all(&frame(body)).await.unwrap();

        let message = messages.recv().await.unwrap();
        assert_eq!(
            message,
            Message::Request(RequestMessage::new(
                RequestId::Number(1),
                "math/add",
                Some(json!({"a": 2, "b": 3}))
            ))
        );
    }

    #[test]
    fn every_split_point_yields_exactly_one_message() {
        let body = r#"{"jsonrpc":"2.0","method":"café","params":"😀"}"#;
        let bytes = frame(body);
        for split in 0..=bytes.len() {
            let (mut state, callback, seen) = framed_state();
            let events = ReaderEvents::default();
            state.on_data(&bytes[..split], &callback, &events);
            if split < bytes.len() {
                assert!(seen.lock().unwrap().is_empty(), "split at {}", split);
            }
            state.on_data(&bytes[split..], &callback, &events);
            assert_eq!(seen.lock().unwrap().len(), 1, "split at {}", split);
        }
    }

    #[test]
    fn byte_by_byte_delivery() {
        let bytes = frame(r#"{"jsonrpc":"2.0","method":"n"}"#);
        let (mut state, callback, seen) = framed_state();
        let events = ReaderEvents::default();
        for (i, byte) in bytes.iter().enumerate() {
            state.on_data(std::slice::from_ref(byte), &callback, &events);
            let expected = usize::from(i == bytes.len() - 1);
            assert_eq!(seen.lock().unwrap().len(), expected);
        }
    }

    #[test]
    fn two_messages_in_one_chunk_arrive_in_order() {
        let mut bytes = frame(r#"{"jsonrpc":"2.0","method":"first"}"#);
        bytes.extend(frame(r#"{"jsonrpc":"2.0","method":"second"}"#));
        let (mut state, callback, seen) = framed_state();
        state.on_data(&bytes, &callback, &ReaderEvents::default());
        let methods: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect();
        assert_eq!(methods, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn missing_content_length_is_reported_and_stream_recovers() {
        let (mut a, b) = duplex(1024);
        let reader = StreamMessageReader::new(b);
        let mut errors = collect_errors(&reader);
        let mut messages = collect(&reader);

        a.write_all(b"X-Other: 1\r\n\r\n").await.unwrap();
        a.write_all(&frame(r#"{"jsonrpc":"2.0","method":"after"}"#))
            .await
            .unwrap();

        let error = errors.recv().await.unwrap();
        assert!(matches!(
            error,
            TransportError::Framing(FramingError::MissingContentLength)
        ));
        let message = messages.recv().await.unwrap();
        assert_eq!(message.method(), Some("after"));
    }

    #[tokio::test]
    async fn test_read_message_from_malformed_content_length() {
        let (mut a, b) = duplex(64);
        let reader = StreamMessageReader::new(b);
        let mut errors = collect_errors(&reader);
        let _messages = collect(&reader);

        a.write_all(b"Content-Length: abc\r\n\r\n").await.unwrap();

        assert!(matches!(
            errors.recv().await.unwrap(),
            TransportError::Framing(FramingError::InvalidContentLength { .. })
        ));
    }

    #[tokio::test]
    async fn eof_fires_close() {
        let (a, b) = duplex(64);
        let reader = StreamMessageReader::new(b);
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.on_close().subscribe(move |_| {
            let _ = tx.send(());
        });
        let _messages = collect(&reader);
        drop(a);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_message_fires_at_constant_cadence() {
        let (mut a, b) = duplex(1024);
        let reader = StreamMessageReader::with_options(
            b,
            ReaderOptions {
                partial_message_timeout: Duration::from_millis(100),
            },
        );
        let partials = Arc::new(Mutex::new(Vec::new()));
        let sink = partials.clone();
        reader.on_partial_message().subscribe(move |info| {
            sink.lock().unwrap().push(*info);
        });
        let mut messages = collect(&reader);

        let body = r#"{"jsonrpc":"2.0","method":"slow"}"#;
        let bytes = frame(body);
        let cut = bytes.len() - 5;
        a.write_all(&bytes[..cut]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        let fired = partials.lock().unwrap().clone();
        assert!(fired.len() >= 2, "fired {} times", fired.len());
        assert!(fired.iter().all(|info| info.message_token == 0));
        assert!(fired
            .iter()
            .all(|info| info.waiting_time == Duration::from_millis(100)));

        a.write_all(&bytes[cut..]).await.unwrap();
        assert_eq!(messages.recv().await.unwrap().method(), Some("slow"));

        let count = partials.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(partials.lock().unwrap().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_disables_partial_events() {
        let (mut a, b) = duplex(1024);
        let reader = StreamMessageReader::with_options(
            b,
            ReaderOptions {
                partial_message_timeout: Duration::ZERO,
            },
        );
        let fired = Arc::new(Mutex::new(0usize));
        let sink = fired.clone();
        reader.on_partial_message().subscribe(move |_| {
            *sink.lock().unwrap() += 1;
        });
        let _messages = collect(&reader);

        a.write_all(b"Content-Length: 10\r\n\r\n{}").await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn channel_reader_forwards_messages_and_close() {
        let (a, b) = channel_pair();
        let reader = ChannelMessageReader::new(b.receiver);
        let (tx, mut closed) = mpsc::unbounded_channel();
        reader.on_close().subscribe(move |_| {
            let _ = tx.send(());
        });
        let mut messages = collect(&reader);

        let message = Message::Notification(NotificationMessage::new("hello", None));
        a.sender.send(message.clone()).unwrap();
        assert_eq!(messages.recv().await.unwrap(), message);

        drop(a);
        assert!(closed.recv().await.is_some());
    }
}
