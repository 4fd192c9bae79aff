//! Message writers. `write` only enqueues; a background task performs the
//! I/O and reports failures through `on_error` together with the number of
//! consecutive failed writes.
use crate::jsonrpc::channel::ChannelSender;
use crate::jsonrpc::error::TransportError;
use crate::jsonrpc::events::Emitter;
use crate::jsonrpc::message_buffer::CONTENT_LENGTH;
use crate::jsonrpc::types::Message;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const ROLE: &str = "Writer";

#[derive(Debug, Clone)]
pub struct WriterError {
    pub error: TransportError,
    pub message: Option<Message>,
    /// Consecutive failures including this one; reset by a successful write.
    pub count: Option<u32>,
}

pub trait MessageWriter: Send + Sync {
    fn on_error(&self) -> &Emitter<WriterError>;
    fn on_close(&self) -> &Emitter<()>;

    /// Queue `message` for delivery. Fails only when the writer can no
    /// longer accept messages; delivery errors arrive on `on_error`.
    fn write(&self, message: Message) -> Result<(), TransportError>;

    fn dispose(&self);
}

#[derive(Clone)]
struct WriterEvents {
    error: Emitter<WriterError>,
    close: Emitter<()>,
    error_count: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
}

impl WriterEvents {
    fn new() -> Self {
        WriterEvents {
            error: Emitter::new(),
            close: Emitter::new(),
            error_count: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn succeeded(&self) {
        self.error_count.store(0, Ordering::SeqCst);
    }

    fn failed(&self, error: TransportError, message: Message) {
        let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(error = %error, count, "message write failed");
        self.error.fire(&WriterError {
            error,
            message: Some(message),
            count: Some(count),
        });
    }

    fn closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close.fire(&());
        }
    }

    fn dispose(&self) {
        self.error.dispose();
        self.close.dispose();
    }
}

/// Queue plus events shared by both writer variants.
struct QueuedWriter {
    queue: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: WriterEvents,
}

impl QueuedWriter {
    fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = QueuedWriter {
            queue: Mutex::new(Some(tx)),
            events: WriterEvents::new(),
        };
        (writer, rx)
    }

    fn write(&self, message: Message) -> Result<(), TransportError> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match queue.as_ref() {
            Some(tx) => tx.send(message).map_err(|e| e.0),
            None => Err(message),
        };
        drop(queue);
        result.map_err(|message| {
            let error = TransportError::Closed { role: ROLE };
            self.events.failed(error.clone(), message);
            error
        })
    }

    fn dispose(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.events.dispose();
    }
}

/// Writes `Content-Length` framed JSON to any `AsyncWrite`.
pub struct StreamMessageWriter {
    inner: QueuedWriter,
}

impl StreamMessageWriter {
    /// Must be called from within a Tokio runtime.
    pub fn new<W>(sink: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inner, rx) = QueuedWriter::new();
        tokio::spawn(write_stream(sink, rx, inner.events.clone()));
        StreamMessageWriter { inner }
    }
}

impl MessageWriter for StreamMessageWriter {
    fn on_error(&self) -> &Emitter<WriterError> {
        &self.inner.events.error
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.inner.events.close
    }

    fn write(&self, message: Message) -> Result<(), TransportError> {
        self.inner.write(message)
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

/// Serialize `message` and write it with its header. The length is the UTF-8
/// byte count of the body.
pub async fn write_message_to<W>(sink: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let body = serde_json::to_string(message)?;
    let header = format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.as_bytes().len());
    sink.write_all(header.as_bytes()).await?;
    sink.write_all(body.as_bytes()).await?;
    sink.flush().await?;
    Ok(())
}

async fn write_stream<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<Message>, events: WriterEvents)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = rx.recv().await {
        match write_message_to(&mut sink, &message).await {
            Ok(()) => events.succeeded(),
            Err(e) => {
                let broken = matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
                );
                events.failed(TransportError::io(ROLE, &e), message);
                if broken {
                    events.closed();
                }
            }
        }
    }
    tracing::debug!("stream writer queue closed");
}

/// Forwards messages to an object channel unchanged.
pub struct ChannelMessageWriter {
    inner: QueuedWriter,
}

impl ChannelMessageWriter {
    /// Must be called from within a Tokio runtime.
    pub fn new<C: ChannelSender>(channel: C) -> Self {
        let (inner, rx) = QueuedWriter::new();
        tokio::spawn(write_channel(channel, rx, inner.events.clone()));
        ChannelMessageWriter { inner }
    }
}

impl MessageWriter for ChannelMessageWriter {
    fn on_error(&self) -> &Emitter<WriterError> {
        &self.inner.events.error
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.inner.events.close
    }

    fn write(&self, message: Message) -> Result<(), TransportError> {
        self.inner.write(message)
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

async fn write_channel<C: ChannelSender>(
    mut channel: C,
    mut rx: mpsc::UnboundedReceiver<Message>,
    events: WriterEvents,
) {
    while let Some(message) = rx.recv().await {
        match channel.send(message.clone()).await {
            Ok(()) => events.succeeded(),
            Err(e) => {
                events.failed(TransportError::channel(ROLE, &e), message);
                events.closed();
            }
        }
    }
    tracing::debug!("channel writer queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::channel::channel_pair;
    use crate::jsonrpc::reader::{MessageReader, StreamMessageReader};
    use crate::jsonrpc::types::{NotificationMessage, RequestId, RequestMessage};
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    struct FailingSink;

    impl AsyncWrite for FailingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk on fire",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_message_to_and_read() {
        let (a, mut b) = duplex(1024);
        let writer = StreamMessageWriter::new(a);

        let message = Message::Request(RequestMessage::new(
            RequestId::Number(1),
            "math/add",
            Some(json!({"a": 2, "b": 3})),
        ));
        writer.write(message).unwrap();

        let body = r#"{"jsonrpc":"2.0","id":1,"method":"math/add","params":{"a":2,"b":3}}"#;
        let expected = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut received = vec![0u8; expected.len()];
        b.read_exact(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
    }

    #[tokio::test]
    async fn content_length_counts_utf8_bytes() {
        let (a, b) = duplex(1024);
        let writer = StreamMessageWriter::new(a);
        let reader = StreamMessageReader::new(b);
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.listen(Arc::new(move |m| {
            let _ = tx.send(m);
        }));

        let message = Message::Notification(NotificationMessage::new(
            "greet",
            Some(json!({"text": "caf\u{e9} \u{1F600}"})),
        ));
        writer.write(message.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn failures_are_counted_until_success() {
        let writer = StreamMessageWriter::new(FailingSink);
        let (tx, mut rx) = mpsc::unbounded_channel();
        writer.on_error().subscribe(move |e| {
            let _ = tx.send(e.clone());
        });

        for _ in 0..3 {
            writer
                .write(Message::Notification(NotificationMessage::new("n", None)))
                .unwrap();
        }
        let counts: Vec<Option<u32>> = vec![
            rx.recv().await.unwrap().count,
            rx.recv().await.unwrap().count,
            rx.recv().await.unwrap().count,
        ];
        assert_eq!(counts, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn write_after_dispose_fails() {
        let (a, _b) = duplex(64);
        let writer = StreamMessageWriter::new(a);
        writer.dispose();
        let result = writer.write(Message::Notification(NotificationMessage::new("n", None)));
        assert!(matches!(result, Err(TransportError::Closed { role: "Writer" })));
    }

    #[tokio::test]
    async fn channel_writer_forwards_objects() {
        let (a, mut b) = channel_pair();
        let writer = ChannelMessageWriter::new(a.sender);
        let message = Message::Notification(NotificationMessage::new("n", Some(json!(1))));
        writer.write(message.clone()).unwrap();
        assert_eq!(b.receiver.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn channel_writer_reports_closed_peer() {
        let (a, b) = channel_pair();
        drop(b);
        let writer = ChannelMessageWriter::new(a.sender);
        let (tx, mut rx) = mpsc::unbounded_channel();
        writer.on_error().subscribe(move |e| {
            let _ = tx.send(e.clone());
        });
        let (close_tx, mut closed) = mpsc::unbounded_channel();
        writer.on_close().subscribe(move |_| {
            let _ = close_tx.send(());
        });

        writer
            .write(Message::Notification(NotificationMessage::new("n", None)))
            .unwrap();
        let error = rx.recv().await.unwrap();
        assert_eq!(error.count, Some(1));
        assert!(error.message.is_some());
        assert!(closed.recv().await.is_some());
    }
}
