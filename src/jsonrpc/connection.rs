//! The connection: request id allocation, response correlation, handler
//! dispatch, `$/cancelRequest` bookkeeping, tracing and lifecycle on top of
//! one [`MessageReader`] and one [`MessageWriter`].
//!
//! ```text
//! New --listen()--> Listening --reader/writer close--> Closed
//!  any state --dispose()--> Disposed (terminal)
//! ```
//!
//! Registries are plain maps behind `std::sync` locks. Locks are never held
//! while a handler runs or across an `.await`.
use crate::jsonrpc::channel::ChannelEnd;
use crate::jsonrpc::error::{ConnectionError, RequestError, TransportError};
use crate::jsonrpc::events::Emitter;
use crate::jsonrpc::handler::{HandlerError, HandlerResult};
use crate::jsonrpc::logger::Logger;
use crate::jsonrpc::reader::{
    ChannelMessageReader, MessageReader, ReaderOptions, StreamMessageReader,
};
use crate::jsonrpc::trace::{
    LogTraceParams, SetTraceParams, Trace, Tracer, LOG_TRACE_NOTIFICATION, SET_TRACE_NOTIFICATION,
};
use crate::jsonrpc::types::{
    error_codes, CancelParams, Message, NotificationMessage, NotificationType, RequestId,
    RequestMessage, RequestType, ResponseError, ResponseMessage, CANCEL_REQUEST,
};
use crate::jsonrpc::writer::{ChannelMessageWriter, MessageWriter, StreamMessageWriter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type RequestHandler = Arc<dyn Fn(Option<Value>, CancellationToken) -> HandlerResult + Send + Sync>;
type StarRequestHandler =
    Arc<dyn Fn(&str, Option<Value>, CancellationToken) -> HandlerResult + Send + Sync>;
type NotificationHandler = Arc<dyn Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync>;
type StarNotificationHandler = Arc<dyn Fn(&str, Option<Value>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Listening,
    Closed,
    Disposed,
}

/// Error surfaced on [`Connection::on_error`]. Reader errors carry neither a
/// message nor a count.
#[derive(Debug, Clone)]
pub struct ConnectionErrorEvent {
    pub error: TransportError,
    pub message: Option<Message>,
    pub count: Option<u32>,
}

struct PendingRequest {
    method: String,
    start: Instant,
    sender: oneshot::Sender<Result<Value, RequestError>>,
    cancel_watch: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn resolve(self, result: Result<Value, RequestError>) {
        if let Some(watch) = self.cancel_watch {
            watch.abort();
        }
        let _ = self.sender.send(result);
    }
}

/// Result of an outgoing request. Resolves once the matching response
/// arrives, or with an error when the write fails or the connection is
/// disposed.
pub struct PendingResponse<R> {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, RequestError>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> PendingResponse<R> {
    fn new(id: RequestId, rx: oneshot::Receiver<Result<Value, RequestError>>) -> Self {
        PendingResponse {
            id,
            rx,
            _marker: PhantomData,
        }
    }

    fn failed(id: RequestId, error: RequestError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::new(id, rx)
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl<R: DeserializeOwned> Future for PendingResponse<R> {
    type Output = Result<R, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Dropped)),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(Ok(value))) => {
                Poll::Ready(serde_json::from_value(value).map_err(RequestError::InvalidResult))
            }
        }
    }
}

enum RegisteredRequestHandler {
    Method(RequestHandler),
    Star(StarRequestHandler),
}

impl RegisteredRequestHandler {
    fn call(&self, method: &str, params: Option<Value>, token: CancellationToken) -> HandlerResult {
        match self {
            RegisteredRequestHandler::Method(handler) => handler(params, token),
            RegisteredRequestHandler::Star(handler) => handler(method, params, token),
        }
    }
}

#[derive(Default)]
struct TraceState {
    level: Trace,
    tracer: Option<Arc<dyn Tracer>>,
}

#[derive(Default)]
struct ConnectionEvents {
    error: Emitter<ConnectionErrorEvent>,
    close: Emitter<()>,
    unhandled_notification: Emitter<NotificationMessage>,
    dispose: Emitter<()>,
}

struct Inner {
    reader: Box<dyn MessageReader>,
    writer: Box<dyn MessageWriter>,
    logger: Arc<dyn Logger>,
    state: Mutex<ConnectionState>,
    sequence: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    star_request_handler: RwLock<Option<StarRequestHandler>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    star_notification_handler: RwLock<Option<StarNotificationHandler>>,
    request_tokens: Mutex<HashMap<RequestId, CancellationToken>>,
    trace: RwLock<TraceState>,
    events: ConnectionEvents,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn to_params<P: Serialize>(params: P) -> Result<Option<Value>, serde_json::Error> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn to_response_error(method: &str, error: HandlerError) -> ResponseError {
    match error {
        HandlerError::Response(error) => error,
        HandlerError::Failed(error) => {
            ResponseError::internal(format!("Request {} failed with message: {}", method, error))
        }
    }
}

fn unexpected_failure(method: &str) -> ResponseError {
    ResponseError::internal(format!(
        "Request {} failed unexpectedly without providing any details.",
        method
    ))
}

/// A JSON-RPC connection. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Connection over a `Content-Length` framed byte stream.
pub fn create_stream_connection<R, W>(
    input: R,
    output: W,
    options: ReaderOptions,
    logger: Arc<dyn Logger>,
) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Connection::new(
        StreamMessageReader::with_options(input, options),
        StreamMessageWriter::new(output),
        logger,
    )
}

/// Connection over an object channel.
pub fn create_channel_connection(channel: ChannelEnd, logger: Arc<dyn Logger>) -> Connection {
    Connection::new(
        ChannelMessageReader::new(channel.receiver),
        ChannelMessageWriter::new(channel.sender),
        logger,
    )
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W, logger: Arc<dyn Logger>) -> Self
    where
        R: MessageReader + 'static,
        W: MessageWriter + 'static,
    {
        let inner = Arc::new(Inner {
            reader: Box::new(reader),
            writer: Box::new(writer),
            logger,
            state: Mutex::new(ConnectionState::New),
            sequence: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
            star_request_handler: RwLock::new(None),
            notification_handlers: RwLock::new(HashMap::new()),
            star_notification_handler: RwLock::new(None),
            request_tokens: Mutex::new(HashMap::new()),
            trace: RwLock::new(TraceState::default()),
            events: ConnectionEvents::default(),
        });

        let weak = Arc::downgrade(&inner);
        inner.reader.on_error().subscribe(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.events.error.fire(&ConnectionErrorEvent {
                    error: error.clone(),
                    message: None,
                    count: None,
                });
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.writer.on_error().subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.events.error.fire(&ConnectionErrorEvent {
                    error: event.error.clone(),
                    message: event.message.clone(),
                    count: event.count,
                });
            }
        });
        for close in [inner.reader.on_close(), inner.writer.on_close()] {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            close.subscribe(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.close_handler();
                }
            });
        }

        Connection { inner }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn on_error(&self) -> &Emitter<ConnectionErrorEvent> {
        &self.inner.events.error
    }

    pub fn on_close(&self) -> &Emitter<()> {
        &self.inner.events.close
    }

    pub fn on_unhandled_notification(&self) -> &Emitter<NotificationMessage> {
        &self.inner.events.unhandled_notification
    }

    pub fn on_dispose(&self) -> &Emitter<()> {
        &self.inner.events.dispose
    }

    /// Number of sent requests still waiting for a response.
    pub fn pending_request_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Start reading. Must be called from within a Tokio runtime.
    pub fn listen(&self) -> Result<(), ConnectionError> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ConnectionState::New => *state = ConnectionState::Listening,
                ConnectionState::Listening => return Err(ConnectionError::AlreadyListening),
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                ConnectionState::Disposed => return Err(ConnectionError::Disposed),
            }
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.reader.listen(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(message);
            }
        }));
        Ok(())
    }

    pub fn send_request<P, R>(
        &self,
        ty: &RequestType<P, R>,
        params: P,
        token: Option<CancellationToken>,
    ) -> Result<PendingResponse<R>, ConnectionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.inner.throw_if_closed_or_disposed()?;
        self.inner.throw_if_not_listening()?;
        match to_params(params) {
            Ok(params) => self.inner.send_request(ty.method(), params, token),
            // never written, so it takes no id from the sequence
            Err(e) => {
                Ok(PendingResponse::failed(
                    RequestId::Number(0),
                    RequestError::Response(ResponseError::new(
                        error_codes::INVALID_PARAMS,
                        format!("failed to serialize params: {}", e),
                    )),
                ))
            }
        }
    }

    pub fn send_raw_request(
        &self,
        method: &str,
        params: Option<Value>,
        token: Option<CancellationToken>,
    ) -> Result<PendingResponse<Value>, ConnectionError> {
        self.inner.throw_if_closed_or_disposed()?;
        self.inner.throw_if_not_listening()?;
        self.inner.send_request(method, params, token)
    }

    pub fn send_notification<P: Serialize>(
        &self,
        ty: &NotificationType<P>,
        params: P,
    ) -> Result<(), ConnectionError> {
        self.inner.throw_if_closed_or_disposed()?;
        self.inner.throw_if_not_listening()?;
        match to_params(params) {
            Ok(params) => self.inner.send_notification(ty.method(), params),
            Err(e) => self.inner.logger.error(&format!(
                "Failed to serialize params of notification '{}': {}",
                ty.method(),
                e
            )),
        }
        Ok(())
    }

    pub fn send_raw_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ConnectionError> {
        self.inner.throw_if_closed_or_disposed()?;
        self.inner.throw_if_not_listening()?;
        self.inner.send_notification(method, params);
        Ok(())
    }

    /// Register a typed request handler. Params that do not deserialize into
    /// `P` are answered with `InvalidParams`.
    pub fn on_request<P, R, F>(&self, ty: &RequestType<P, R>, handler: F) -> Result<(), ConnectionError>
    where
        P: DeserializeOwned + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, CancellationToken) -> HandlerResult<R> + Send + Sync + 'static,
    {
        self.on_raw_request(ty.method(), move |params, token| {
            match serde_json::from_value::<P>(params.unwrap_or(Value::Null)) {
                Ok(params) => handler(params, token).into_value(),
                Err(e) => HandlerResult::err(ResponseError::new(
                    error_codes::INVALID_PARAMS,
                    e.to_string(),
                )),
            }
        })
    }

    pub fn on_raw_request<F>(&self, method: &str, handler: F) -> Result<(), ConnectionError>
    where
        F: Fn(Option<Value>, CancellationToken) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.throw_if_closed_or_disposed()?;
        write(&self.inner.request_handlers).insert(method.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Handler for every request method without a specific handler.
    pub fn on_star_request<F>(&self, handler: F) -> Result<(), ConnectionError>
    where
        F: Fn(&str, Option<Value>, CancellationToken) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.throw_if_closed_or_disposed()?;
        *write(&self.inner.star_request_handler) = Some(Arc::new(handler));
        Ok(())
    }

    pub fn on_notification<P, F>(&self, ty: &NotificationType<P>, handler: F) -> Result<(), ConnectionError>
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_raw_notification(ty.method(), move |params| {
            let params = serde_json::from_value::<P>(params.unwrap_or(Value::Null))?;
            handler(params)
        })
    }

    pub fn on_raw_notification<F>(&self, method: &str, handler: F) -> Result<(), ConnectionError>
    where
        F: Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.throw_if_closed_or_disposed()?;
        write(&self.inner.notification_handlers).insert(method.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Handler for every notification without a specific handler. With a star
    /// handler installed `on_unhandled_notification` no longer fires.
    pub fn on_star_notification<F>(&self, handler: F) -> Result<(), ConnectionError>
    where
        F: Fn(&str, Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.throw_if_closed_or_disposed()?;
        *write(&self.inner.star_notification_handler) = Some(Arc::new(handler));
        Ok(())
    }

    /// Set the local trace level and tracer. With `send_notification` the
    /// peer is told the new level through `$/setTraceNotification`.
    pub fn trace(
        &self,
        level: Trace,
        tracer: Option<Arc<dyn Tracer>>,
        send_notification: bool,
    ) -> Result<(), ConnectionError> {
        {
            let mut trace = write(&self.inner.trace);
            trace.level = level;
            trace.tracer = if level == Trace::Off { None } else { tracer };
        }
        if send_notification && self.state() == ConnectionState::Listening {
            self.send_notification(&SET_TRACE_NOTIFICATION, SetTraceParams { value: level })?;
        }
        Ok(())
    }

    /// Idempotent. Rejects every pending request, cancels in-flight incoming
    /// requests and stops the reader and writer.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn throw_if_closed_or_disposed(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Closed => Err(ConnectionError::Closed),
            ConnectionState::Disposed => Err(ConnectionError::Disposed),
            _ => Ok(()),
        }
    }

    fn throw_if_not_listening(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::New => Err(ConnectionError::NotListening),
            _ => Ok(()),
        }
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.sequence.fetch_add(1, Ordering::SeqCst))
    }

    fn send_request<R>(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        token: Option<CancellationToken>,
    ) -> Result<PendingResponse<R>, ConnectionError> {
        let id = self.next_id();
        let request = RequestMessage::new(id.clone(), method, params);
        self.trace_sending_request(&request);

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                start: Instant::now(),
                sender: tx,
                cancel_watch: None,
            },
        );

        if let Err(e) = self.writer.write(Message::Request(request)) {
            self.logger
                .error(&format!("Sending request '{}' failed: {}", method, e));
            if let Some(pending) = self.take_pending(&id) {
                pending.resolve(Err(RequestError::Response(ResponseError::new(
                    error_codes::MESSAGE_WRITE_ERROR,
                    e.to_string(),
                ))));
            }
            return Ok(PendingResponse::new(id, rx));
        }

        if let Some(token) = token {
            self.watch_cancellation(id.clone(), token);
        }
        Ok(PendingResponse::new(id, rx))
    }

    /// Sends `$/cancelRequest` for `id` once `token` fires, as long as the
    /// request is still pending.
    fn watch_cancellation(self: &Arc<Self>, id: RequestId, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        let watched = id.clone();
        let watch = tokio::spawn(async move {
            token.cancelled().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.state() != ConnectionState::Listening
                || !lock(&inner.pending).contains_key(&watched)
            {
                return;
            }
            match to_params(CancelParams { id: watched }) {
                Ok(params) => inner.send_notification(CANCEL_REQUEST.method(), params),
                Err(e) => inner
                    .logger
                    .error(&format!("Failed to build cancel notification: {}", e)),
            }
        });

        let mut pending = lock(&self.pending);
        match pending.get_mut(&id) {
            Some(request) => request.cancel_watch = Some(watch),
            None => watch.abort(),
        }
    }

    fn send_notification(&self, method: &str, params: Option<Value>) {
        let notification = NotificationMessage::new(method, params);
        self.trace_sending_notification(&notification);
        if let Err(e) = self.writer.write(Message::Notification(notification)) {
            self.logger
                .error(&format!("Sending notification '{}' failed: {}", method, e));
        }
    }

    fn take_pending(&self, id: &RequestId) -> Option<PendingRequest> {
        lock(&self.pending).remove(id)
    }

    fn handle_message(self: &Arc<Self>, message: Message) {
        if self.state() == ConnectionState::Disposed {
            tracing::debug!(method = ?message.method(), "dropping message received after dispose");
            return;
        }
        match message {
            Message::Request(request) => self.handle_request(request),
            Message::Notification(notification) => self.handle_notification(notification),
            Message::Response(response) => self.handle_response(response),
            Message::Invalid(value) => self.handle_invalid_message(value),
        }
    }

    fn handle_request(self: &Arc<Self>, request: RequestMessage) {
        let start = Instant::now();
        self.trace_received_request(&request);

        let RequestMessage {
            id, method, params, ..
        } = request;
        let handler = read(&self.request_handlers)
            .get(&method)
            .cloned()
            .map(RegisteredRequestHandler::Method)
            .or_else(|| {
                read(&self.star_request_handler)
                    .clone()
                    .map(RegisteredRequestHandler::Star)
            });
        let Some(handler) = handler else {
            tracing::debug!(%id, method = %method, "no handler for request");
            self.reply(id, &method, start, Err(ResponseError::method_not_found(&method)));
            return;
        };

        let token_source = CancellationToken::new();
        lock(&self.request_tokens).insert(id.clone(), token_source.clone());

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler.call(&method, params, token_source.clone())
        }));
        match outcome {
            Err(_) => {
                self.remove_request_token(&id);
                self.reply(id, &method, start, Err(unexpected_failure(&method)));
            }
            Ok(HandlerResult::Empty) => {
                self.remove_request_token(&id);
                self.reply(id, &method, start, Ok(Value::Null));
            }
            Ok(HandlerResult::Immediate(result)) => {
                self.remove_request_token(&id);
                let result = result.map_err(|e| to_response_error(&method, e));
                self.reply(id, &method, start, result);
            }
            Ok(HandlerResult::Deferred(future)) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    let joined = tokio::spawn(future).await;
                    inner.remove_request_token(&id);
                    let result = match joined {
                        Ok(result) => result.map_err(|e| to_response_error(&method, e)),
                        Err(e) => {
                            tracing::warn!(%id, method = %method, error = %e, "request handler task failed");
                            Err(unexpected_failure(&method))
                        }
                    };
                    inner.reply(id, &method, start, result);
                });
            }
        }
    }

    fn remove_request_token(&self, id: &RequestId) {
        lock(&self.request_tokens).remove(id);
    }

    fn reply(&self, id: RequestId, method: &str, start: Instant, result: Result<Value, ResponseError>) {
        if self.state() == ConnectionState::Disposed {
            tracing::debug!(%id, method, "connection disposed, dropping response");
            return;
        }
        let response = match result {
            Ok(value) => ResponseMessage::success(id, value),
            Err(error) => ResponseMessage::failure(id, error),
        };
        self.trace_sending_response(&response, method, start);
        if let Err(e) = self.writer.write(Message::Response(response)) {
            self.logger
                .error(&format!("Sending response for request '{}' failed: {}", method, e));
        }
    }

    fn handle_notification(&self, notification: NotificationMessage) {
        if notification.method != LOG_TRACE_NOTIFICATION.method() {
            self.trace_received_notification(&notification);
        }

        if notification.method == CANCEL_REQUEST.method() {
            match notification
                .params
                .map(serde_json::from_value::<CancelParams>)
            {
                Some(Ok(params)) => {
                    let token = lock(&self.request_tokens).get(&params.id).cloned();
                    match token {
                        Some(token) => token.cancel(),
                        None => tracing::debug!(id = %params.id, "cancel for unknown request"),
                    }
                }
                _ => self
                    .logger
                    .warn("Received $/cancelRequest without a valid request id."),
            }
            return;
        }

        let handler = read(&self.notification_handlers)
            .get(&notification.method)
            .cloned();
        let star = read(&self.star_notification_handler).clone();
        let NotificationMessage { method, params, .. } = notification;

        let outcome = match handler {
            Some(handler) => catch_unwind(AssertUnwindSafe(|| handler(params))),
            None if method == LOG_TRACE_NOTIFICATION.method() => {
                self.log_trace(params);
                return;
            }
            None => match star {
                Some(star) => catch_unwind(AssertUnwindSafe(|| star(&method, params))),
                None => {
                    tracing::debug!(method = %method, "unhandled notification");
                    self.events
                        .unhandled_notification
                        .fire(&NotificationMessage::new(method, params));
                    return;
                }
            },
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.logger.error(&format!(
                "Notification handler '{}' failed with message: {}",
                method, e
            )),
            Err(_) => self.logger.error(&format!(
                "Notification handler '{}' failed unexpectedly.",
                method
            )),
        }
    }

    fn log_trace(&self, params: Option<Value>) {
        let Some((level, tracer)) = self.tracer() else {
            return;
        };
        match params.map(serde_json::from_value::<LogTraceParams>) {
            Some(Ok(params)) => {
                let verbose = if level == Trace::Verbose {
                    params.verbose.as_deref()
                } else {
                    None
                };
                tracer.log(&params.message, verbose);
            }
            _ => self
                .logger
                .warn("Received $/logTraceNotification without a message."),
        }
    }

    fn handle_response(&self, response: ResponseMessage) {
        let Some(pending) = self.take_pending(&response.id) else {
            self.trace_unknown_response(&response);
            return;
        };
        self.trace_received_response(&response, &pending);

        let result = match (response.result, response.error) {
            (_, Some(error)) => Err(RequestError::Response(error)),
            (Some(result), None) => Ok(result),
            (None, None) => {
                let message = format!(
                    "Response for request '{} - ({})' carries neither a result nor an error.",
                    pending.method, response.id
                );
                self.logger.error(&message);
                Err(RequestError::ProtocolViolation(message))
            }
        };
        pending.resolve(result);
    }

    fn handle_invalid_message(&self, value: Value) {
        self.logger.error(&format!(
            "Received message which is neither a response nor a notification message:\n{}",
            pretty(&value)
        ));
        let id = value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
        if let Some(pending) = id.and_then(|id| self.take_pending(&id)) {
            let message = format!(
                "received an invalid response for request '{}'",
                pending.method
            );
            pending.resolve(Err(RequestError::ProtocolViolation(message)));
        }
    }

    fn close_handler(&self) {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::New | ConnectionState::Listening => {
                    *state = ConnectionState::Closed
                }
                ConnectionState::Closed | ConnectionState::Disposed => return,
            }
        }
        tracing::debug!("connection closed");
        self.events.close.fire(&());
    }

    fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Disposed {
                return;
            }
            *state = ConnectionState::Disposed;
        }
        tracing::debug!("connection disposed");
        self.events.dispose.fire(&());

        let pending: Vec<PendingRequest> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for request in pending {
            request.resolve(Err(RequestError::Disposed));
        }
        for (_, token) in lock(&self.request_tokens).drain() {
            token.cancel();
        }

        self.reader.dispose();
        self.writer.dispose();
        self.events.error.dispose();
        self.events.close.dispose();
        self.events.unhandled_notification.dispose();
        self.events.dispose.dispose();
    }

    fn tracer(&self) -> Option<(Trace, Arc<dyn Tracer>)> {
        let trace = read(&self.trace);
        match (trace.level, trace.tracer.as_ref()) {
            (Trace::Off, _) | (_, None) => None,
            (level, Some(tracer)) => Some((level, tracer.clone())),
        }
    }

    fn params_data(level: Trace, params: &Option<Value>) -> Option<String> {
        if level != Trace::Verbose {
            return None;
        }
        Some(match params {
            Some(params) => format!("Params: {}\n\n", pretty(params)),
            None => "No parameters provided.\n\n".to_string(),
        })
    }

    fn response_data(level: Trace, response: &ResponseMessage) -> Option<String> {
        if level != Trace::Verbose {
            return None;
        }
        Some(match (&response.error, &response.result) {
            (Some(error), _) => match &error.data {
                Some(data) => format!("Error data: {}\n\n", pretty(data)),
                None => format!("Error: {} ({})\n\n", error.message, error.code),
            },
            (None, Some(result)) => format!("Result: {}\n\n", pretty(result)),
            (None, None) => "No result returned.\n\n".to_string(),
        })
    }

    fn trace_sending_request(&self, request: &RequestMessage) {
        if let Some((level, tracer)) = self.tracer() {
            let data = Self::params_data(level, &request.params);
            tracer.log(
                &format!("Sending request '{} - ({})'.", request.method, request.id),
                data.as_deref(),
            );
        }
    }

    fn trace_sending_notification(&self, notification: &NotificationMessage) {
        if let Some((level, tracer)) = self.tracer() {
            let data = Self::params_data(level, &notification.params);
            tracer.log(
                &format!("Sending notification '{}'.", notification.method),
                data.as_deref(),
            );
        }
    }

    fn trace_sending_response(&self, response: &ResponseMessage, method: &str, start: Instant) {
        if let Some((level, tracer)) = self.tracer() {
            let data = Self::response_data(level, response);
            tracer.log(
                &format!(
                    "Sending response '{} - ({})'. Processing request took {}ms",
                    method,
                    response.id,
                    start.elapsed().as_millis()
                ),
                data.as_deref(),
            );
        }
    }

    fn trace_received_request(&self, request: &RequestMessage) {
        if let Some((level, tracer)) = self.tracer() {
            let data = Self::params_data(level, &request.params);
            tracer.log(
                &format!("Received request '{} - ({})'.", request.method, request.id),
                data.as_deref(),
            );
        }
    }

    fn trace_received_notification(&self, notification: &NotificationMessage) {
        if let Some((level, tracer)) = self.tracer() {
            let data = Self::params_data(level, &notification.params);
            tracer.log(
                &format!("Received notification '{}'.", notification.method),
                data.as_deref(),
            );
        }
    }

    fn trace_received_response(&self, response: &ResponseMessage, pending: &PendingRequest) {
        if let Some((level, tracer)) = self.tracer() {
            let data = Self::response_data(level, response);
            tracer.log(
                &format!(
                    "Received response '{} - ({})' in {}ms.",
                    pending.method,
                    response.id,
                    pending.start.elapsed().as_millis()
                ),
                data.as_deref(),
            );
        }
    }

    fn trace_unknown_response(&self, response: &ResponseMessage) {
        tracing::debug!(id = %response.id, "response without active request");
        if let Some((level, tracer)) = self.tracer() {
            let data = Self::response_data(level, response);
            tracer.log(
                &format!(
                    "Received response {} without active response promise.",
                    response.id
                ),
                data.as_deref(),
            );
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.dispose();
        self.writer.dispose();
    }
}
