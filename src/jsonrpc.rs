pub mod channel;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod logger;
pub mod message_buffer;
pub mod message_parser;
pub mod reader;
pub mod trace;
pub mod types;
pub mod writer;

pub use channel::{channel_pair, ChannelEnd, ChannelReceiver, ChannelSender};
pub use connection::{
    create_channel_connection, create_stream_connection, Connection, ConnectionErrorEvent,
    ConnectionState, PendingResponse,
};
pub use error::{ConnectionError, FramingError, RequestError, TransportError};
pub use events::{Emitter, Subscription};
pub use handler::{HandlerError, HandlerResult};
pub use logger::{Logger, TracingLogger};
pub use reader::{
    ChannelMessageReader, MessageReader, PartialMessageInfo, ReaderOptions, StreamMessageReader,
};
pub use trace::{Trace, Tracer, TracingTracer};
pub use types::{
    Message, NotificationMessage, NotificationType, RequestId, RequestMessage, RequestType,
    ResponseError, ResponseMessage,
};
pub use writer::{ChannelMessageWriter, MessageWriter, StreamMessageWriter, WriterError};
