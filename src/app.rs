use jsonrpc_connection::jsonrpc::trace::SET_TRACE_NOTIFICATION;
use jsonrpc_connection::jsonrpc::types::error_codes;
use jsonrpc_connection::jsonrpc::{
    Connection, HandlerResult, MessageReader, ReaderOptions, RequestType, ResponseError,
    StreamMessageReader, StreamMessageWriter, Trace, TracingLogger, TracingTracer,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::cli::Config;

#[derive(Serialize, Deserialize, Debug)]
pub struct AddParams {
    pub a: i64,
    pub b: i64,
}

pub const ADD: RequestType<AddParams, i64> = RequestType::new("math/add");
pub const EXIT: &str = "exit";

#[derive(Debug)]
enum Control {
    SetTrace(Trace),
    Exit,
    Closed,
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let reader = watched_reader(tokio::io::stdin(), config.partial_message_timeout);
    let writer = StreamMessageWriter::new(tokio::io::stdout());
    let connection = Connection::new(reader, writer, Arc::new(TracingLogger));

    serve(connection, config.trace).await
}

/// Stream reader that logs a warning while a message stays incomplete.
fn watched_reader<R>(source: R, partial_message_timeout: Duration) -> StreamMessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = StreamMessageReader::with_options(
        source,
        ReaderOptions {
            partial_message_timeout,
        },
    );
    reader.on_partial_message().subscribe(|info| {
        tracing::warn!(
            token = info.message_token,
            waited_ms = info.waiting_time.as_millis() as u64,
            "message still incomplete"
        );
    });
    reader
}

/// Serve `math/add` until the peer sends `exit` or the transport closes.
async fn serve(connection: Connection, trace: Trace) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    register_handlers(&connection, tx)?;
    connection.trace(trace, Some(Arc::new(TracingTracer)), false)?;
    connection.listen()?;
    tracing::info!(trace = %trace, "listening");

    while let Some(control) = rx.recv().await {
        match control {
            Control::SetTrace(level) => {
                tracing::info!(trace = %level, "trace level changed by peer");
                connection.trace(level, Some(Arc::new(TracingTracer)), false)?;
            }
            Control::Exit => {
                tracing::info!("exit requested");
                break;
            }
            Control::Closed => {
                tracing::info!("peer closed the connection");
                break;
            }
        }
    }

    connection.dispose();
    Ok(())
}

fn register_handlers(
    connection: &Connection,
    tx: mpsc::UnboundedSender<Control>,
) -> anyhow::Result<()> {
    connection.on_request(&ADD, |params, _| match params.a.checked_add(params.b) {
        Some(sum) => HandlerResult::ok(sum),
        None => HandlerResult::err(ResponseError::new(
            error_codes::INVALID_PARAMS,
            "sum does not fit into a 64-bit integer",
        )),
    })?;

    let set_trace = tx.clone();
    connection.on_notification(&SET_TRACE_NOTIFICATION, move |params| {
        set_trace.send(Control::SetTrace(params.value))?;
        Ok(())
    })?;

    let exit = tx.clone();
    connection.on_raw_notification(EXIT, move |_| {
        exit.send(Control::Exit)?;
        Ok(())
    })?;

    connection.on_close().subscribe(move |_| {
        let _ = tx.send(Control::Closed);
    });
    Ok(())
}
