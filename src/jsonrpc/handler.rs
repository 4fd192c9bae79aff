use crate::jsonrpc::types::ResponseError;
use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Failure of a request handler.
///
/// A `Response` error is sent back unchanged; a `Failed` error becomes an
/// `InternalError` response carrying its message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// What a request handler produced.
pub enum HandlerResult<R = Value> {
    /// Nothing to return; answered with `null`.
    Empty,
    Immediate(Result<R, HandlerError>),
    /// Completed later; the connection keeps reading meanwhile.
    Deferred(BoxFuture<Result<R, HandlerError>>),
}

impl<R> HandlerResult<R> {
    pub fn ok(value: R) -> Self {
        HandlerResult::Immediate(Ok(value))
    }

    pub fn err(error: impl Into<HandlerError>) -> Self {
        HandlerResult::Immediate(Err(error.into()))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        HandlerResult::Deferred(Box::pin(future))
    }
}

impl<R> From<Result<R, HandlerError>> for HandlerResult<R> {
    fn from(result: Result<R, HandlerError>) -> Self {
        HandlerResult::Immediate(result)
    }
}

impl<R> HandlerResult<R>
where
    R: Serialize + Send + 'static,
{
    pub(crate) fn into_value(self) -> HandlerResult<Value> {
        match self {
            HandlerResult::Empty => HandlerResult::Empty,
            HandlerResult::Immediate(result) => {
                HandlerResult::Immediate(result.and_then(|r| to_value(&r)))
            }
            HandlerResult::Deferred(future) => HandlerResult::Deferred(Box::pin(async move {
                let result = future.await?;
                to_value(&result)
            })),
        }
    }
}

fn to_value<R: Serialize>(result: &R) -> Result<Value, HandlerError> {
    serde_json::to_value(result)
        .map_err(|e| HandlerError::Failed(anyhow!("failed to serialize result: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn typed_results_become_values() {
        match HandlerResult::ok(5u32).into_value() {
            HandlerResult::Immediate(Ok(v)) => assert_eq!(v, json!(5)),
            _ => panic!("expected immediate value"),
        }

        let deferred = HandlerResult::deferred(async { Ok(vec!["a"]) }).into_value();
        match deferred {
            HandlerResult::Deferred(future) => assert_eq!(future.await.unwrap(), json!(["a"])),
            _ => panic!("expected deferred value"),
        }
    }

    #[test]
    fn errors_pass_through() {
        let result: HandlerResult<u8> = HandlerResult::err(ResponseError::internal("boom"));
        match result.into_value() {
            HandlerResult::Immediate(Err(HandlerError::Response(e))) => {
                assert_eq!(e.message, "boom")
            }
            _ => panic!("expected response error"),
        }
    }
}
