use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use http::request::Parts;
use serde_json::Value;
use servecake_router::CallArgs;

#[derive(Debug, thiserror::Error)]
/// The request could not be converted into call arguments.
pub enum AdapterError {
    #[error("Invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
/// Converts an inbound HTTP request into the arguments of a call.
///
/// The front door resolves the deployment and method itself, adapters only
/// deal with the request body and headers.
pub trait RequestAdapter: Send + Sync + 'static {
    async fn adapt(&self, parts: &Parts, body: Bytes) -> Result<CallArgs, AdapterError>;
}

#[derive(Debug, Default, Copy, Clone)]
/// The default adapter, reading the body as JSON.
///
/// - An empty body produces no arguments.
/// - An array becomes the positional arguments.
/// - An object containing only `args` and/or `kwargs` keys is read as both.
/// - Any other object becomes the keyword arguments.
/// - Any other value becomes a single positional argument.
pub struct JsonAdapter;

#[async_trait]
impl RequestAdapter for JsonAdapter {
    async fn adapt(&self, _parts: &Parts, body: Bytes) -> Result<CallArgs, AdapterError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(CallArgs::default());
        }

        let value: Value = serde_json::from_slice(&body)?;
        json_to_args(value)
    }
}

fn json_to_args(value: Value) -> Result<CallArgs, AdapterError> {
    match value {
        Value::Array(args) => Ok(CallArgs {
            args,
            kwargs: BTreeMap::new(),
        }),
        Value::Object(mut map) if is_call_args_shape(&map) => {
            let args = match map.remove("args") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(args)) => args,
                Some(_) => {
                    return Err(AdapterError::InvalidRequest(
                        "`args` must be an array".to_string(),
                    ))
                },
            };

            let kwargs = match map.remove("kwargs") {
                None | Some(Value::Null) => BTreeMap::new(),
                Some(Value::Object(kwargs)) => kwargs.into_iter().collect(),
                Some(_) => {
                    return Err(AdapterError::InvalidRequest(
                        "`kwargs` must be an object".to_string(),
                    ))
                },
            };

            Ok(CallArgs { args, kwargs })
        },
        Value::Object(map) => Ok(CallArgs {
            args: Vec::new(),
            kwargs: map.into_iter().collect(),
        }),
        other => Ok(CallArgs::positional([other])),
    }
}

fn is_call_args_shape(map: &serde_json::Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|key| key == "args" || key == "kwargs")
}
