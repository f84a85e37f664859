//! # Invocations
//!
//! The payload of every message: either a request (function name plus positional
//! and keyword arguments) or a response (result or error, optional warning).
//!
//! ## Invariants
//! - **Stable Keys**: The map keys are shared with peers in other languages and must
//!   not change, including the historical `KeyworkArguments` spelling.
//! - **Lenient Reading**: Decoding accepts the shapes other peers actually emit
//!   (scalar arguments, nil containers, byte-string response IDs).

use crate::error::Error;
use crate::error::Result;

use freepack::Value;

pub const KEY_TYPE: &str = "Type";
pub const KEY_FUNCTION: &str = "Function";
pub const KEY_ARGUMENTS: &str = "Arguments";
pub const KEY_KEYWORD_ARGUMENTS: &str = "KeyworkArguments";
pub const KEY_RESPONSE_ID: &str = "ResponseID";
pub const KEY_RESULT: &str = "Result";
pub const KEY_ERROR: &str = "Error";
pub const KEY_WARNING: &str = "Warning";

pub const TYPE_REQUEST: &str = "Request";
pub const TYPE_RESPONSE: &str = "Response";

/// A call of a remote function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Request {
    pub function: String,
    pub arguments: Vec<Value>,
    /// Insertion ordered.
    pub keyword_arguments: Vec<(String, Value)>,
}

/// The answer to a [`Request`], correlated by the request's message ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub response_id: String,
    /// `Err` holds the remote's human readable description.
    pub outcome: std::result::Result<Value, String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Request(Request),
    Response(Response),
}

impl Invocation {
    pub fn request(
        function: impl Into<String>,
        arguments: Vec<Value>,
        keyword_arguments: Vec<(String, Value)>,
    ) -> Self {
        Invocation::Request(Request {
            function: function.into(),
            arguments,
            keyword_arguments,
        })
    }

    pub fn response(response_id: impl Into<String>, result: Value) -> Self {
        Invocation::Response(Response {
            response_id: response_id.into(),
            outcome: Ok(result),
            warning: None,
        })
    }

    pub fn error(response_id: impl Into<String>, description: impl Into<String>) -> Self {
        Invocation::Response(Response {
            response_id: response_id.into(),
            outcome: Err(description.into()),
            warning: None,
        })
    }

    /// Attaches a warning. Requests carry no warnings and are returned unchanged.
    pub fn with_warning(self, warning: impl Into<String>) -> Self {
        match self {
            Invocation::Response(mut r) => {
                r.warning = Some(warning.into());
                Invocation::Response(r)
            }
            req => req,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Invocation::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Invocation::Response(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Invocation::Response(Response { outcome: Err(_), .. }))
    }

    pub fn function(&self) -> Option<&str> {
        match self {
            Invocation::Request(r) => Some(&r.function),
            Invocation::Response(_) => None,
        }
    }

    pub fn response_id(&self) -> Option<&str> {
        match self {
            Invocation::Response(r) => Some(&r.response_id),
            Invocation::Request(_) => None,
        }
    }

    /// Builds the wire map.
    pub fn to_value(&self) -> Value {
        let mut entries: Vec<(Value, Value)> = Vec::with_capacity(4);
        let mut put = |k: &str, v: Value| entries.push((Value::from(k), v));
        match self {
            Invocation::Request(r) => {
                put(KEY_TYPE, Value::from(TYPE_REQUEST));
                put(KEY_FUNCTION, Value::from(r.function.as_str()));
                put(KEY_ARGUMENTS, Value::Array(r.arguments.clone()));
                put(
                    KEY_KEYWORD_ARGUMENTS,
                    Value::Map(
                        r.keyword_arguments
                            .iter()
                            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
                            .collect(),
                    ),
                );
            }
            Invocation::Response(r) => {
                put(KEY_TYPE, Value::from(TYPE_RESPONSE));
                put(KEY_RESPONSE_ID, Value::from(r.response_id.as_str()));
                match &r.outcome {
                    Ok(v) => put(KEY_RESULT, v.clone()),
                    Err(e) => put(KEY_ERROR, Value::from(e.as_str())),
                }
                if let Some(w) = &r.warning {
                    put(KEY_WARNING, Value::from(w.as_str()));
                }
            }
        }
        Value::Map(entries)
    }

    /// Reads the wire map.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(entries) = value else {
            return Err(Error::MalformedInvocation(format!("expected a map, found {}", value)));
        };

        let mut ty = None;
        let mut function = None;
        let mut arguments = Value::Nil;
        let mut keyword_arguments = Value::Nil;
        let mut response_id = None;
        let mut result = None;
        let mut error = None;
        let mut warning = None;

        for (key, val) in entries {
            match key.as_str() {
                Some(KEY_TYPE) => ty = Some(val),
                Some(KEY_FUNCTION) => function = Some(val),
                Some(KEY_ARGUMENTS) => arguments = val,
                Some(KEY_KEYWORD_ARGUMENTS) => keyword_arguments = val,
                Some(KEY_RESPONSE_ID) => response_id = Some(val),
                Some(KEY_RESULT) => result = Some(val),
                Some(KEY_ERROR) => error = Some(val),
                Some(KEY_WARNING) => warning = Some(val),
                _ => {}
            }
        }

        match ty.as_ref().and_then(Value::as_str) {
            Some(TYPE_REQUEST) => {
                let function = match function {
                    Some(Value::String(s)) => s,
                    other => {
                        return Err(Error::MalformedInvocation(format!(
                            "request without a function name: {}",
                            other.unwrap_or_default()
                        )));
                    }
                };
                let arguments = match arguments {
                    Value::Nil => Vec::new(),
                    Value::Array(items) => items,
                    scalar => vec![scalar],
                };
                let keyword_arguments = match keyword_arguments {
                    Value::Nil => Vec::new(),
                    Value::Map(entries) => entries
                        .into_iter()
                        .map(|(k, v)| match k {
                            Value::String(s) => Ok((s, v)),
                            other => Err(Error::MalformedInvocation(format!(
                                "keyword argument name is not a string: {}",
                                other
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?,
                    other => {
                        return Err(Error::MalformedInvocation(format!(
                            "keyword arguments are not a map: {}",
                            other
                        )));
                    }
                };
                Ok(Invocation::Request(Request { function, arguments, keyword_arguments }))
            }
            Some(TYPE_RESPONSE) => {
                let response_id = match response_id {
                    Some(Value::String(s)) => s,
                    Some(Value::Binary(b)) => String::from_utf8_lossy(&b).into_owned(),
                    Some(Value::Integer(i)) => i.to_string(),
                    other => {
                        return Err(Error::MalformedInvocation(format!(
                            "response without an id: {}",
                            other.unwrap_or_default()
                        )));
                    }
                };
                let outcome = match error {
                    Some(e) => Err(text_of(e)),
                    None => Ok(result.unwrap_or_default()),
                };
                let warning = warning.filter(|w| !w.is_nil()).map(text_of);
                Ok(Invocation::Response(Response { response_id, outcome, warning }))
            }
            _ => Err(Error::MalformedInvocation(format!(
                "unknown invocation type: {}",
                ty.unwrap_or_default()
            ))),
        }
    }

    /// Serializes to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(freepack::encode(&self.to_value())?)
    }

    /// Deserializes from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_value(freepack::decode(bytes)?)
    }
}

/// Descriptions from other peers are normally strings; anything else is rendered.
fn text_of(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
        other => other.to_string(),
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invocation::Request(r) => {
                write!(f, "Request: {}(", r.function)?;
                let mut first = true;
                for a in &r.arguments {
                    if !first { write!(f, ", ")?; }
                    first = false;
                    write!(f, "{}", a)?;
                }
                for (k, v) in &r.keyword_arguments {
                    if !first { write!(f, ", ")?; }
                    first = false;
                    write!(f, "{}={}", k, v)?;
                }
                write!(f, ")")
            }
            Invocation::Response(r) => {
                match &r.outcome {
                    Ok(v) => write!(f, "Response [{}]: {}", r.response_id, v)?,
                    Err(e) => write!(f, "Error [{}]: {}", r.response_id, e)?,
                }
                if let Some(w) = &r.warning {
                    write!(f, " (warning: {})", w)?;
                }
                Ok(())
            }
        }
    }
}
