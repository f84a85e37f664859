//! # Dispatch Tables
//!
//! A [`Service`] maps function names to handlers, built once at bind time with a
//! [`ServiceBuilder`]. Callers never see a static interface: requests name a
//! function and carry positional and keyword arguments, and [`bind_arguments`]
//! lines them up with the handler's declared parameters.
//!
//! ## Invariants
//! - **Descriptive Failures**: Every way a request can miss its target (unknown
//!   function, too many arguments, unknown or duplicate keyword, missing argument)
//!   is a [`DispatchError`] whose text names the function and the argument.
//! - **Handlers Own Nothing Shared**: Handlers receive their arguments by value and
//!   return `'static` futures, so requests on one worker run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use freerpc::Address;
use freerpc::Request;
use freerpc::Value;

/// Why a request could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    NotAvailable(String),
    ArgumentCount { function: String, expected: usize, given: usize },
    UnknownKeyword { function: String, keyword: String },
    DuplicateArgument { function: String, name: String },
    MissingArgument { function: String, name: String },
    /// The handler ran and returned an error.
    Failed(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAvailable(function) => write!(f, "Function [{}] not available.", function),
            Self::ArgumentCount { function, expected, given } => write!(
                f,
                "Function [{}] expects [{}] arguments, but [{}] were given.",
                function, expected, given
            ),
            Self::UnknownKeyword { function, keyword } => write!(
                f,
                "Keyword Argument [{}] not available for function [{}].",
                keyword, function
            ),
            Self::DuplicateArgument { function, name } => write!(
                f,
                "Function [{}] got multiple values for argument [{}].",
                function, name
            ),
            Self::MissingArgument { function, name } => write!(
                f,
                "Function [{}] missing required argument [{}].",
                function, name
            ),
            Self::Failed(description) => f.write_str(description),
        }
    }
}

impl std::error::Error for DispatchError {}

/// A declared parameter of a service method.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    name: String,
    default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self { name: name.into(), default: None }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self { name: name.into(), default: Some(default.into()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Lines up positional and keyword arguments with `params`.
///
/// Returns one value per parameter, defaults filled in.
pub fn bind_arguments(
    function: &str,
    params: &[Param],
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Vec<Value>, DispatchError> {
    if args.len() > params.len() {
        return Err(DispatchError::ArgumentCount {
            function: function.to_owned(),
            expected: params.len(),
            given: args.len(),
        });
    }

    let mut slots: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    slots.resize(params.len(), None);

    for (keyword, value) in kwargs {
        let Some(idx) = params.iter().position(|p| p.name == keyword) else {
            return Err(DispatchError::UnknownKeyword { function: function.to_owned(), keyword });
        };
        if slots[idx].is_some() {
            return Err(DispatchError::DuplicateArgument { function: function.to_owned(), name: keyword });
        }
        slots[idx] = Some(value);
    }

    slots
        .into_iter()
        .zip(params)
        .map(|(slot, param)| {
            slot.or_else(|| param.default.clone()).ok_or_else(|| DispatchError::MissingArgument {
                function: function.to_owned(),
                name: param.name.clone(),
            })
        })
        .collect()
}

/// What a handler receives: the bound arguments and who asked.
#[derive(Debug, Clone)]
pub struct Call {
    pub source: Address,
    pub args: Vec<Value>,
}

impl Call {
    /// The bound argument at `idx`; `Nil` past the end.
    pub fn arg(&self, idx: usize) -> &Value {
        const NIL: &Value = &Value::Nil;
        self.args.get(idx).unwrap_or(NIL)
    }

    pub fn str(&self, idx: usize) -> anyhow::Result<&str> {
        self.arg(idx)
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Argument {} must be a string, found {}.", idx, self.arg(idx)))
    }

    pub fn i64(&self, idx: usize) -> anyhow::Result<i64> {
        self.arg(idx)
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("Argument {} must be an integer, found {}.", idx, self.arg(idx)))
    }

    pub fn f64(&self, idx: usize) -> anyhow::Result<f64> {
        self.arg(idx)
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("Argument {} must be a number, found {}.", idx, self.arg(idx)))
    }
}

type Handler = Arc<dyn Fn(Call) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

enum Member {
    Method { params: Vec<Param>, handler: Handler },
    /// Reachable by name, but not callable.
    Constant(Value),
}

/// A dispatch table of named methods.
#[derive(Clone, Default)]
pub struct Service {
    members: Arc<HashMap<String, Member>>,
}

impl Service {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::default()
    }

    /// Names of the callable methods, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| matches!(m, Member::Method { .. }))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Value of a constant member.
    pub fn constant(&self, name: &str) -> Option<&Value> {
        match self.members.get(name) {
            Some(Member::Constant(v)) => Some(v),
            _ => None,
        }
    }

    /// Binds and runs `request`.
    pub async fn perform(&self, source: Address, request: Request) -> Result<Value, DispatchError> {
        let Request { function, arguments, keyword_arguments } = request;
        let Some(Member::Method { params, handler }) = self.members.get(&function) else {
            return Err(DispatchError::NotAvailable(function));
        };
        let args = bind_arguments(&function, params, arguments, keyword_arguments)?;
        let future = handler(Call { source, args });
        future.await.map_err(|e| DispatchError::Failed(e.to_string()))
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").field("methods", &self.method_names()).finish()
    }
}

/// Collects the members of a [`Service`].
#[derive(Default)]
pub struct ServiceBuilder {
    members: HashMap<String, Member>,
}

impl ServiceBuilder {
    /// Adds a synchronous method. A later member with the same name replaces it.
    pub fn method<F>(mut self, name: impl Into<String>, params: impl IntoIterator<Item = Param>, f: F) -> Self
    where
        F: Fn(Call) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |call| futures::future::ready(f(call)).boxed());
        self.members.insert(
            name.into(),
            Member::Method { params: params.into_iter().collect(), handler },
        );
        self
    }

    /// Adds an asynchronous method.
    pub fn async_method<F, Fut>(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = Param>,
        f: F,
    ) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |call| f(call).boxed());
        self.members.insert(
            name.into(),
            Member::Method { params: params.into_iter().collect(), handler },
        );
        self
    }

    /// Adds a non-callable attribute.
    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.members.insert(name.into(), Member::Constant(value.into()));
        self
    }

    pub fn build(self) -> Service {
        Service { members: Arc::new(self.members) }
    }
}
