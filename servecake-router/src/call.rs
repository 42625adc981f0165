use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// The correlation ID assigned to a call when it enters the dispatcher.
pub struct CallId(pub u64);

impl Display for CallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The positional and keyword arguments of a call.
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Creates a set of arguments from positional values only.
    pub fn positional<V>(args: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<Value>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Adds a keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Returns the positional argument at `idx` if it exists.
    pub fn arg(&self, idx: usize) -> Option<&Value> {
        self.args.get(idx)
    }

    /// Returns the keyword argument with the given key if it exists.
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// How a call addresses the deployment which should serve it.
pub enum Target {
    /// Addressed directly by deployment name, as done by handles.
    Deployment(String),
    /// Addressed by a request path, as done by the HTTP front door.
    ///
    /// The deployment is resolved with a longest-prefix match.
    Route(String),
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Deployment(name) => write!(f, "deployment:{name}"),
            Target::Route(path) => write!(f, "route:{path}"),
        }
    }
}

#[derive(Debug, Clone)]
/// A single unit of work submitted to the dispatcher.
pub struct Call {
    pub(crate) id: Option<CallId>,
    pub(crate) target: Target,
    pub(crate) method: Option<Cow<'static, str>>,
    pub(crate) args: CallArgs,
    pub(crate) submitted_at: Instant,
    pub(crate) deadline: Option<Duration>,
}

impl Call {
    /// Creates a new call targeting a deployment by name.
    pub fn to_deployment(
        deployment: impl Into<String>,
        method: impl Into<Cow<'static, str>>,
        args: CallArgs,
    ) -> Self {
        Self::new(Target::Deployment(deployment.into()), Some(method.into()), args)
    }

    /// Creates a new call targeting whichever deployment owns the given path.
    ///
    /// If no method is provided, the deployment's default method is invoked.
    pub fn to_route(
        path: impl Into<String>,
        method: Option<Cow<'static, str>>,
        args: CallArgs,
    ) -> Self {
        Self::new(Target::Route(path.into()), method, args)
    }

    /// Creates a new call with an explicit target.
    ///
    /// If no method is provided, the deployment's default method is invoked.
    pub fn new(target: Target, method: Option<Cow<'static, str>>, args: CallArgs) -> Self {
        Self {
            id: None,
            target,
            method,
            args,
            submitted_at: Instant::now(),
            deadline: None,
        }
    }

    /// Sets the deadline of the call, relative to its submission time.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[inline]
    /// The correlation ID of the call, set once the dispatcher accepts it.
    pub fn id(&self) -> Option<CallId> {
        self.id
    }

    #[inline]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[inline]
    /// The explicitly requested method, if any.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    #[inline]
    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    #[inline]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    #[inline]
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

#[derive(Debug, Clone)]
/// The call metadata exposed to load balancing policies.
pub struct CallMetadata<'a> {
    pub id: CallId,
    pub deployment: &'a str,
    pub method: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The payload forwarded over a replica's call channel.
pub struct ReplicaRequest {
    pub call_id: u64,
    pub method: String,
    pub args: CallArgs,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_call_args_builders() {
        let args = CallArgs::positional(["hi", "there"]).with_kwarg("loud", true);
        assert_eq!(args.arg(0), Some(&json!("hi")));
        assert_eq!(args.arg(2), None);
        assert_eq!(args.kwarg("loud"), Some(&json!(true)));
        assert!(!args.is_empty());
        assert!(CallArgs::default().is_empty());
    }

    #[test]
    fn test_call_args_missing_fields_deserialize() {
        let args: CallArgs = serde_json::from_value(json!({ "args": [1, 2] })).unwrap();
        assert_eq!(args.args, vec![json!(1), json!(2)]);
        assert!(args.kwargs.is_empty());
    }

    #[test]
    fn test_route_call_without_method() {
        let call = Call::to_route("/echo", None, CallArgs::default())
            .with_deadline(Duration::from_secs(1));
        assert_eq!(call.method(), None);
        assert_eq!(call.deadline(), Some(Duration::from_secs(1)));
        assert_eq!(call.target(), &Target::Route("/echo".to_string()));
        assert!(call.id().is_none());
    }
}
