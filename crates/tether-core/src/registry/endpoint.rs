//! Endpoint descriptors: the explicit method table of a service interface.
//!
//! A service interface lists its methods once, at startup, as
//! [`MethodDescriptor`]s. Each descriptor wraps a typed handler
//! (`Fn(Arc<S>, A1, .., An) -> impl Future<Output = Result<R, E>>`) behind a
//! uniform `Vec<Value> -> Value` invoker, so the dispatcher never needs to know
//! concrete parameter types.
//!
//! ```rust,ignore
//! struct Agent;
//!
//! impl ServiceInterface for Agent {
//!     const NAME: &'static str = "agent";
//!
//!     fn methods() -> Vec<MethodDescriptor<Self>> {
//!         vec![
//!             MethodDescriptor::new("dumpThread", |_agent: Arc<Agent>| async move {
//!                 Ok::<_, String>("main: RUNNABLE".to_string())
//!             }),
//!             MethodDescriptor::new("fetchConfig", |_agent: Arc<Agent>, key: String| async move {
//!                 Ok::<_, String>(Some(key))
//!             }),
//!         ]
//!     }
//! }
//! ```

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Descriptor of a declared parameter or return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamType {
    name: &'static str,
}

impl ParamType {
    pub fn of<T: ?Sized>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Failure of a single endpoint invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// An argument could not be converted to its declared type.
    BadArgument {
        index: usize,
        expected: &'static str,
        message: String,
    },
    /// The endpoint ran and returned an error.
    Failed(String),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::BadArgument {
                index,
                expected,
                message,
            } => write!(f, "argument {} is not a valid {}: {}", index, expected, message),
            InvokeError::Failed(message) => f.write_str(message),
        }
    }
}

type Invocation = BoxFuture<'static, Result<Value, InvokeError>>;
type Invoker<S> = Arc<dyn Fn(Arc<S>, Vec<Value>) -> Invocation + Send + Sync>;

/// A typed method implementation taking `Args` after the target instance.
///
/// Implemented for async functions and closures of up to six parameters.
pub trait Handler<S, Args>: Send + Sync + 'static {
    fn parameter_types(&self) -> Vec<ParamType>;

    fn return_type(&self) -> ParamType;

    fn call(&self, target: Arc<S>, args: Vec<Value>) -> Invocation;
}

fn convert_arg<T: DeserializeOwned>(index: usize, value: Option<Value>) -> Result<T, InvokeError> {
    let expected = std::any::type_name::<T>();
    let value = value.ok_or_else(|| InvokeError::BadArgument {
        index,
        expected,
        message: "missing".to_string(),
    })?;
    serde_json::from_value(value).map_err(|e| InvokeError::BadArgument {
        index,
        expected,
        message: e.to_string(),
    })
}

macro_rules! impl_handler {
    ($(($ty:ident, $arg:ident, $idx:expr)),*) => {
        impl<S, F, Fut, R, E, $($ty,)*> Handler<S, ($($ty,)*)> for F
        where
            S: Send + Sync + 'static,
            F: Fn(Arc<S>, $($ty,)*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            R: Serialize + Send + 'static,
            E: fmt::Display + Send + 'static,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            fn parameter_types(&self) -> Vec<ParamType> {
                vec![$(ParamType::of::<$ty>(),)*]
            }

            fn return_type(&self) -> ParamType {
                ParamType::of::<R>()
            }

            #[allow(unused_mut, unused_variables)]
            fn call(&self, target: Arc<S>, args: Vec<Value>) -> Invocation {
                let mut args = args.into_iter();
                $(
                    let $arg = match convert_arg::<$ty>($idx, args.next()) {
                        Ok(value) => value,
                        Err(e) => return Box::pin(async move { Err(e) }),
                    };
                )*
                let fut = (self)(target, $($arg,)*);
                Box::pin(async move {
                    let value = fut.await.map_err(|e| InvokeError::Failed(e.to_string()))?;
                    serde_json::to_value(&value).map_err(|e| {
                        InvokeError::Failed(format!("failed to encode return value: {}", e))
                    })
                })
            }
        }
    };
}

impl_handler!();
impl_handler!((A1, a1, 0));
impl_handler!((A1, a1, 0), (A2, a2, 1));
impl_handler!((A1, a1, 0), (A2, a2, 1), (A3, a3, 2));
impl_handler!((A1, a1, 0), (A2, a2, 1), (A3, a3, 2), (A4, a4, 3));
impl_handler!((A1, a1, 0), (A2, a2, 1), (A3, a3, 2), (A4, a4, 3), (A5, a5, 4));
impl_handler!((A1, a1, 0), (A2, a2, 1), (A3, a3, 2), (A4, a4, 3), (A5, a5, 4), (A6, a6, 5));

/// A service interface: a named, fixed table of methods.
pub trait ServiceInterface: Send + Sync + Sized + 'static {
    /// Default service name for every method of the interface.
    const NAME: &'static str;

    /// The interface's declared methods.
    fn methods() -> Vec<MethodDescriptor<Self>>;
}

/// One declared method of a service interface.
pub struct MethodDescriptor<S> {
    name: String,
    service_override: Option<String>,
    method_override: Option<String>,
    parameter_types: Vec<ParamType>,
    return_type: ParamType,
    invoker: Invoker<S>,
}

impl<S: Send + Sync + 'static> MethodDescriptor<S> {
    /// Declare a method named `name` implemented by `handler`.
    pub fn new<Args, H>(name: impl Into<String>, handler: H) -> Self
    where
        H: Handler<S, Args>,
    {
        let parameter_types = handler.parameter_types();
        let return_type = handler.return_type();
        let invoker: Invoker<S> = Arc::new(move |target, args| handler.call(target, args));
        Self {
            name: name.into(),
            service_override: None,
            method_override: None,
            parameter_types,
            return_type,
            invoker,
        }
    }

    /// Bind this method under another service name.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service_override = Some(service.into());
        self
    }

    /// Bind this method under another method name.
    pub fn rename(mut self, method: impl Into<String>) -> Self {
        self.method_override = Some(method.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_types(&self) -> &[ParamType] {
        &self.parameter_types
    }

    /// Whether an explicit service or method override is present.
    pub fn is_overridden(&self) -> bool {
        self.service_override.is_some() || self.method_override.is_some()
    }

    /// The `(service, method)` pair this descriptor binds to.
    pub fn resolved_names(&self, default_service: &str) -> (String, String) {
        let service = self
            .service_override
            .clone()
            .unwrap_or_else(|| default_service.to_string());
        let method = self
            .method_override
            .clone()
            .unwrap_or_else(|| self.name.clone());
        (service, method)
    }

    /// Bind the descriptor to a concrete target instance.
    pub(crate) fn bind(self, default_service: &str, target: Arc<S>) -> ServiceEndpoint {
        let (service_name, method_name) = self.resolved_names(default_service);
        let invoker = self.invoker;
        ServiceEndpoint {
            service_name,
            method_name,
            parameter_types: self.parameter_types,
            return_type: self.return_type,
            invoke: Box::new(move |args| invoker(target.clone(), args)),
        }
    }
}

impl<S> fmt::Debug for MethodDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("service_override", &self.service_override)
            .field("method_override", &self.method_override)
            .field("parameter_types", &self.parameter_types)
            .finish()
    }
}

/// A registered `(service, method)` binding to a callable on a target instance.
pub struct ServiceEndpoint {
    service_name: String,
    method_name: String,
    parameter_types: Vec<ParamType>,
    return_type: ParamType,
    invoke: Box<dyn Fn(Vec<Value>) -> Invocation + Send + Sync>,
}

impl ServiceEndpoint {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn parameter_types(&self) -> &[ParamType] {
        &self.parameter_types
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_types.len()
    }

    pub fn return_type(&self) -> ParamType {
        self.return_type
    }

    /// `service.method`, for logs and error messages.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.service_name, self.method_name)
    }

    /// Invoke with already-decoded arguments, one per declared parameter.
    pub fn invoke(&self, args: Vec<Value>) -> Invocation {
        (self.invoke)(args)
    }
}

impl fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .field("parameter_types", &self.parameter_types)
            .field("return_type", &self.return_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Calculator {
        offset: i64,
    }

    fn add_descriptor() -> MethodDescriptor<Calculator> {
        MethodDescriptor::new("add", |calc: Arc<Calculator>, a: i64, b: i64| async move {
            Ok::<_, String>(a + b + calc.offset)
        })
    }

    #[tokio::test]
    async fn test_bound_endpoint_invokes_handler() {
        let endpoint = add_descriptor().bind("calc", Arc::new(Calculator { offset: 10 }));
        assert_eq!(endpoint.qualified_name(), "calc.add");
        assert_eq!(endpoint.parameter_count(), 2);
        assert_eq!(endpoint.parameter_types()[0].name(), "i64");

        let result = endpoint.invoke(vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(result, json!(13));
    }

    #[tokio::test]
    async fn test_argument_type_mismatch() {
        let endpoint = add_descriptor().bind("calc", Arc::new(Calculator { offset: 0 }));
        let err = endpoint
            .invoke(vec![json!(1), json!("two")])
            .await
            .unwrap_err();
        match err {
            InvokeError::BadArgument { index, expected, .. } => {
                assert_eq!(index, 1);
                assert_eq!(expected, "i64");
            }
            other => panic!("Expected BadArgument, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_message_is_preserved() {
        let descriptor = MethodDescriptor::new("fail", |_calc: Arc<Calculator>| async move {
            Err::<(), _>("division by zero")
        });
        let endpoint = descriptor.bind("calc", Arc::new(Calculator { offset: 0 }));
        let err = endpoint.invoke(vec![]).await.unwrap_err();
        assert_eq!(err, InvokeError::Failed("division by zero".to_string()));
    }

    #[tokio::test]
    async fn test_unit_return_is_null() {
        let descriptor = MethodDescriptor::new("noop", |_calc: Arc<Calculator>, _x: String| async move {
            Ok::<_, String>(())
        });
        let endpoint = descriptor.bind("calc", Arc::new(Calculator { offset: 0 }));
        assert_eq!(endpoint.invoke(vec![json!("x")]).await.unwrap(), Value::Null);
    }

    #[test]
    fn test_overrides_change_resolved_names() {
        let plain = add_descriptor();
        assert!(!plain.is_overridden());
        assert_eq!(plain.resolved_names("calc"), ("calc".into(), "add".into()));

        let renamed = add_descriptor().service("math").rename("plus");
        assert!(renamed.is_overridden());
        assert_eq!(renamed.resolved_names("calc"), ("math".into(), "plus".into()));
    }
}
