//! Service registration and typed dispatch.
//!
//! A service is a receiver object plus a table of named methods. Each method
//! is registered with a typed handler `Fn(Arc<T>, Args) -> Future<Output =
//! Result<Reply, E>>`; registration erases the argument and reply types
//! behind closures so the server can dispatch by name.
//!
//! ```
//! use std::sync::Arc;
//! use serde::Deserialize;
//! use tern_rpc::Service;
//!
//! #[derive(Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! struct Foo;
//!
//! impl Foo {
//!     async fn sum(self: Arc<Self>, args: Args) -> Result<i64, String> {
//!         Ok(args.num1 + args.num2)
//!     }
//! }
//!
//! let service = Service::from_receiver(Foo).method("Sum", Foo::sum).build();
//! assert_eq!(service.name(), "Foo");
//! assert!(service.method("Sum").is_some());
//! ```

use crate::codec::CodecType;
use crate::error::{HandlerError, Result};

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A decoded request argument, typed by the method that decoded it.
pub type Argv = Box<dyn Any + Send>;

type DecodeFn = Box<dyn Fn(CodecType, &[u8]) -> Result<Argv> + Send + Sync>;
type CallFuture = BoxFuture<'static, std::result::Result<Bytes, HandlerError>>;
type InvokeFn = Box<dyn Fn(CodecType, Argv) -> CallFuture + Send + Sync>;

/// Whether `name` is an exported identifier.
pub(crate) fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One callable method of a service.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    decode: DecodeFn,
    invoke: InvokeFn,
}

impl MethodType {
    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name of the argument.
    #[must_use]
    pub const fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Type name of the reply.
    #[must_use]
    pub const fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of invocation attempts so far, failed ones included.
    #[must_use]
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode a request body into a fresh argument of this method's type.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not decode into the argument type.
    pub fn new_argv(&self, codec: CodecType, body: &[u8]) -> Result<Argv> {
        (self.decode)(codec, body)
    }
}

impl fmt::Debug for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish_non_exhaustive()
    }
}

/// A registered receiver and its dispatch table.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Start building a service named `name` around `receiver`.
    pub fn builder<T>(name: impl Into<String>, receiver: T) -> ServiceBuilder<T>
    where
        T: Send + Sync + 'static,
    {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// Start building a service named after the receiver's type.
    pub fn from_receiver<T>(receiver: T) -> ServiceBuilder<T>
    where
        T: Send + Sync + 'static,
    {
        Self::builder(receiver_name::<T>(), receiver)
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look a method up by name.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Names of all registered methods.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the dispatch table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Invoke `method` with a decoded argument.
    ///
    /// Counts the attempt before running the handler. The returned future
    /// yields the encoded reply, or the handler's error.
    pub fn call(
        &self,
        method: &MethodType,
        codec: CodecType,
        argv: Argv,
    ) -> BoxFuture<'static, std::result::Result<Bytes, HandlerError>> {
        method.num_calls.fetch_add(1, Ordering::Relaxed);
        (method.invoke)(codec, argv)
    }
}

/// Builder collecting the methods of a [`Service`].
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<T> ServiceBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Register a method.
    ///
    /// Methods whose names are not exported identifiers are skipped, as is a
    /// second method under a name already taken.
    #[must_use]
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        if !is_exported(name) {
            debug!("rpc server: skipping unexported method {}.{}", self.name, name);
            return self;
        }
        if self.methods.contains_key(name) {
            warn!("rpc server: method {}.{} registered twice", self.name, name);
            return self;
        }

        let receiver = Arc::clone(&self.receiver);
        let decode: DecodeFn = Box::new(|codec: CodecType, body: &[u8]| {
            codec.decode::<A>(body).map(|argv| Box::new(argv) as Argv)
        });
        let invoke: InvokeFn = Box::new(move |codec: CodecType, argv: Argv| -> CallFuture {
            let Ok(argv) = argv.downcast::<A>() else {
                return Box::pin(future::ready(Err(HandlerError::Internal(format!(
                    "argument is not a {}",
                    type_name::<A>()
                )))));
            };
            let reply = handler(Arc::clone(&receiver), *argv);
            Box::pin(async move {
                match reply.await {
                    Ok(reply) => codec
                        .encode(&reply)
                        .map_err(|e| HandlerError::Internal(e.to_string())),
                    Err(e) => Err(HandlerError::Method(e.to_string())),
                }
            })
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(MethodType {
                name: name.to_string(),
                arg_type: type_name::<A>(),
                reply_type: type_name::<R>(),
                num_calls: AtomicU64::new(0),
                decode,
                invoke,
            }),
        );
        info!("rpc server: register {}.{}", self.name, name);
        self
    }

    /// Finish the service.
    #[must_use]
    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

impl<T> From<ServiceBuilder<T>> for Service
where
    T: Send + Sync + 'static,
{
    fn from(builder: ServiceBuilder<T>) -> Self {
        builder.build()
    }
}

/// Last path segment of `T`'s type name, generics stripped.
fn receiver_name<T>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
