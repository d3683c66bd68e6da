//! Schemas and their decomposition.
//!
//! A schema is the tree a context publishes: named maps all the way down,
//! with two kinds of leaves, plain data and callable methods. Before
//! anything crosses a port the schema is decomposed: every method is pulled
//! out into a flat directory keyed by its dotted path, and what remains is
//! a pure-data residual that can be serialized.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::envelope::CallError;
use crate::value::Value;

/// Future returned by a method body.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send>>;

/// A callable method: positional args plus the peer handle the engine
/// appends so method bodies can call back without extra setup.
pub type Method = Arc<dyn Fn(Vec<Value>, Peer) -> MethodFuture + Send + Sync>;

/// The callback surface a method body sees. On an RPC connection this is
/// the remote proxy; bridge invocations run detached.
pub trait PeerCaller: Send + Sync {
    fn call(&self, path: &str, args: Vec<Value>) -> MethodFuture;
}

/// Handle passed to every method invocation.
#[derive(Clone)]
pub struct Peer {
    inner: Option<Arc<dyn PeerCaller>>,
}

impl Peer {
    /// A peer that answers no calls; used for bridge-side invocations.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    pub fn attached(caller: Arc<dyn PeerCaller>) -> Self {
        Self {
            inner: Some(caller),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    /// Invoke a method on the peer by dotted path.
    pub async fn call(&self, path: &str, args: Vec<Value>) -> Result<Value, CallError> {
        match &self.inner {
            Some(caller) => caller.call(path, args).await,
            None => Err(CallError::new(
                "ReferenceError",
                "no peer is attached to this invocation",
            )),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_attached() {
            "Peer(attached)"
        } else {
            "Peer(detached)"
        })
    }
}

/// One node of a published schema.
pub enum Schema {
    /// Named children, traversed during decomposition.
    Map(BTreeMap<String, Schema>),
    /// Opaque data leaf (arrays and non-map values are never traversed).
    Data(Value),
    /// Callable leaf.
    Method(Method),
}

impl Schema {
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Schema)>) -> Self {
        Schema::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn empty() -> Self {
        Schema::Map(BTreeMap::new())
    }

    pub fn data(value: impl Into<Value>) -> Self {
        Schema::Data(value.into())
    }

    pub fn method<F, Fut>(body: F) -> Self
    where
        F: Fn(Vec<Value>, Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        Schema::Method(Arc::new(move |args, peer| -> MethodFuture {
            Box::pin(body(args, peer))
        }))
    }

    /// Rebuild a schema from a residual value, so that decomposition can be
    /// applied again (yielding an empty directory and the same residual).
    pub fn from_residual(value: Value) -> Self {
        match value {
            Value::Map(entries) => Schema::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Schema::from_residual(v)))
                    .collect(),
            ),
            other => Schema::Data(other),
        }
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schema::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
            Schema::Data(v) => write!(f, "Data({v:?})"),
            Schema::Method(_) => f.write_str("Method"),
        }
    }
}

/// The flat set of dotted paths naming every method in a schema, each with
/// its extracted body. Iteration order follows the paths.
#[derive(Clone, Default)]
pub struct MethodDirectory {
    methods: BTreeMap<String, Method>,
}

impl MethodDirectory {
    pub fn get(&self, path: &str) -> Option<&Method> {
        self.methods.get(path)
    }

    /// The dotted paths, in directory order.
    pub fn paths(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Method)> {
        self.methods.iter()
    }
}

impl std::fmt::Debug for MethodDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.methods.keys()).finish()
    }
}

/// Split a schema into its method directory and pure-data residual.
///
/// Depth-first walk: method leaves are removed and recorded under their
/// dotted path; everything else (including empty maps) is preserved in
/// the residual.
pub fn decompose(schema: Schema) -> (MethodDirectory, Value) {
    let mut directory = MethodDirectory::default();
    let residual = walk(schema, "", &mut directory);
    (directory, residual)
}

fn walk(node: Schema, prefix: &str, directory: &mut MethodDirectory) -> Value {
    match node {
        Schema::Map(entries) => {
            let mut residual = BTreeMap::new();
            for (key, child) in entries {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match child {
                    Schema::Method(method) => {
                        directory.methods.insert(path, method);
                    }
                    other => {
                        residual.insert(key, walk(other, &path, directory));
                    }
                }
            }
            Value::Map(residual)
        }
        Schema::Data(value) => value,
        // A method at the root has no path to live under; it is dropped the
        // same way a non-map root loses nothing: the residual is null.
        Schema::Method(_) => Value::Null,
    }
}
