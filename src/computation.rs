//! Computation definitions, argument binding, and refs.
//!
//! A `Computation` is a registered, immutable unit of work: name, version,
//! declared parameter schema, and a body closure. Binding arguments against
//! the schema produces a `Ref` — a content-addressed `Key` plus the fully
//! resolved call arguments. The parameter schema is validated when the
//! computation is built, not at call time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::key::{Config, ConfigValue, EPHEMERAL_PREFIX, Key};
use crate::store::Store;

/// Anything that can stand in for a key: a `Key`, a `Ref`, or an `Entry`.
pub trait ToKey {
    fn to_key(&self) -> &Key;
}

impl ToKey for Key {
    fn to_key(&self) -> &Key {
        self
    }
}

impl ToKey for Ref {
    fn to_key(&self) -> &Key {
        &self.key
    }
}

impl ToKey for Entry {
    fn to_key(&self) -> &Key {
        &self.key
    }
}

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

/// A declared parameter: name, optional default, and whether it is
/// ephemeral (reserved `__` prefix — passed to the body, excluded from
/// cache identity).
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    default: Option<ConfigValue>,
    ephemeral: bool,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> Option<&ConfigValue> {
        self.default.as_ref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }
}

/// Named arguments for one call site.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: Vec<(String, ConfigValue)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

type Body = dyn Fn(&CallContext<'_>) -> Result<serde_json::Value> + Send + Sync;

struct Inner {
    name: String,
    version: u32,
    params: Vec<Param>,
    accept_extra: bool,
    body: Box<Body>,
}

/// A registered, reusable computation definition. Immutable after `build()`;
/// cheap to clone and share across threads.
#[derive(Clone)]
pub struct Computation {
    inner: Arc<Inner>,
}

/// Builder for a `Computation`. Schema violations are reported by `build()`.
pub struct ComputationBuilder {
    name: String,
    version: u32,
    params: Vec<Param>,
    accept_extra: bool,
    body: Option<Box<Body>>,
}

impl ComputationBuilder {
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Declare a required parameter. Names starting with `__` are
    /// ephemeral: bound and passed to the body, but not part of identity.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let ephemeral = name.starts_with(EPHEMERAL_PREFIX);
        self.params.push(Param {
            name,
            default: None,
            ephemeral,
        });
        self
    }

    /// Declare a parameter with a default value.
    pub fn param_default(mut self, name: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        let name = name.into();
        let ephemeral = name.starts_with(EPHEMERAL_PREFIX);
        self.params.push(Param {
            name,
            default: Some(value.into()),
            ephemeral,
        });
        self
    }

    /// Accept arguments beyond the declared parameters. Undeclared
    /// arguments land in the config like any other bound parameter.
    pub fn accept_extra_args(mut self) -> Self {
        self.accept_extra = true;
        self
    }

    pub fn body<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext<'_>) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.body = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<Computation> {
        if self.name.is_empty() {
            return Err(Error::Definition("computation name is empty".to_string()));
        }
        for (i, param) in self.params.iter().enumerate() {
            if param.name.is_empty() {
                return Err(Error::Definition(format!(
                    "parameter {i} of '{}' has an empty name",
                    self.name
                )));
            }
            if self.params[..i].iter().any(|p| p.name == param.name) {
                return Err(Error::Definition(format!(
                    "duplicate parameter '{}' in '{}'",
                    param.name, self.name
                )));
            }
        }
        let body = self
            .body
            .ok_or_else(|| Error::Definition(format!("computation '{}' has no body", self.name)))?;
        Ok(Computation {
            inner: Arc::new(Inner {
                name: self.name,
                version: self.version,
                params: self.params,
                accept_extra: self.accept_extra,
                body,
            }),
        })
    }
}

impl Computation {
    pub fn builder(name: impl Into<String>) -> ComputationBuilder {
        ComputationBuilder {
            name: name.into(),
            version: 0,
            params: Vec::new(),
            accept_extra: false,
            body: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn params(&self) -> &[Param] {
        &self.inner.params
    }

    /// Bind arguments against the declared schema at replica 0.
    pub fn bind(&self, args: Args) -> Result<Ref> {
        self.bind_with(args, None, 0)
    }

    /// Bind arguments, optionally overriding the version, at the given
    /// replica index. Defaults are applied for unbound declared parameters;
    /// every bound non-ephemeral parameter becomes part of the config.
    pub fn bind_with(&self, args: Args, version: Option<u32>, replica: u32) -> Result<Ref> {
        let version = version.unwrap_or(self.inner.version);
        let mut resolved: BTreeMap<String, ConfigValue> = BTreeMap::new();
        for (name, value) in args.values {
            if !self.inner.accept_extra && !self.inner.params.iter().any(|p| p.name == name) {
                return Err(Error::InvalidArguments(format!(
                    "unknown argument '{name}' for computation '{}'",
                    self.inner.name
                )));
            }
            if resolved.insert(name.clone(), value).is_some() {
                return Err(Error::InvalidArguments(format!(
                    "argument '{name}' given more than once for computation '{}'",
                    self.inner.name
                )));
            }
        }
        for param in &self.inner.params {
            if resolved.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    resolved.insert(param.name.clone(), default.clone());
                }
                None => {
                    return Err(Error::InvalidArguments(format!(
                        "missing argument '{}' for computation '{}'",
                        param.name, self.inner.name
                    )));
                }
            }
        }
        let config: Config = resolved
            .iter()
            .filter(|(name, _)| !name.starts_with(EPHEMERAL_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let key = Key::new(self.inner.name.clone(), version, config, replica)?;
        Ok(Ref {
            key,
            computation: self.clone(),
            args: resolved,
        })
    }

    /// One ref per replica index, same config otherwise. Pass `0..n` for
    /// the first-n case, or any other set of indices.
    pub fn replica_refs(
        &self,
        replicas: impl IntoIterator<Item = u32>,
        args: Args,
    ) -> Result<Vec<Ref>> {
        replicas
            .into_iter()
            .map(|replica| self.bind_with(args.clone(), None, replica))
            .collect()
    }

    /// Rebuild a ref directly from a previously obtained key, optionally
    /// overriding or adding resolved arguments. Re-enters another call
    /// site's cached slot without recomputing its config.
    pub fn ref_from_key(&self, key: &Key, extra_args: Args) -> Result<Ref> {
        if key.name() != self.inner.name {
            return Err(Error::InvalidArguments(format!(
                "key belongs to '{}', not '{}'",
                key.name(),
                self.inner.name
            )));
        }
        if key.version() != self.inner.version {
            return Err(Error::InvalidArguments(format!(
                "key version {} does not match '{}' version {}",
                key.version(),
                self.inner.name,
                self.inner.version
            )));
        }
        let mut resolved: BTreeMap<String, ConfigValue> = key.config().clone();
        for (name, value) in extra_args.values {
            resolved.insert(name, value);
        }
        Ok(Ref {
            key: key.clone(),
            computation: self.clone(),
            args: resolved,
        })
    }

    // -----------------------------------------------------------------------
    // Store forwarders
    // -----------------------------------------------------------------------

    /// Compute-or-load: the announce/compute/wait protocol for this call.
    pub fn call(&self, store: &Store, args: Args) -> Result<serde_json::Value> {
        store.get(&self.bind(args)?)
    }

    /// Like `call`, addressing a specific replica slot.
    pub fn call_replica(
        &self,
        store: &Store,
        args: Args,
        replica: u32,
    ) -> Result<serde_json::Value> {
        store.get(&self.bind_with(args, None, replica)?)
    }

    /// Like `call`, returning the full entry.
    pub fn call_entry(&self, store: &Store, args: Args) -> Result<Entry> {
        store.get_entry(&self.bind(args)?)
    }

    /// Materialize replicas 0..n in replica order.
    pub fn replicas(&self, store: &Store, replicas: u32, args: Args) -> Result<Vec<serde_json::Value>> {
        self.replica_refs(0..replicas, args)?
            .iter()
            .map(|r| store.get(r))
            .collect()
    }

    /// Execute the body directly, bypassing the cache and the announce
    /// protocol. Nothing is persisted.
    pub fn dry_run(&self, store: &Store, args: Args) -> Result<serde_json::Value> {
        self.bind(args)?.execute(store)
    }

    pub fn load(&self, store: &Store, args: Args) -> Result<serde_json::Value> {
        store.load(&self.bind(args)?)
    }

    pub fn load_or_none(&self, store: &Store, args: Args) -> Result<Option<serde_json::Value>> {
        store.load_or_none(&self.bind(args)?)
    }

    pub fn load_entry(&self, store: &Store, args: Args) -> Result<Entry> {
        store.load_entry(&self.bind(args)?)
    }

    pub fn load_entry_or_none(&self, store: &Store, args: Args) -> Result<Option<Entry>> {
        store.load_entry_or_none(&self.bind(args)?)
    }

    /// Results of every finished replica for these arguments.
    pub fn load_replicas(&self, store: &Store, args: Args) -> Result<Vec<serde_json::Value>> {
        store.load_replicas(&self.bind(args)?)
    }

    pub fn remove(&self, store: &Store, args: Args) -> Result<()> {
        store.remove(&self.bind(args)?)
    }

    /// All persisted keys for this name and version.
    pub fn keys(&self, store: &Store) -> Result<Vec<Key>> {
        store.query_keys(self)
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Computation '{}' v={}>",
            self.inner.name, self.inner.version
        )
    }
}

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

/// A key bound to its runnable definition and fully resolved call
/// arguments. Created per call site; never persisted.
#[derive(Clone)]
pub struct Ref {
    key: Key,
    computation: Computation,
    args: BTreeMap<String, ConfigValue>,
}

impl Ref {
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Resolved arguments, ephemeral ones included.
    pub fn args(&self) -> &BTreeMap<String, ConfigValue> {
        &self.args
    }

    /// Run the body with this ref's resolved arguments.
    pub(crate) fn execute(&self, store: &Store) -> Result<serde_json::Value> {
        let ctx = CallContext { store, reff: self };
        (self.computation.inner.body)(&ctx)
    }
}

impl From<&Ref> for ConfigValue {
    fn from(r: &Ref) -> Self {
        ConfigValue::Key(r.key.clone())
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Ref {}>", self.key)
    }
}

// ---------------------------------------------------------------------------
// Call context
// ---------------------------------------------------------------------------

/// Execution context handed to a computation body: the store (so nested
/// computations thread it through explicitly) and the resolved arguments.
pub struct CallContext<'a> {
    store: &'a Store,
    reff: &'a Ref,
}

impl<'a> CallContext<'a> {
    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn key(&self) -> &Key {
        &self.reff.key
    }

    pub fn args(&self) -> &BTreeMap<String, ConfigValue> {
        &self.reff.args
    }

    pub fn arg(&self, name: &str) -> Result<&ConfigValue> {
        self.reff.args.get(name).ok_or_else(|| {
            Error::InvalidArguments(format!(
                "no argument '{name}' bound for computation '{}'",
                self.reff.computation.name()
            ))
        })
    }
}
