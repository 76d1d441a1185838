//! # Method Dispatch
//!
//! Inbound `Sync` and `Rpc` messages name their target method as a string.
//! An [`Invoker`] resolves that string for one class and calls the matching
//! typed function. Tables are built by hand with [`MethodTable`] and
//! registered per protocol side in an [`Invokers`] registry.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::core::variant::QVariant;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::syncable::{ProtocolSide, Syncable};

/// Resolves method names for one class.
pub trait Invoker: Send + Sync {
    fn class_name(&self) -> &str;

    fn invoke(&self, target: &mut dyn Syncable, method: &str, params: &[QVariant]) -> Result<()>;
}

pub type MethodFn<T> = fn(&mut T, &[QVariant]) -> Result<()>;

/// Method name to function table for objects of type `T`.
///
/// Parameters arrive as untyped values; each function decodes its own with
/// [`QVariant::expect_param`].
pub struct MethodTable<T> {
    class_name: Cow<'static, str>,
    methods: HashMap<Cow<'static, str>, MethodFn<T>>,
}

impl<T: Syncable> MethodTable<T> {
    pub fn new(class_name: &'static str) -> Self {
        Self {
            class_name: Cow::Borrowed(class_name),
            methods: HashMap::new(),
        }
    }

    pub fn method(mut self, name: &'static str, function: MethodFn<T>) -> Self {
        self.methods.insert(Cow::Borrowed(name), function);
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<T: Syncable> Invoker for MethodTable<T> {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn invoke(&self, target: &mut dyn Syncable, method: &str, params: &[QVariant]) -> Result<()> {
        let function = self
            .methods
            .get(method)
            .ok_or_else(|| ProtocolError::UnknownMethod {
                class_name: self.class_name.to_string(),
                method: method.to_owned(),
            })?;
        let receiver = target
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| ProtocolError::WrongObjectType(self.class_name.to_string()))?;
        function(receiver, params)
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.methods.keys().map(AsRef::as_ref).collect();
        methods.sort_unstable();
        f.debug_struct("MethodTable")
            .field("class_name", &self.class_name)
            .field("methods", &methods)
            .finish()
    }
}

type InvokerMap = HashMap<ProtocolSide, HashMap<String, Arc<dyn Invoker>>>;

/// Invokers keyed by (protocol side, class name).
#[derive(Clone)]
pub struct Invokers {
    invokers: Arc<RwLock<InvokerMap>>,
}

impl Default for Invokers {
    fn default() -> Self {
        Self::new()
    }
}

impl Invokers {
    pub fn new() -> Self {
        Self {
            invokers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `invoker` for its class on `side`, replacing any previous one.
    pub fn register<I>(&self, side: ProtocolSide, invoker: I) -> Result<()>
    where
        I: Invoker + 'static,
    {
        let mut invokers = self
            .invokers
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_INVOKER_LOCK.into()))?;
        invokers
            .entry(side)
            .or_default()
            .insert(invoker.class_name().to_owned(), Arc::new(invoker));
        Ok(())
    }

    pub fn get(&self, side: ProtocolSide, class_name: &str) -> Result<Arc<dyn Invoker>> {
        let invokers = self
            .invokers
            .read()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_INVOKER_LOCK.into()))?;
        invokers
            .get(&side)
            .and_then(|classes| classes.get(class_name))
            .cloned()
            .ok_or_else(|| ProtocolError::InvokerNotFound(class_name.to_owned()))
    }

    /// Resolve the invoker for `target`'s class and call `method` on it.
    pub fn dispatch(
        &self,
        side: ProtocolSide,
        target: &mut dyn Syncable,
        method: &str,
        params: &[QVariant],
    ) -> Result<()> {
        let class_name = target.state().class_name().to_owned();
        self.get(side, &class_name)?.invoke(target, method, params)
    }
}

impl fmt::Debug for Invokers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .invokers
            .read()
            .map(|m| m.values().map(HashMap::len).sum::<usize>())
            .unwrap_or_default();
        f.debug_struct("Invokers").field("registered", &count).finish()
    }
}
