//! # Synchronized Objects
//!
//! A syncable is a domain object mirrored between client and core. Each one
//! is identified by its class name and object name, populated once by an
//! `InitData` message and then kept current through `Sync` calls.
//!
//! Objects never own the session. They hold a `Weak<dyn SyncProxy>` that is
//! attached when the session starts tracking them, so a dropped session
//! silently turns outbound calls into no-ops.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::core::variant::{QVariant, QVariantList, QVariantMap};
use crate::error::Result;

/// Which end of the connection a component lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolSide {
    Client,
    Core,
}

impl ProtocolSide {
    pub fn opposite(self) -> Self {
        match self {
            ProtocolSide::Client => ProtocolSide::Core,
            ProtocolSide::Core => ProtocolSide::Client,
        }
    }
}

impl fmt::Display for ProtocolSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolSide::Client => f.write_str("client"),
            ProtocolSide::Core => f.write_str("core"),
        }
    }
}

/// Shared handle to a live object.
pub type SyncableHandle = Arc<Mutex<dyn Syncable>>;

/// The session surface objects talk to.
pub trait SyncProxy: Send + Sync {
    fn protocol_side(&self) -> ProtocolSide;

    /// Start tracking `handle`. Requests its initial state from the peer when
    /// it is new and not yet initialized.
    fn synchronize(&self, handle: SyncableHandle) -> Result<()>;

    fn stop_synchronize(&self, handle: &SyncableHandle) -> Result<()>;

    /// The peer renamed an object: rename it and re-key it. Waits for the
    /// object's lock, so an object must not call this on itself.
    fn rename(&self, class_name: &str, old_name: &str, new_name: &str) -> Result<()>;

    /// Re-key an object that already carries `new_name`.
    fn rekey(&self, class_name: &str, old_name: &str, new_name: &str) -> Result<()>;

    /// Send a `Sync`, unless `target` is the local side.
    fn sync(
        &self,
        target: ProtocolSide,
        class_name: &str,
        object_name: &str,
        slot_name: &str,
        params: QVariantList,
    ) -> Result<()>;

    /// Send an `Rpc`, unless `target` is the local side.
    fn rpc(&self, target: ProtocolSide, slot_name: &str, params: QVariantList) -> Result<()>;
}

/// Identity and bookkeeping every syncable carries.
pub struct SyncableState {
    class_name: String,
    object_name: String,
    initialized: bool,
    proxy: Option<Weak<dyn SyncProxy>>,
}

impl SyncableState {
    pub fn new(class_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            object_name: object_name.into(),
            initialized: false,
            proxy: None,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn set_object_name(&mut self, name: impl Into<String>) {
        self.object_name = name.into();
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    pub fn attach(&mut self, proxy: Weak<dyn SyncProxy>) {
        self.proxy = Some(proxy);
    }

    pub fn detach(&mut self) {
        self.proxy = None;
    }

    /// The session, while it is still alive.
    pub fn proxy(&self) -> Option<Arc<dyn SyncProxy>> {
        self.proxy.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for SyncableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncableState")
            .field("class_name", &self.class_name)
            .field("object_name", &self.object_name)
            .field("initialized", &self.initialized)
            .field("attached", &self.proxy().is_some())
            .finish()
    }
}

pub trait Syncable: Any + Send {
    fn state(&self) -> &SyncableState;

    fn state_mut(&mut self) -> &mut SyncableState;

    /// Apply a full or partial property map.
    fn from_variant_map(&mut self, properties: &QVariantMap) -> Result<()>;

    fn to_variant_map(&self) -> QVariantMap;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Apply `InitData` and mark the object live.
    fn init(&mut self, properties: &QVariantMap) -> Result<()> {
        self.from_variant_map(properties)?;
        self.state_mut().set_initialized(true);
        Ok(())
    }

    /// Call `slot_name` on the peer's copy of this object.
    ///
    /// Nothing is sent before the object is initialized.
    fn sync(&self, target: ProtocolSide, slot_name: &str, params: QVariantList) -> Result<()> {
        let state = self.state();
        if !state.initialized() {
            return Ok(());
        }
        match state.proxy() {
            Some(proxy) => proxy.sync(
                target,
                state.class_name(),
                state.object_name(),
                slot_name,
                params,
            ),
            None => Ok(()),
        }
    }

    fn rpc(&self, target: ProtocolSide, slot_name: &str, params: QVariantList) -> Result<()> {
        let state = self.state();
        if !state.initialized() {
            return Ok(());
        }
        match state.proxy() {
            Some(proxy) => proxy.rpc(target, slot_name, params),
            None => Ok(()),
        }
    }

    /// The `update` slot: apply `properties` locally.
    fn update(&mut self, properties: &QVariantMap) -> Result<()> {
        self.from_variant_map(properties)?;
        self.sync(
            ProtocolSide::Client,
            "update",
            vec![QVariant::QVariantMap(properties.clone())],
        )
    }

    /// Ask the core to apply `properties`, or the whole current state when
    /// `None`.
    fn request_update(&self, properties: Option<QVariantMap>) -> Result<()> {
        let properties = properties.unwrap_or_else(|| self.to_variant_map());
        self.sync(
            ProtocolSide::Core,
            "requestUpdate",
            vec![QVariant::QVariantMap(properties)],
        )
    }

    /// Change this object's name and tell the session about it.
    fn rename_object(&mut self, new_name: &str) -> Result<()> {
        let old_name = self.state().object_name().to_owned();
        if old_name == new_name {
            return Ok(());
        }
        self.state_mut().set_object_name(new_name);
        if !self.state().initialized() {
            return Ok(());
        }
        match self.state().proxy() {
            Some(proxy) => proxy.rekey(self.state().class_name(), &old_name, new_name),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Minimal syncable used across the protocol and service tests.
    #[derive(Debug)]
    pub(crate) struct Counter {
        pub state: SyncableState,
        pub value: i32,
    }

    impl Counter {
        pub fn new(object_name: &str) -> Self {
            Self {
                state: SyncableState::new("Counter", object_name),
                value: 0,
            }
        }
    }

    impl Syncable for Counter {
        fn state(&self) -> &SyncableState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut SyncableState {
            &mut self.state
        }

        fn from_variant_map(&mut self, properties: &QVariantMap) -> Result<()> {
            if let Some(value) = properties.get("value").and_then(|v| v.get::<i32>()) {
                self.value = value;
            }
            Ok(())
        }

        fn to_variant_map(&self) -> QVariantMap {
            let mut map = QVariantMap::new();
            map.insert("value".into(), QVariant::Int(self.value));
            map
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    type Sent = (ProtocolSide, String, String, String, QVariantList);

    #[derive(Default)]
    struct RecordingProxy {
        sent: StdMutex<Vec<Sent>>,
        renames: StdMutex<Vec<(String, String, String)>>,
    }

    impl SyncProxy for RecordingProxy {
        fn protocol_side(&self) -> ProtocolSide {
            ProtocolSide::Client
        }

        fn synchronize(&self, _handle: SyncableHandle) -> Result<()> {
            Ok(())
        }

        fn stop_synchronize(&self, _handle: &SyncableHandle) -> Result<()> {
            Ok(())
        }

        fn rename(&self, class_name: &str, old_name: &str, new_name: &str) -> Result<()> {
            self.rekey(class_name, old_name, new_name)
        }

        fn rekey(&self, class_name: &str, old_name: &str, new_name: &str) -> Result<()> {
            self.renames.lock().unwrap().push((
                class_name.into(),
                old_name.into(),
                new_name.into(),
            ));
            Ok(())
        }

        fn sync(
            &self,
            target: ProtocolSide,
            class_name: &str,
            object_name: &str,
            slot_name: &str,
            params: QVariantList,
        ) -> Result<()> {
            self.sent.lock().unwrap().push((
                target,
                class_name.into(),
                object_name.into(),
                slot_name.into(),
                params,
            ));
            Ok(())
        }

        fn rpc(&self, _target: ProtocolSide, _slot_name: &str, _params: QVariantList) -> Result<()> {
            Ok(())
        }
    }

    fn attached(counter: &mut Counter) -> Arc<RecordingProxy> {
        let proxy = Arc::new(RecordingProxy::default());
        let as_dyn: Arc<dyn SyncProxy> = proxy.clone();
        counter.state.attach(Arc::downgrade(&as_dyn));
        proxy
    }

    #[test]
    fn nothing_is_sent_before_init() {
        let mut counter = Counter::new("a");
        let proxy = attached(&mut counter);
        counter.request_update(None).unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());

        let mut props = QVariantMap::new();
        props.insert("value".into(), QVariant::Int(7));
        counter.init(&props).unwrap();
        assert_eq!(counter.value, 7);

        counter.request_update(None).unwrap();
        let sent = proxy.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ProtocolSide::Core);
        assert_eq!(sent[0].3, "requestUpdate");
        assert_eq!(sent[0].4, vec![QVariant::QVariantMap(counter.to_variant_map())]);
    }

    #[test]
    fn update_applies_then_targets_client() {
        let mut counter = Counter::new("a");
        let proxy = attached(&mut counter);
        counter.init(&QVariantMap::new()).unwrap();

        let mut props = QVariantMap::new();
        props.insert("value".into(), QVariant::Int(3));
        counter.update(&props).unwrap();
        assert_eq!(counter.value, 3);
        assert_eq!(proxy.sent.lock().unwrap()[0].0, ProtocolSide::Client);
    }

    #[test]
    fn dropped_proxy_is_a_no_op() {
        let mut counter = Counter::new("a");
        drop(attached(&mut counter));
        counter.init(&QVariantMap::new()).unwrap();
        assert!(counter.state().proxy().is_none());
        assert!(counter.sync(ProtocolSide::Core, "x", vec![]).is_ok());
    }

    #[test]
    fn rename_reports_only_live_objects() {
        let mut counter = Counter::new("old");
        let proxy = attached(&mut counter);
        counter.rename_object("draft").unwrap();
        assert!(proxy.renames.lock().unwrap().is_empty());

        counter.init(&QVariantMap::new()).unwrap();
        counter.rename_object("new").unwrap();
        assert_eq!(counter.state().object_name(), "new");
        assert_eq!(
            proxy.renames.lock().unwrap()[0],
            ("Counter".into(), "draft".into(), "new".into())
        );
    }

    #[test]
    fn sides_are_opposites() {
        assert_eq!(ProtocolSide::Client.opposite(), ProtocolSide::Core);
        assert_eq!(ProtocolSide::Core.opposite(), ProtocolSide::Client);
    }
}
