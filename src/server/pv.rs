//! PVs published by a server, and the monitor cursors that follow them.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU16, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    pvdata::{
        ChangeBitSet, FieldLayout, PvStructure, Structure, StructureDesc, TypeDescriptor,
        TypeMismatch, Value, bitset,
    },
    request::Projection,
};

use super::circuit::ServerCircuitEvent;

/// Updates an unpipelined monitor may have waiting in its circuit's queue
const MAX_QUEUED_UPDATES: u32 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PvError {
    #[error("A PV named '{0}' already exists")]
    NameInUse(String),
    #[error("Update does not match the PV type: {0}")]
    IncompatibleType(#[from] TypeMismatch),
    #[error("PV '{0}' has been closed")]
    Closed(String),
}

/// Called when a client writes to a PV.
///
/// `changed` names the fields the client wrote, and `written` is the current
/// value with those fields replaced. Nothing is stored unless the handler
/// calls [`ServerPV::update`]. An error is reported back to the writer.
pub trait WriteHandler: Send + Sync + 'static {
    fn write(&self, pv: &ServerPV, changed: &[String], written: &PvStructure) -> Result<(), String>;
}

impl<F> WriteHandler for F
where
    F: Fn(&ServerPV, &[String], &PvStructure) -> Result<(), String> + Send + Sync + 'static,
{
    fn write(&self, pv: &ServerPV, changed: &[String], written: &PvStructure) -> Result<(), String> {
        self(pv, changed, written)
    }
}

/// Answers remote procedure calls made on a PV
pub trait RpcHandler: Send + Sync + 'static {
    fn call(&self, request: PvStructure) -> Result<PvStructure, String>;
}

impl<F> RpcHandler for F
where
    F: Fn(PvStructure) -> Result<PvStructure, String> + Send + Sync + 'static,
{
    fn call(&self, request: PvStructure) -> Result<PvStructure, String> {
        self(request)
    }
}

/// The PVs a server offers, by name
#[derive(Debug, Default)]
pub(crate) struct PvRegistry {
    pvs: Mutex<HashMap<String, ServerPV>>,
    /// Bumped whenever a PV is added or removed
    change_count: AtomicU16,
}

impl PvRegistry {
    pub(crate) fn get(&self, name: &str) -> Option<ServerPV> {
        self.pvs.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.pvs.lock().unwrap().contains_key(name)
    }

    pub(crate) fn change_count(&self) -> u16 {
        self.change_count.load(Ordering::Relaxed)
    }

    pub(crate) fn insert(
        self: &Arc<Self>,
        name: &str,
        value: PvStructure,
        writer: Option<Arc<dyn WriteHandler>>,
        rpc: Option<Arc<dyn RpcHandler>>,
    ) -> Result<ServerPV, PvError> {
        let mut pvs = self.pvs.lock().unwrap();
        if pvs.contains_key(name) {
            return Err(PvError::NameInUse(name.to_owned()));
        }
        let (desc, value) = value.into_parts();
        let TypeDescriptor::Structure(desc) = desc else {
            return Err(PvError::IncompatibleType(TypeMismatch {
                path: String::new(),
                expected: "structure".to_owned(),
            }));
        };
        let pv = ServerPV {
            inner: Arc::new(PvInner {
                name: name.to_owned(),
                layout: FieldLayout::of(&desc),
                desc,
                writer,
                rpc,
                registry: Arc::downgrade(self),
                state: Mutex::new(PvState {
                    value,
                    closed: false,
                    cursors: HashMap::new(),
                    attached: HashMap::new(),
                }),
            }),
        };
        debug!("Created PV '{name}'");
        pvs.insert(name.to_owned(), pv.clone());
        self.change_count.fetch_add(1, Ordering::Relaxed);
        Ok(pv)
    }

    fn remove(&self, name: &str) {
        if self.pvs.lock().unwrap().remove(name).is_some() {
            self.change_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Where one monitor is in the stream of changes to its PV
#[derive(Debug)]
struct MonitorCursor {
    ioid: u32,
    projection: Projection,
    /// Updates the client will accept before acknowledging. None is unlimited.
    window: Option<u32>,
    started: bool,
    /// Updates handed to the circuit and not yet taken for writing
    queued: u32,
    /// Leaves changed since the last update sent
    pending: ChangeBitSet,
    /// Leaves changed more than once since the last update sent
    overrun: ChangeBitSet,
    sink: mpsc::UnboundedSender<ServerCircuitEvent>,
}

impl MonitorCursor {
    fn record(&mut self, changes: &ChangeBitSet) {
        let repeated = self.pending.intersection(changes);
        self.overrun.union_with(&repeated);
        self.pending.union_with(changes);
    }

    /// Send the pending changes, if the window allows
    fn flush(&mut self, value: &Structure) {
        if !self.started || self.pending.is_empty() || self.window == Some(0) {
            return;
        }
        if self.window.is_none() && self.queued >= MAX_QUEUED_UPDATES {
            return;
        }
        let changed = self.projection.map_changes(&self.pending);
        let overrun = self.projection.map_changes(&self.overrun);
        self.pending.clear_all();
        self.overrun.clear_all();
        if changed.is_empty() {
            return;
        }
        if let Some(window) = self.window.as_mut() {
            *window -= 1;
        }
        trace!("Sending monitor update {}: {changed}", self.ioid);
        self.queued += 1;
        let _ = self.sink.send(ServerCircuitEvent::MonitorData {
            ioid: self.ioid,
            value: self.projection.project(value),
            changed,
            overrun,
        });
    }

    fn send_initial(&mut self, value: &Structure) {
        self.pending.clear_all();
        self.overrun.clear_all();
        self.queued += 1;
        let _ = self.sink.send(ServerCircuitEvent::MonitorData {
            ioid: self.ioid,
            value: self.projection.project(value),
            changed: ChangeBitSet::whole(),
            overrun: ChangeBitSet::new(),
        });
    }
}

#[derive(Debug)]
struct PvState {
    value: Structure,
    closed: bool,
    /// Monitors, keyed by circuit and request ID
    cursors: HashMap<(u64, u32), MonitorCursor>,
    /// Circuits with a channel open on this PV
    attached: HashMap<u64, mpsc::UnboundedSender<ServerCircuitEvent>>,
}

struct PvInner {
    name: String,
    desc: StructureDesc,
    layout: FieldLayout,
    writer: Option<Arc<dyn WriteHandler>>,
    rpc: Option<Arc<dyn RpcHandler>>,
    registry: Weak<PvRegistry>,
    state: Mutex<PvState>,
}

/// A PV published by a [`Server`](super::Server)
#[derive(Clone)]
pub struct ServerPV {
    inner: Arc<PvInner>,
}

impl fmt::Debug for ServerPV {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPV")
            .field("name", &self.inner.name)
            .field("type", &self.inner.desc.short_name())
            .finish()
    }
}

impl ServerPV {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn desc(&self) -> &StructureDesc {
        &self.inner.desc
    }

    pub fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::Structure(self.inner.desc.clone())
    }

    /// The current value
    pub fn value(&self) -> PvStructure {
        let state = self.inner.state.lock().unwrap();
        PvStructure::new_unchecked(self.type_descriptor(), state.value.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writer.is_some()
    }

    pub fn is_rpc(&self) -> bool {
        self.inner.rpc.is_some()
    }

    pub(crate) fn writer(&self) -> Option<Arc<dyn WriteHandler>> {
        self.inner.writer.clone()
    }

    pub(crate) fn rpc(&self) -> Option<Arc<dyn RpcHandler>> {
        self.inner.rpc.clone()
    }

    /// Publish a new value.
    ///
    /// The value must have exactly the type the PV was created with;
    /// otherwise nothing changes and the previous value is still served.
    pub fn update(&self, value: Structure) -> Result<(), PvError> {
        TypeDescriptor::Structure(self.inner.desc.clone()).check(&Value::Structure(value.clone()))?;
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(PvError::Closed(self.inner.name.clone()));
        }
        let changes = bitset::diff(&state.value, &value);
        state.value = value;
        if changes.is_empty() {
            return Ok(());
        }
        trace!(
            "PV '{}' changed: {:?}",
            self.inner.name,
            self.inner.layout.changed_paths(&changes)
        );
        let PvState { value, cursors, .. } = &mut *state;
        for cursor in cursors.values_mut() {
            cursor.record(&changes);
            cursor.flush(value);
        }
        Ok(())
    }

    /// Stop serving this PV. Clients see their subscriptions end and their
    /// channels destroyed.
    pub fn close(&self) {
        let attached = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.cursors.clear();
            std::mem::take(&mut state.attached)
        };
        debug!("Closing PV '{}'", self.inner.name);
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(&self.inner.name);
        }
        for sink in attached.values() {
            let _ = sink.send(ServerCircuitEvent::PvClosed(self.clone()));
        }
    }

    pub(crate) fn same_pv(&self, other: &ServerPV) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn attach(
        &self,
        circuit: u64,
        sink: mpsc::UnboundedSender<ServerCircuitEvent>,
    ) -> Result<(), PvError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(PvError::Closed(self.inner.name.clone()));
        }
        state.attached.insert(circuit, sink);
        Ok(())
    }

    pub(crate) fn detach(&self, circuit: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.attached.remove(&circuit);
        state.cursors.retain(|(c, _), _| *c != circuit);
    }

    pub(crate) fn add_monitor(
        &self,
        circuit: u64,
        ioid: u32,
        projection: Projection,
        window: Option<u32>,
        sink: mpsc::UnboundedSender<ServerCircuitEvent>,
    ) -> Result<(), PvError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(PvError::Closed(self.inner.name.clone()));
        }
        state.cursors.insert(
            (circuit, ioid),
            MonitorCursor {
                ioid,
                projection,
                window,
                started: false,
                queued: 0,
                pending: ChangeBitSet::new(),
                overrun: ChangeBitSet::new(),
                sink,
            },
        );
        Ok(())
    }

    /// Start (or restart) sending updates, beginning with the current value
    pub(crate) fn start_monitor(&self, circuit: u64, ioid: u32) {
        let mut state = self.inner.state.lock().unwrap();
        let PvState { value, cursors, .. } = &mut *state;
        if let Some(cursor) = cursors.get_mut(&(circuit, ioid)) {
            if !cursor.started {
                cursor.started = true;
                cursor.send_initial(value);
            }
        }
    }

    pub(crate) fn stop_monitor(&self, circuit: u64, ioid: u32) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(cursor) = state.cursors.get_mut(&(circuit, ioid)) {
            cursor.started = false;
        }
    }

    /// The client consumed `count` updates, so more may be sent
    pub(crate) fn ack_monitor(&self, circuit: u64, ioid: u32, count: u32) {
        let mut state = self.inner.state.lock().unwrap();
        let PvState { value, cursors, .. } = &mut *state;
        if let Some(cursor) = cursors.get_mut(&(circuit, ioid)) {
            if let Some(window) = cursor.window.as_mut() {
                *window = window.saturating_add(count);
            }
            cursor.flush(value);
        }
    }

    /// The circuit took an update off its queue, so another may follow
    pub(crate) fn monitor_dequeued(&self, circuit: u64, ioid: u32) {
        let mut state = self.inner.state.lock().unwrap();
        let PvState { value, cursors, .. } = &mut *state;
        if let Some(cursor) = cursors.get_mut(&(circuit, ioid)) {
            cursor.queued = cursor.queued.saturating_sub(1);
            cursor.flush(value);
        }
    }

    pub(crate) fn remove_monitor(&self, circuit: u64, ioid: u32) {
        self.inner
            .state
            .lock()
            .unwrap()
            .cursors
            .remove(&(circuit, ioid));
    }

    /// Leaf paths of a change set, in this PV's numbering
    pub(crate) fn changed_paths(&self, changes: &ChangeBitSet) -> Vec<String> {
        self.inner
            .layout
            .changed_paths(changes)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pvdata::ScalarType, request::FieldRequest};

    fn demo() -> Structure {
        Structure::new().with("value", 3.13).with("tag", "Hello!")
    }

    fn registry_with_demo() -> (Arc<PvRegistry>, ServerPV) {
        let registry = Arc::new(PvRegistry::default());
        let pv = registry
            .insert("demo", PvStructure::from_value(demo()).unwrap(), None, None)
            .unwrap();
        (registry, pv)
    }

    fn next_update(
        rx: &mut mpsc::UnboundedReceiver<ServerCircuitEvent>,
    ) -> Option<(Structure, ChangeBitSet, ChangeBitSet)> {
        match rx.try_recv().ok()? {
            ServerCircuitEvent::MonitorData {
                value,
                changed,
                overrun,
                ..
            } => Some((value, changed, overrun)),
            _ => None,
        }
    }

    #[test]
    fn test_debug_names_type() {
        let (_registry, pv) = registry_with_demo();
        let text = format!("{pv:?}");
        assert!(text.contains("\"demo\""), "{text}");
        assert!(text.contains("\"structure\""), "{text}");
        assert_eq!(
            StructureDesc::new("epics:nt/NTScalar:1.0").short_name(),
            "epics:nt/NTScalar:1.0"
        );
    }

    #[test]
    fn test_names_are_unique() {
        let (registry, pv) = registry_with_demo();
        assert_eq!(registry.change_count(), 1);
        assert!(matches!(
            registry.insert("demo", PvStructure::from_value(demo()).unwrap(), None, None),
            Err(PvError::NameInUse(_))
        ));
        pv.close();
        assert!(!registry.contains("demo"));
        assert_eq!(registry.change_count(), 2);
        assert!(matches!(pv.update(demo()), Err(PvError::Closed(_))));
    }

    #[test]
    fn test_incompatible_update_keeps_value() {
        let (_registry, pv) = registry_with_demo();
        let wrong = Structure::new().with("value", 4i32).with("tag", "Hello!");
        assert!(matches!(
            pv.update(wrong),
            Err(PvError::IncompatibleType(_))
        ));
        assert_eq!(pv.value().get("value"), Some(&Value::Double(3.13)));
    }

    #[test]
    fn test_projected_monitor_skips_unrelated_changes() {
        let (_registry, pv) = registry_with_demo();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let projection =
            Projection::new(pv.desc(), &FieldRequest::parse("field(value)").unwrap()).unwrap();
        pv.add_monitor(1, 5, projection, None, tx).unwrap();
        pv.start_monitor(1, 5);
        let (initial, changed, _) = next_update(&mut rx).unwrap();
        assert_eq!(initial, Structure::new().with("value", 3.13));
        assert!(changed.get(0));

        pv.update(Structure::new().with("value", 3.13).with("tag", "Bye"))
            .unwrap();
        assert!(next_update(&mut rx).is_none());

        pv.update(Structure::new().with("value", 4.13).with("tag", "Bye"))
            .unwrap();
        let (value, changed, overrun) = next_update(&mut rx).unwrap();
        assert_eq!(value.get("value"), Some(&Value::Double(4.13)));
        assert_eq!(changed.iter().collect::<Vec<_>>(), vec![1]);
        assert!(overrun.is_empty());
    }

    #[test]
    fn test_window_coalesces_with_overrun() {
        let (_registry, pv) = registry_with_demo();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let projection = Projection::new(pv.desc(), &FieldRequest::all()).unwrap();
        pv.add_monitor(1, 5, projection, Some(2), tx).unwrap();
        pv.start_monitor(1, 5);
        next_update(&mut rx).unwrap();
        for n in 0..7 {
            pv.update(Structure::new().with("value", n as f64).with("tag", "Hello!"))
                .unwrap();
        }
        // Two fit in the window
        for expected in [0.0, 1.0] {
            let (value, _, overrun) = next_update(&mut rx).unwrap();
            assert_eq!(value.get("value"), Some(&Value::Double(expected)));
            assert!(overrun.is_empty());
        }
        assert!(next_update(&mut rx).is_none());
        pv.ack_monitor(1, 5, 1);
        let (value, changed, overrun) = next_update(&mut rx).unwrap();
        assert_eq!(value.get("value"), Some(&Value::Double(6.0)));
        assert_eq!(changed.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(overrun.iter().collect::<Vec<_>>(), vec![1]);
        assert!(next_update(&mut rx).is_none());
    }

    #[test]
    fn test_unpipelined_monitor_queue_is_bounded() {
        let (_registry, pv) = registry_with_demo();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let projection = Projection::new(pv.desc(), &FieldRequest::all()).unwrap();
        pv.add_monitor(1, 5, projection, None, tx).unwrap();
        pv.start_monitor(1, 5);
        for n in 0..20 {
            pv.update(Structure::new().with("value", n as f64).with("tag", "Hello!"))
                .unwrap();
        }
        // The initial value and three updates wait for a writer that never came
        let mut values = Vec::new();
        while let Some((value, _, overrun)) = next_update(&mut rx) {
            assert!(overrun.is_empty());
            values.push(value.get("value").and_then(Value::as_f64));
        }
        assert_eq!(values, vec![Some(3.13), Some(0.0), Some(1.0), Some(2.0)]);

        pv.monitor_dequeued(1, 5);
        let (value, changed, overrun) = next_update(&mut rx).unwrap();
        assert_eq!(value.get("value"), Some(&Value::Double(19.0)));
        assert_eq!(changed.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(overrun.iter().collect::<Vec<_>>(), vec![1]);
        assert!(next_update(&mut rx).is_none());
    }

    #[test]
    fn test_subscribers_have_independent_cursors() {
        let registry = Arc::new(PvRegistry::default());
        let desc = StructureDesc::new("")
            .field("a", TypeDescriptor::Scalar(ScalarType::Int))
            .field("b", TypeDescriptor::Scalar(ScalarType::Int));
        let pv = registry
            .insert(
                "pair",
                PvStructure::new(desc, Structure::new().with("a", 0i32).with("b", 0i32)).unwrap(),
                None,
                None,
            )
            .unwrap();
        let (slow_tx, mut slow) = mpsc::unbounded_channel();
        let (fast_tx, mut fast) = mpsc::unbounded_channel();
        let all = || Projection::new(pv.desc(), &FieldRequest::all()).unwrap();
        pv.add_monitor(1, 1, all(), Some(0), slow_tx).unwrap();
        pv.add_monitor(2, 1, all(), None, fast_tx).unwrap();
        pv.start_monitor(1, 1);
        pv.start_monitor(2, 1);
        next_update(&mut slow).unwrap();
        next_update(&mut fast).unwrap();

        pv.update(Structure::new().with("a", 1i32).with("b", 0i32)).unwrap();
        pv.update(Structure::new().with("a", 1i32).with("b", 2i32)).unwrap();
        assert_eq!(next_update(&mut fast).unwrap().1.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(next_update(&mut fast).unwrap().1.iter().collect::<Vec<_>>(), vec![2]);
        assert!(next_update(&mut slow).is_none());

        pv.ack_monitor(1, 1, 1);
        let (_, changed, overrun) = next_update(&mut slow).unwrap();
        assert_eq!(changed.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(overrun.is_empty());
    }
}
