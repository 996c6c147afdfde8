//! Reactive state cells
//!
//! A [`DeviceState`] is the read side of a reactive cell producing a
//! sequence of [`StateValue`]s; a [`MutableDeviceState`] adds the write
//! side. Cells are `tokio::sync::watch` channels, which gives the
//! backpressure contract for free: the newest value always reaches late
//! subscribers and intermediate values may be dropped.
//!
//! Derived cells (`map`, `combine*`, `reduce`) recompute inside a task
//! spawned in the owning device scope. A failing combine function keeps
//! the last-known value, degrades quality to [`Quality::Error`] and logs.

use super::value::{combine_meta, Quality, StateValue};
use crate::error::DeviceError;
use crate::meta::{Meta, MetaConverter};
use crate::runtime::scope::DeviceScope;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Read side of a reactive cell.
#[derive(Clone)]
pub struct DeviceState<T: Clone> {
    rx: watch::Receiver<StateValue<T>>,
}

impl<T: Clone + Send + Sync + 'static> DeviceState<T> {
    /// Current reading.
    pub fn current(&self) -> StateValue<T> {
        self.rx.borrow().clone()
    }

    /// Receiver for subsequent readings; latest-wins.
    pub fn subscribe(&self) -> watch::Receiver<StateValue<T>> {
        self.rx.clone()
    }

    /// Wait for the next reading after the current one.
    pub async fn next_value(&mut self) -> Option<StateValue<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow().clone())
    }

    /// Derived cell applying `f` to every reading of `source`.
    pub fn map<U, F>(scope: &DeviceScope, source: &DeviceState<T>, f: F) -> DeviceState<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let initial = eval_map(&source.current(), &f, &StateValue::empty());
        let (tx, rx) = watch::channel(initial);
        let mut src = source.subscribe();
        scope.spawn(async move {
            while src.changed().await.is_ok() {
                let input = src.borrow().clone();
                let last = tx.borrow().clone();
                let next = eval_map(&input, &f, &last);
                if tx.send(next).is_err() {
                    break;
                }
            }
        });
        DeviceState { rx }
    }
}

fn eval_map<T, U, F>(input: &StateValue<T>, f: &F, last: &StateValue<U>) -> StateValue<U>
where
    T: Clone,
    U: Clone,
    F: Fn(&T) -> U,
{
    match &input.value {
        None => StateValue::new(None, input.timestamp, input.quality),
        Some(value) => match catch_unwind(AssertUnwindSafe(|| f(value))) {
            Ok(mapped) => StateValue::new(Some(mapped), input.timestamp, input.quality),
            Err(_) => {
                tracing::warn!("derived state function failed; keeping last value");
                StateValue::new(last.value.clone(), input.timestamp, Quality::Error)
            }
        },
    }
}

/// Write side of a reactive cell.
#[derive(Clone)]
pub struct MutableDeviceState<T: Clone> {
    state: DeviceState<T>,
    tx: Arc<watch::Sender<StateValue<T>>>,
    on_write: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T: Clone + Send + Sync + 'static> MutableDeviceState<T> {
    /// Fresh cell holding an initial reading.
    pub fn new(initial: Option<T>) -> Self {
        let (tx, rx) = watch::channel(StateValue::new(initial, chrono::Utc::now(), Quality::Ok));
        Self {
            state: DeviceState { rx },
            tx: Arc::new(tx),
            on_write: None,
        }
    }

    /// Read side of this cell.
    pub fn state(&self) -> DeviceState<T> {
        self.state.clone()
    }

    /// Current reading.
    pub fn current(&self) -> StateValue<T> {
        self.state.current()
    }

    /// Publish a fresh `Ok` reading stamped now.
    pub fn update(&self, value: T) {
        self.update_with(StateValue::now(value));
    }

    /// Publish a reading as-is.
    pub fn update_with(&self, reading: StateValue<T>) {
        let _ = self.tx.send(reading);
        if let Some(hook) = &self.on_write {
            hook();
        }
    }

    /// Degrade the current reading's quality in place.
    pub fn degrade(&self, quality: Quality) {
        let mut reading = self.current();
        reading.quality = reading.quality.worst(quality);
        let _ = self.tx.send(reading);
    }

    fn with_write_hook(mut self, hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.on_write = Some(hook);
        self
    }
}

macro_rules! combine_impl {
    ($fn_name:ident, $($src:ident : $ty:ident),+) => {
        /// Derived cell combining several inputs. Output value is
        /// `f(inputs)` when every input has a value; output timestamp is
        /// the newest input timestamp; output quality is the worst input
        /// quality.
        pub fn $fn_name<$($ty,)+ O, F>(
            scope: &DeviceScope,
            $($src: &DeviceState<$ty>,)+
            f: F,
        ) -> DeviceState<O>
        where
            $($ty: Clone + Send + Sync + 'static,)+
            O: Clone + Send + Sync + 'static,
            F: Fn($(&$ty),+) -> O + Send + Sync + 'static,
        {
            $(let mut $src = $src.subscribe();)+
            let compute = move |last: &StateValue<O>, $($src: &watch::Receiver<StateValue<$ty>>),+| {
                $(let $src = $src.borrow().clone();)+
                let (timestamp, quality) = {
                    let timestamps = [$($src.timestamp),+];
                    let qualities = [$($src.quality),+];
                    (
                        timestamps.into_iter().max().unwrap_or_else(chrono::Utc::now),
                        qualities.into_iter().max().unwrap_or(Quality::Ok),
                    )
                };
                match ($(&$src.value,)+) {
                    ($(Some($src),)+) => {
                        match catch_unwind(AssertUnwindSafe(|| f($($src),+))) {
                            Ok(out) => StateValue::new(Some(out), timestamp, quality),
                            Err(_) => {
                                tracing::warn!("combine function failed; keeping last value");
                                StateValue::new(last.value.clone(), timestamp, Quality::Error)
                            }
                        }
                    }
                    _ => StateValue::new(None, timestamp, quality),
                }
            };
            let initial = compute(&StateValue::empty(), $(&$src),+);
            let (tx, rx) = watch::channel(initial);
            scope.spawn(async move {
                loop {
                    tokio::select! {
                        $(changed = $src.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        })+
                    }
                    let last = tx.borrow().clone();
                    let next = compute(&last, $(&$src),+);
                    if tx.send(next).is_err() {
                        break;
                    }
                }
            });
            DeviceState { rx }
        }
    };
}

combine_impl!(combine2, s1: T1, s2: T2);
combine_impl!(combine3, s1: T1, s2: T2, s3: T3);
combine_impl!(combine4, s1: T1, s2: T2, s3: T3, s4: T4);
combine_impl!(combine5, s1: T1, s2: T2, s3: T3, s4: T4, s5: T5);

/// Derived cell folding a homogeneous list of inputs.
pub fn reduce<T, O, F>(scope: &DeviceScope, sources: Vec<DeviceState<T>>, f: F) -> DeviceState<O>
where
    T: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    F: Fn(&[T]) -> O + Send + Sync + 'static,
{
    let mut receivers: Vec<watch::Receiver<StateValue<T>>> =
        sources.iter().map(DeviceState::subscribe).collect();
    let compute = move |last: &StateValue<O>, receivers: &[watch::Receiver<StateValue<T>>]| {
        let readings: Vec<StateValue<T>> = receivers.iter().map(|rx| rx.borrow().clone()).collect();
        let refs: Vec<&StateValue<T>> = readings.iter().collect();
        let (timestamp, quality) = combine_meta(&refs);
        let values: Option<Vec<T>> = readings.iter().map(|sv| sv.value.clone()).collect();
        match values {
            Some(values) => match catch_unwind(AssertUnwindSafe(|| f(&values))) {
                Ok(out) => StateValue::new(Some(out), timestamp, quality),
                Err(_) => {
                    tracing::warn!("reduce function failed; keeping last value");
                    StateValue::new(last.value.clone(), timestamp, Quality::Error)
                }
            },
            None => StateValue::new(None, timestamp, quality),
        }
    };
    let initial = compute(&StateValue::empty(), &receivers);
    let (tx, rx) = watch::channel(initial);
    if receivers.is_empty() {
        return DeviceState { rx };
    }
    scope.spawn(async move {
        loop {
            let changes: Vec<_> = receivers.iter_mut().map(|r| Box::pin(r.changed())).collect();
            let (result, _, rest) = futures::future::select_all(changes).await;
            drop(rest);
            if result.is_err() {
                break;
            }
            let last = tx.borrow().clone();
            let next = compute(&last, &receivers);
            if tx.send(next).is_err() {
                break;
            }
        }
    });
    DeviceState { rx }
}

/// Error raised on a second bind of a late-bound cell.
#[derive(Debug, thiserror::Error)]
#[error("late-bound state already bound")]
pub struct AlreadyBound;

/// A mutable cell whose source can be bound exactly once after creation,
/// enabling cyclic wiring: build all nodes with placeholders, then patch
/// sources in a resolution pass.
pub struct LateBoundState<T: Clone> {
    cell: MutableDeviceState<T>,
    bound: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> LateBoundState<T> {
    /// Unbound cell holding an initial value.
    pub fn new(initial: Option<T>) -> Self {
        Self {
            cell: MutableDeviceState::new(initial),
            bound: AtomicBool::new(false),
        }
    }

    /// Read/write cell to hand out before binding.
    pub fn cell(&self) -> MutableDeviceState<T> {
        self.cell.clone()
    }

    /// Bind the source. Readings of `source` flow into the cell from now
    /// on. A second bind is an error.
    pub fn bind(&self, scope: &DeviceScope, source: &DeviceState<T>) -> Result<(), DeviceError> {
        if self.bound.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::Internal("late-bound state already bound".into()));
        }
        let mut src = source.subscribe();
        let cell = self.cell.clone();
        cell.update_with(source.current());
        scope.spawn(async move {
            while src.changed().await.is_ok() {
                let reading = src.borrow().clone();
                cell.update_with(reading);
            }
        });
        Ok(())
    }
}

/// Registry of stateful cells a device exposes for persistence.
#[derive(Default)]
pub struct PersistenceElements {
    elements: std::sync::Mutex<Vec<StatefulElement>>,
    dirty: Arc<AtomicU64>,
}

/// One persistent property: a name plus type-erased read/write access.
pub struct StatefulElement {
    /// Property name used as the snapshot key.
    pub name: crate::meta::Name,
    read: Arc<dyn Fn() -> Meta + Send + Sync>,
    write: Arc<dyn Fn(&Meta) -> Result<(), DeviceError> + Send + Sync>,
}

impl StatefulElement {
    /// Current serialized value.
    pub fn read(&self) -> Meta {
        (self.read)()
    }

    /// Restore a serialized value.
    pub fn write(&self, meta: &Meta) -> Result<(), DeviceError> {
        (self.write)(meta)
    }
}

impl PersistenceElements {
    /// Fresh, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current dirty counter.
    pub fn dirty_version(&self) -> u64 {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Reset the dirty counter to a restored snapshot version.
    pub fn reset_dirty(&self, version: u64) {
        self.dirty.store(version, Ordering::SeqCst);
    }

    /// Visit every registered element.
    pub fn for_each(&self, mut f: impl FnMut(&StatefulElement)) {
        let elements = self.elements.lock().expect("persistence lock poisoned");
        for element in elements.iter() {
            f(element);
        }
    }

    /// Look up an element by snapshot key.
    pub fn find(&self, name: &crate::meta::Name) -> bool {
        let elements = self.elements.lock().expect("persistence lock poisoned");
        elements.iter().any(|e| &e.name == name)
    }

    /// Register a type-erased element directly. Used for node-backed
    /// persistent properties that have no typed delegate.
    pub fn register_raw(
        &self,
        name: crate::meta::Name,
        read: Arc<dyn Fn() -> Meta + Send + Sync>,
        write: Arc<dyn Fn(&Meta) -> Result<(), DeviceError> + Send + Sync>,
    ) {
        self.elements
            .lock()
            .expect("persistence lock poisoned")
            .push(StatefulElement { name, read, write });
    }

    /// Restore one element by snapshot key.
    pub fn restore_one(&self, name: &crate::meta::Name, meta: &Meta) -> Option<Result<(), DeviceError>> {
        let elements = self.elements.lock().expect("persistence lock poisoned");
        elements.iter().find(|e| &e.name == name).map(|e| e.write(meta))
    }
}

/// Mutable cell registered for persistence: every write marks the device
/// dirty, and the cell snapshots/restores through its converter.
pub fn stateful<T>(
    elements: &PersistenceElements,
    name: crate::meta::Name,
    initial: Option<T>,
    converter: Arc<dyn MetaConverter<T>>,
) -> MutableDeviceState<T>
where
    T: Clone + Send + Sync + 'static,
{
    let dirty = elements.dirty.clone();
    let cell = MutableDeviceState::new(initial).with_write_hook(Arc::new(move || {
        dirty.fetch_add(1, Ordering::SeqCst);
    }));

    let read_cell = cell.clone();
    let read_converter = converter.clone();
    let write_cell = cell.clone();
    let element = StatefulElement {
        name,
        read: Arc::new(move || match read_cell.current().value {
            Some(value) => read_converter.to_meta(&value),
            None => Meta::new(),
        }),
        write: Arc::new(move |meta| {
            let value = converter.from_meta(meta)?;
            // restoring is not a user write; bypass the dirty hook
            let _ = write_cell.tx.send(StateValue::now(value));
            Ok(())
        }),
    };
    elements
        .elements
        .lock()
        .expect("persistence lock poisoned")
        .push(element);
    cell
}

/// In-memory cell that never persists.
pub fn virtual_state<T: Clone + Send + Sync + 'static>(initial: Option<T>) -> MutableDeviceState<T> {
    MutableDeviceState::new(initial)
}
