//! Simulated signal transport
//!
//! [`SimProvider`] makes signals whose values live in memory, backed by a
//! `tokio::sync::watch` channel per signal so any number of observers see
//! updates without polling. Simulation logic (see [`crate::sim`]) attaches
//! behaviour by hooking puts with [`SimProvider::on_set`] and executions with
//! [`SimProvider::on_call`], and drives readbacks with
//! [`SimProvider::set_value`].
//!
//! Every signal the provider makes is remembered by source, so the sim logic
//! can find the backing store for a signal a device holds as a trait object:
//!
//! ```rust,ignore
//! let p = SimProvider::new();
//! let motor = MotorRecord::new(&p, "BLxxI-MO-TABLE-01:X");
//! p.set_value(&*motor.velocity, 1.0)?;
//! p.on_set(&*motor.demand, |position: f64| async move { Ok(()) })?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{
    signal_source, ExecSignal, ReadSignal, ReadWriteSignal, Signal, SignalProvider, SignalR,
    SignalValue, SignalW, SignalX, TypedSignal, WriteSignal,
};
use crate::error::{FlyError, FlyResult};
use crate::status::lock;

type SetHook<T> = Arc<dyn Fn(T) -> BoxFuture<'static, FlyResult<()>> + Send + Sync>;
type CallHook = Arc<dyn Fn() -> BoxFuture<'static, FlyResult<()>> + Send + Sync>;

/// In-memory value signal. Readable, writable and observable.
pub struct SimSignal<T: SignalValue> {
    source: String,
    value: watch::Sender<T>,
    on_set: RwLock<Option<SetHook<T>>>,
}

impl<T: SignalValue> std::fmt::Debug for SimSignal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSignal")
            .field("source", &self.source)
            .field("value", &*self.value.borrow())
            .finish()
    }
}

impl<T: SignalValue> SimSignal<T> {
    fn new(source: String) -> Self {
        let (value, _) = watch::channel(T::default());
        Self {
            source,
            value,
            on_set: RwLock::new(None),
        }
    }

    /// Current simulated value.
    pub fn sim_value(&self) -> T {
        self.value.borrow().clone()
    }

    /// Replace the value and notify observers, even if it is unchanged.
    pub fn set_sim_value(&self, value: T) {
        self.value.send_replace(value);
    }

    fn set_hook(&self, hook: SetHook<T>) {
        *self.on_set.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    fn hook(&self) -> Option<SetHook<T>> {
        self.on_set.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl<T: SignalValue> Signal for SimSignal<T> {
    fn source(&self) -> &str {
        &self.source
    }

    async fn connected(&self) -> bool {
        true
    }
}

impl<T: SignalValue> TypedSignal for SimSignal<T> {
    type Value = T;
}

#[async_trait]
impl<T: SignalValue> SignalR<T> for SimSignal<T> {
    async fn get(&self) -> FlyResult<T> {
        Ok(self.sim_value())
    }

    fn observe(&self) -> BoxStream<'static, T> {
        WatchStream::new(self.value.subscribe()).boxed()
    }
}

#[async_trait]
impl<T: SignalValue> SignalW<T> for SimSignal<T> {
    async fn put(&self, value: T) -> FlyResult<()> {
        if let Some(hook) = self.hook() {
            hook(value.clone()).await?;
        }
        self.set_sim_value(value);
        Ok(())
    }
}

/// In-memory executable signal.
pub struct SimSignalX {
    source: String,
    on_call: RwLock<Option<CallHook>>,
}

impl SimSignalX {
    fn new(source: String) -> Self {
        Self {
            source,
            on_call: RwLock::new(None),
        }
    }

    fn set_hook(&self, hook: CallHook) {
        *self.on_call.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }
}

#[async_trait]
impl Signal for SimSignalX {
    fn source(&self) -> &str {
        &self.source
    }

    async fn connected(&self) -> bool {
        true
    }
}

#[async_trait]
impl SignalX for SimSignalX {
    async fn execute(&self) -> FlyResult<()> {
        let hook = self.on_call.read().unwrap_or_else(|e| e.into_inner()).clone();
        match hook {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }
}

type Registry = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Provider of in-memory signals with hooks for simulation logic.
#[derive(Clone, Default)]
pub struct SimProvider {
    signals: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for SimProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimProvider")
            .field("signals", &lock(&self.signals).len())
            .finish()
    }
}

impl SimProvider {
    /// Create a provider with no signals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sources of every signal made so far, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = lock(&self.signals).keys().cloned().collect();
        sources.sort();
        sources
    }

    fn make_value<T: SignalValue>(&self, prefix: &str, name: &str) -> Arc<SimSignal<T>> {
        let source = signal_source(prefix, name);
        let mut signals = lock(&self.signals);
        if let Some(existing) = signals.get(&source) {
            if let Ok(signal) = Arc::clone(existing).downcast::<SimSignal<T>>() {
                return signal;
            }
            tracing::warn!(%source, "Replacing simulated signal with a different value type");
        }
        let signal = Arc::new(SimSignal::<T>::new(source.clone()));
        signals.insert(source, signal.clone());
        signal
    }

    fn make_exec(&self, prefix: &str, name: &str) -> Arc<SimSignalX> {
        let source = signal_source(prefix, name);
        let mut signals = lock(&self.signals);
        if let Some(existing) = signals.get(&source) {
            if let Ok(signal) = Arc::clone(existing).downcast::<SimSignalX>() {
                return signal;
            }
        }
        let signal = Arc::new(SimSignalX::new(source.clone()));
        signals.insert(source, signal.clone());
        signal
    }

    fn lookup(&self, source: &str) -> FlyResult<Arc<dyn Any + Send + Sync>> {
        lock(&self.signals)
            .get(source)
            .cloned()
            .ok_or_else(|| FlyError::UnknownSignal(source.to_string()))
    }

    /// The in-memory store behind `signal`.
    pub fn sim<S>(&self, signal: &S) -> FlyResult<Arc<SimSignal<S::Value>>>
    where
        S: TypedSignal + ?Sized,
    {
        self.lookup(signal.source())?
            .downcast::<SimSignal<S::Value>>()
            .map_err(|_| FlyError::SignalType {
                signal: signal.source().to_string(),
                expected: std::any::type_name::<S::Value>(),
            })
    }

    fn sim_exec<S: SignalX + ?Sized>(&self, signal: &S) -> FlyResult<Arc<SimSignalX>> {
        self.lookup(signal.source())?
            .downcast::<SimSignalX>()
            .map_err(|_| FlyError::SignalType {
                signal: signal.source().to_string(),
                expected: "executable",
            })
    }

    /// Current simulated value of `signal`.
    pub fn get_value<S>(&self, signal: &S) -> FlyResult<S::Value>
    where
        S: TypedSignal + ?Sized,
    {
        Ok(self.sim(signal)?.sim_value())
    }

    /// Set the simulated value of `signal`, notifying observers. Bypasses hooks.
    pub fn set_value<S>(&self, signal: &S, value: S::Value) -> FlyResult<S::Value>
    where
        S: TypedSignal + ?Sized,
    {
        self.sim(signal)?.set_sim_value(value.clone());
        Ok(value)
    }

    /// Run `hook` on every put to `signal`, before the value is stored.
    pub fn on_set<S, F, Fut>(&self, signal: &S, hook: F) -> FlyResult<()>
    where
        S: TypedSignal + ?Sized,
        F: Fn(S::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlyResult<()>> + Send + 'static,
    {
        let hook: SetHook<S::Value> = Arc::new(move |value| Box::pin(hook(value)));
        self.sim(signal)?.set_hook(hook);
        Ok(())
    }

    /// Run `hook` whenever `signal` is executed.
    pub fn on_call<S, F, Fut>(&self, signal: &S, hook: F) -> FlyResult<()>
    where
        S: SignalX + ?Sized,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlyResult<()>> + Send + 'static,
    {
        let hook: CallHook = Arc::new(move || Box::pin(hook()));
        self.sim_exec(signal)?.set_hook(hook);
        Ok(())
    }
}

impl SignalProvider for SimProvider {
    fn signal_r<T: SignalValue>(&self, prefix: &str, name: &str) -> ReadSignal<T> {
        self.make_value::<T>(prefix, name)
    }

    fn signal_w<T: SignalValue>(&self, prefix: &str, name: &str) -> WriteSignal<T> {
        self.make_value::<T>(prefix, name)
    }

    fn signal_rw<T: SignalValue>(&self, prefix: &str, name: &str) -> ReadWriteSignal<T> {
        self.make_value::<T>(prefix, name)
    }

    fn signal_x(&self, prefix: &str, name: &str) -> ExecSignal {
        self.make_exec(prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_defaults_and_set_value() {
        let p = SimProvider::new();
        let egu: ReadSignal<String> = p.signal_r("M1", "egu");
        let demands: WriteSignal<BTreeMap<String, f64>> = p.signal_w("CS1", "demands");
        assert_eq!(egu.get().await.unwrap(), "");
        assert!(p.get_value(&*demands).unwrap().is_empty());

        p.set_value(&*egu, "mm".to_string()).unwrap();
        assert_eq!(egu.get().await.unwrap(), "mm");
        assert!(egu.connected().await);
        assert_eq!(egu.source(), "M1.egu");
        assert_eq!(p.sources(), vec!["CS1.demands", "M1.egu"]);
    }

    #[tokio::test]
    async fn test_observe_starts_with_current_value() {
        let p = SimProvider::new();
        let readback: ReadSignal<f64> = p.signal_r("M1", "readback");
        p.set_value(&*readback, 1.5).unwrap();
        let mut updates = readback.observe();
        assert_eq!(updates.next().await, Some(1.5));
        p.set_value(&*readback, 2.0).unwrap();
        assert_eq!(updates.next().await, Some(2.0));
    }

    #[tokio::test]
    async fn test_on_set_hook_runs_before_store() {
        let p = SimProvider::new();
        let demand: ReadWriteSignal<f64> = p.signal_rw("M1", "demand");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let d = demand.clone();
        p.on_set(&*demand, move |value: f64| {
            let s = s.clone();
            let d = d.clone();
            async move {
                // Not stored yet
                let before = d.get().await?;
                lock(&s).push((before, value));
                Ok(())
            }
        })
        .unwrap();
        demand.put(3.0).await.unwrap();
        assert_eq!(demand.get().await.unwrap(), 3.0);
        assert_eq!(*lock(&seen), vec![(0.0, 3.0)]);
    }

    #[tokio::test]
    async fn test_failing_hook_keeps_old_value() {
        let p = SimProvider::new();
        let mode: ReadWriteSignal<String> = p.signal_rw("DET", "image_mode");
        p.on_set(&*mode, |_value: String| async {
            Err(FlyError::Device("rejected".into()))
        })
        .unwrap();
        assert!(mode.put("Multiple".into()).await.is_err());
        assert_eq!(mode.get().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_on_call() {
        let p = SimProvider::new();
        let start = p.signal_x("DET", "start");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        p.on_call(&*start, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        start.execute().await.unwrap();
        start.execute().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_source_is_shared_and_types_are_checked() {
        let p = SimProvider::new();
        let a: ReadSignal<i64> = p.signal_r("DET", "array_counter");
        let b: ReadWriteSignal<i64> = p.signal_rw("DET", "array_counter");
        b.put(7).await.unwrap();
        assert_eq!(a.get().await.unwrap(), 7);

        // Remaking the source with another type orphans the old handle
        let _: ReadSignal<String> = p.signal_r("DET", "array_counter");
        let wrong = p.get_value(&*a);
        assert!(matches!(wrong, Err(FlyError::SignalType { .. })));
    }
}
