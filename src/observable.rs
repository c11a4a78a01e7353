//! Observable state holder
//!
//! A value plus everyone who wants to hear about it changing. Async code
//! subscribes through a `tokio::sync::watch` receiver; synchronous code
//! registers a callback. Both are notified on every mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Observable::on_change`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

pub struct Observable<T> {
    tx: watch::Sender<T>,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_listener: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replace the value and notify.
    pub fn set(&self, value: T) {
        self.update(|v| *v = value);
    }

    /// Mutate in place and notify. Returns whatever the closure returns.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut out = None;
        self.tx.send_modify(|v| out = Some(f(v)));
        self.notify();
        // send_modify always runs the closure exactly once
        out.unwrap_or_else(|| unreachable!("send_modify skipped the closure"))
    }

    /// Async subscription. The receiver starts out seeing the current value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Register a callback run after every mutation.
    pub fn on_change(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(lid, _)| *lid != id);
    }

    fn notify(&self) {
        // Listeners may touch this observable again; call them with no lock held.
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if listeners.is_empty() {
            return;
        }
        let value = self.get();
        for listener in listeners {
            listener(&value);
        }
    }
}

impl<T: Clone + Send + Sync + Default + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
