use std::sync::{Arc, Mutex, PoisonError};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct EmitterState<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    disposed: bool,
}

/// Observer list. Cloning shares the same listeners.
///
/// Listeners run on the thread that fires the event, outside the internal
/// lock, so a listener may subscribe or fire again. Once disposed the emitter
/// drops its listeners and ignores further `fire` and `subscribe` calls.
pub struct Emitter<T> {
    state: Arc<Mutex<EmitterState<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Emitter {
            state: Arc::new(Mutex::new(EmitterState {
                next_id: 0,
                listeners: Vec::new(),
                disposed: false,
            })),
        }
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.disposed {
            return Subscription { remove: None };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, Arc::new(listener)));

        let weak = Arc::downgrade(&self.state);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.listeners.retain(|(listener_id, _)| *listener_id != id);
                }
            })),
        }
    }

    pub fn fire(&self, event: &T) {
        let listeners: Vec<Listener<T>> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.disposed {
                return;
            }
            state.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.disposed = true;
        state.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.listeners.len()
    }
}

/// Handle returned by [`Emitter::subscribe`]. Dropping it keeps the listener
/// registered; call [`Subscription::dispose`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn dispose(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_every_listener() {
        let emitter: Emitter<usize> = Emitter::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = total.clone();
            emitter.subscribe(move |n| {
                total.fetch_add(*n, Ordering::SeqCst);
            });
        }
        emitter.fire(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let emitter: Emitter<()> = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let subscription = emitter.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        emitter.fire(&());
        subscription.dispose();
        emitter.fire(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn disposed_emitter_is_silent() {
        let emitter: Emitter<()> = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        emitter.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        emitter.dispose();
        emitter.fire(&());
        emitter.subscribe(|_| {});
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.listener_count(), 0);
    }
}
