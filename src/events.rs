//! In-process typed event hub.
//!
//! Hubs are constructed by their owner (the execution controller) and handed
//! to the components that publish into them; there is no process-wide bus.
//! Every listener gets its own unbounded channel so a slow handler never
//! causes events to be dropped for the others.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct EventHub<E> {
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Publish an event to every live listener. Closed listeners are pruned.
    pub fn emit(&self, event: E) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Raw subscription. The listener is removed once the receiver is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Run `handler` for every event, one at a time, in publish order.
    pub fn on<F, Fut>(&self, mut handler: F) -> ListenerHandle
    where
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event).await;
            }
        });
        ListenerHandle { task }
    }

    /// Wait for the first event matching `predicate`, giving up after `timeout`.
    pub async fn once_with_timeout<P>(&self, mut predicate: P, timeout: Duration) -> Option<E>
    where
        P: FnMut(&E) -> bool,
    {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, async {
            while let Some(event) = rx.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    pub fn listener_count(&self) -> usize {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| !tx.is_closed());
        listeners.len()
    }
}

/// Deregistration handle returned by [`EventHub::on`].
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn remove(self) {
        self.task.abort();
    }
}

/// Listener handles collected by an owner and removed together.
#[derive(Debug, Default)]
pub struct Listeners {
    handles: Vec<ListenerHandle>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ListenerHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn remove_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn listeners_receive_events_in_order() {
        let hub: EventHub<u32> = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _handle = hub.on(move |n| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(n);
            }
        });

        for n in 0..5 {
            hub.emit(n);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn removed_listeners_stop_receiving() {
        let hub: EventHub<u32> = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));

        let mut listeners = Listeners::new();
        for _ in 0..2 {
            let count = count.clone();
            listeners.push(hub.on(move |_| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        assert_eq!(listeners.len(), 2);

        hub.emit(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        listeners.remove_all();
        assert!(listeners.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;

        hub.emit(2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn once_with_timeout_matches_or_expires() {
        let hub: EventHub<u32> = EventHub::new();

        let publisher = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.emit(1);
            publisher.emit(7);
        });

        let found = hub
            .once_with_timeout(|n| *n == 7, Duration::from_secs(1))
            .await;
        assert_eq!(found, Some(7));

        let missing = hub
            .once_with_timeout(|n| *n == 9, Duration::from_millis(30))
            .await;
        assert!(missing.is_none());
    }
}
