use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreEvent {
    Locked,
    Unlocked,
    LocksCountChanged(u32),
}

type Subscriber = Box<dyn FnMut(SemaphoreEvent) + Send>;

/// Counting lock that pauses time progression while any holder keeps it.
#[derive(Default)]
pub struct GatingSemaphore {
    count: u32,
    subscribers: Vec<Subscriber>,
}

impl GatingSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(SemaphoreEvent) + Send + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn is_locked(&self) -> bool {
        self.count > 0
    }

    pub fn locks_count(&self) -> u32 {
        self.count
    }

    pub fn lock(&mut self) {
        self.count += 1;
        self.notify(SemaphoreEvent::LocksCountChanged(self.count));
        if self.count == 1 {
            debug!("Semaphore locked");
            self.notify(SemaphoreEvent::Locked);
        }
    }

    pub fn unlock(&mut self) {
        if self.count == 0 {
            warn!("Unlock called on a semaphore that is not locked");
            return;
        }

        self.count -= 1;
        self.notify(SemaphoreEvent::LocksCountChanged(self.count));
        if self.count == 0 {
            debug!("Semaphore unlocked");
            self.notify(SemaphoreEvent::Unlocked);
        }
    }

    fn notify(&mut self, event: SemaphoreEvent) {
        for subscriber in &mut self.subscribers {
            subscriber(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorded(semaphore: &mut GatingSemaphore) -> Arc<Mutex<Vec<SemaphoreEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        semaphore.subscribe(move |event| sink.lock().push(event));
        events
    }

    #[test]
    fn test_lock_transitions_notify_once() {
        let mut semaphore = GatingSemaphore::new();
        let events = recorded(&mut semaphore);

        semaphore.lock();
        semaphore.lock();
        semaphore.unlock();
        assert!(semaphore.is_locked());
        semaphore.unlock();
        assert!(!semaphore.is_locked());

        use SemaphoreEvent::*;
        assert_eq!(
            *events.lock(),
            vec![
                LocksCountChanged(1),
                Locked,
                LocksCountChanged(2),
                LocksCountChanged(1),
                LocksCountChanged(0),
                Unlocked,
            ]
        );
    }

    #[test]
    fn test_unlock_at_zero_is_ignored() {
        let mut semaphore = GatingSemaphore::new();
        let events = recorded(&mut semaphore);

        semaphore.unlock();
        assert_eq!(semaphore.locks_count(), 0);
        assert!(events.lock().is_empty());
    }
}
