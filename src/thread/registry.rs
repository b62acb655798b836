use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::RwLock;

use super::{RuntimeThread, ThreadHandle};

/// Intrusive list of attached threads.
///
/// Mutation happens only with the pause state locked and no pause running,
/// so the suspender and the collector always see a stable list. A thread
/// removed from the list keeps its `next` link: a cursor parked on it can
/// still reach the rest of the list.
pub struct ThreadRegistry {
    head: RwLock<Option<Arc<RuntimeThread>>>,
    count: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            head: RwLock::new(None),
            count: AtomicUsize::new(0),
        }
    }

    /// Enumeration: `None` yields the first thread, `Some(t)` the thread after `t`.
    pub fn thread_list(&self, cursor: Option<&RuntimeThread>) -> Option<Arc<RuntimeThread>> {
        match cursor {
            None => self.head.read().clone(),
            Some(thread) => thread.next.lock().clone(),
        }
    }

    pub fn iter(&self) -> Threads<'_> {
        Threads {
            registry: self,
            cursor: None,
            started: false,
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, handle: ThreadHandle) -> Option<Arc<RuntimeThread>> {
        self.iter().find(|thread| thread.handle() == handle)
    }

    /// Publishes `thread` at the head of the list. Its link is written
    /// before the head, so readers never see a half-linked node.
    pub(crate) fn push(&self, thread: Arc<RuntimeThread>) {
        let mut head = self.head.write();
        *thread.next.lock() = head.take();
        *head = Some(thread);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Removes `thread` from the list. Returns false if it was not linked.
    pub(crate) fn unlink(&self, thread: &RuntimeThread) -> bool {
        let mut head = self.head.write();

        if head
            .as_ref()
            .map_or(false, |first| std::ptr::eq(Arc::as_ptr(first), thread))
        {
            *head = thread.next.lock().clone();
            self.count.fetch_sub(1, Ordering::AcqRel);
            return true;
        }

        let mut cursor = head.clone();
        while let Some(node) = cursor {
            let mut next = node.next.lock();
            if next
                .as_ref()
                .map_or(false, |succ| std::ptr::eq(Arc::as_ptr(succ), thread))
            {
                *next = thread.next.lock().clone();
                self.count.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
            cursor = next.clone();
        }

        false
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Threads<'a> {
    registry: &'a ThreadRegistry,
    cursor: Option<Arc<RuntimeThread>>,
    started: bool,
}

impl<'a> Iterator for Threads<'a> {
    type Item = Arc<RuntimeThread>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match (&self.cursor, self.started) {
            (_, false) => self.registry.thread_list(None),
            (Some(cursor), true) => self.registry.thread_list(Some(cursor)),
            (None, true) => None,
        };
        self.started = true;
        self.cursor = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::safepoint::SuspensionCoordinator;

    fn node(coordinator: &Arc<SuspensionCoordinator>) -> Arc<RuntimeThread> {
        Arc::new(RuntimeThread::new(coordinator.clone(), false))
    }

    #[test]
    fn empty_registry_yields_nothing() {
        let registry = ThreadRegistry::new();
        assert!(registry.thread_list(None).is_none());
        assert_eq!(registry.iter().count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn enumerates_each_thread_once() {
        let coordinator = Arc::new(SuspensionCoordinator::new(Duration::from_secs(1)));
        let registry = ThreadRegistry::new();
        let threads = (0..5).map(|_| node(&coordinator)).collect::<Vec<_>>();
        for thread in &threads {
            registry.push(thread.clone());
        }

        let mut seen = registry.iter().map(|t| t.handle()).collect::<Vec<_>>();
        seen.sort();
        let mut expected = threads.iter().map(|t| t.handle()).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn unlink_keeps_cursor_valid() {
        let coordinator = Arc::new(SuspensionCoordinator::new(Duration::from_secs(1)));
        let registry = ThreadRegistry::new();
        let a = node(&coordinator);
        let b = node(&coordinator);
        let c = node(&coordinator);
        registry.push(a.clone());
        registry.push(b.clone());
        registry.push(c.clone());

        // List order is c, b, a. Park a cursor on b and remove it.
        let first = registry.thread_list(None).unwrap();
        assert!(Arc::ptr_eq(&first, &c));
        let cursor = registry.thread_list(Some(&first)).unwrap();
        assert!(Arc::ptr_eq(&cursor, &b));

        assert!(registry.unlink(&b));
        assert!(!registry.unlink(&b));
        let after = registry.thread_list(Some(&cursor)).unwrap();
        assert!(Arc::ptr_eq(&after, &a));

        assert_eq!(registry.len(), 2);
        assert!(registry.find(b.handle()).is_none());
        assert!(registry.find(a.handle()).is_some());

        assert!(registry.unlink(&c));
        assert!(Arc::ptr_eq(&registry.thread_list(None).unwrap(), &a));
    }
}
