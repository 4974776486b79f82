use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin selection over a fixed set of service replicas.
#[derive(Debug)]
pub struct RoundRobin<T> {
    instances: Vec<T>,
    cursor: AtomicUsize,
}

impl<T> RoundRobin<T> {
    pub fn new(instances: Vec<T>) -> Self {
        Self {
            instances,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[T] {
        &self.instances
    }

    /// Next replica in turn, or `None` when there are none.
    pub fn pick(&self) -> Option<&T> {
        if self.instances.is_empty() {
            return None;
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        self.instances.get(slot)
    }
}
