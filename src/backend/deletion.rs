// Deletion queue
//
// Teardown actions are recorded in creation order and run in reverse.
// Each GPU object the engine creates gets exactly one entry, pushed
// right after the object exists.

/// LIFO list of teardown closures.
pub struct DeletionQueue {
    deletors: Vec<(&'static str, Box<dyn FnOnce()>)>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self { deletors: Vec::new() }
    }

    /// Register a teardown action. `label` only shows up in debug logs.
    pub fn push(&mut self, label: &'static str, deletor: impl FnOnce() + 'static) {
        self.deletors.push((label, Box::new(deletor)));
    }

    pub fn len(&self) -> usize {
        self.deletors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletors.is_empty()
    }

    /// Run every action, newest first. The queue is empty afterwards.
    pub fn flush(&mut self) {
        if self.deletors.is_empty() {
            return;
        }
        log::debug!("Flushing deletion queue ({} entries)", self.len());

        while let Some((label, deletor)) = self.deletors.pop() {
            log::debug!("  destroy {}", label);
            deletor();
        }
    }
}

impl Default for DeletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        if !self.deletors.is_empty() {
            log::warn!(
                "Deletion queue dropped with {} pending entries, flushing",
                self.len()
            );
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_queue(n: usize) -> (DeletionQueue, Rc<RefCell<Vec<usize>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::new();
        for i in 0..n {
            let log = log.clone();
            queue.push("entry", move || log.borrow_mut().push(i));
        }
        (queue, log)
    }

    #[test]
    fn flush_runs_in_reverse_insertion_order() {
        for n in [1, 2, 5, 64] {
            let (mut queue, log) = recording_queue(n);
            assert_eq!(queue.len(), n);

            queue.flush();

            let expected: Vec<usize> = (0..n).rev().collect();
            assert_eq!(*log.borrow(), expected);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn second_flush_runs_nothing() {
        let (mut queue, log) = recording_queue(3);
        queue.flush();
        queue.flush();
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn drop_flushes_pending_entries() {
        let (queue, log) = recording_queue(4);
        drop(queue);
        assert_eq!(*log.borrow(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn entries_pushed_after_flush_run_on_next_flush() {
        let (mut queue, log) = recording_queue(2);
        queue.flush();

        let late = log.clone();
        queue.push("late", move || late.borrow_mut().push(99));
        queue.flush();

        assert_eq!(*log.borrow(), vec![1, 0, 99]);
    }
}
