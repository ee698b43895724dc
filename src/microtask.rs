/// FIFO microtask queue (§4.4/§5). Promise reactions and `await`
/// resumptions are queued here; `ExecuteMicrotasks` drains them in order,
/// and jobs enqueued by a running job are appended to run later in the
/// same drain turn rather than immediately (Testable Property 7).
use crate::value::Value;

/// A deferred job: the callback to invoke and the argument to invoke it
/// with (the settled promise value, or undefined for a plain resumption).
pub struct Microtask {
    pub callback: Value,
    pub argument: Value,
}

#[derive(Default)]
pub struct MicrotaskQueue {
    jobs: std::collections::VecDeque<Microtask>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        MicrotaskQueue { jobs: std::collections::VecDeque::new() }
    }

    pub fn enqueue(&mut self, callback: Value, argument: Value) {
        self.jobs.push_back(Microtask { callback, argument });
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn pop_front(&mut self) -> Option<Microtask> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Every queued job's `callback`/`argument`, for GC root-tracing (§5) —
    /// a job sitting in the queue is still reachable and must survive a
    /// collection that runs before it's drained.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.jobs.iter_mut().flat_map(|job| [&mut job.callback, &mut job.argument])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_drain_in_fifo_order() {
        let mut q = MicrotaskQueue::new();
        q.enqueue(Value::undefined(), Value::int(1));
        q.enqueue(Value::undefined(), Value::int(2));
        let first = q.pop_front().unwrap();
        let second = q.pop_front().unwrap();
        assert_eq!(first.argument.as_number(), Some(1.0));
        assert_eq!(second.argument.as_number(), Some(2.0));
        assert!(q.is_empty());
    }
}
