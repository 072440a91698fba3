use std::collections::VecDeque;
use std::fmt;

use futures_util::future::BoxFuture;

/// A dispatched stream processor: the application handler for one request,
/// boxed and ready to run on the worker pool.
pub type Processor = BoxFuture<'static, ()>;

/// Hands completed request heads to the worker pool.
///
/// When the configured in-process execution limit is at least the advertised
/// MAX_CONCURRENT_STREAMS there is nothing to police and every processor is
/// spawned directly. Otherwise a counter tracks in-flight processors and the
/// overflow waits in a FIFO queue; each completion pulls the next one in
/// arrival order.
pub struct Dispatcher {
    /// `None` means direct dispatch, no cap.
    cap: Option<u32>,
    running: u32,
    queue: VecDeque<Processor>,
}

impl Dispatcher {
    pub fn new(max_execution: u32, max_concurrent_streams: u32) -> Dispatcher {
        let cap = if max_execution >= max_concurrent_streams {
            None
        } else {
            Some(max_execution)
        };

        Dispatcher {
            cap,
            running: 0,
            queue: VecDeque::new(),
        }
    }

    /// Submit a processor. Returns it back if it should run now; otherwise
    /// it has been queued.
    pub fn submit(&mut self, processor: Processor) -> Option<Processor> {
        match self.cap {
            None => Some(processor),
            Some(cap) if self.running < cap => {
                self.running += 1;
                Some(processor)
            }
            Some(_) => {
                tracing::trace!(
                    "stream processor queued; running={} queued={}",
                    self.running,
                    self.queue.len() + 1
                );
                self.queue.push_back(processor);
                None
            }
        }
    }

    /// A processor finished. Returns the next queued processor to run, if a
    /// slot opened for it.
    pub fn complete(&mut self) -> Option<Processor> {
        let cap = self.cap?;

        self.running -= 1;
        if self.running < cap {
            if let Some(next) = self.queue.pop_front() {
                self.running += 1;
                return Some(next);
            }
        }

        None
    }

    #[cfg(test)]
    fn running(&self) -> u32 {
        self.running
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cap", &self.cap)
            .field("running", &self.running)
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> Processor {
        Box::pin(async {})
    }

    #[test]
    fn uncapped_is_direct() {
        let mut dispatcher = Dispatcher::new(100, 100);

        for _ in 0..200 {
            assert!(dispatcher.submit(processor()).is_some());
        }
        assert_eq!(dispatcher.queued(), 0);
        assert!(dispatcher.complete().is_none());
    }

    #[test]
    fn capped_queues_in_fifo_order() {
        let mut dispatcher = Dispatcher::new(2, 100);

        assert!(dispatcher.submit(processor()).is_some());
        assert!(dispatcher.submit(processor()).is_some());
        assert_eq!(dispatcher.running(), 2);

        // Third runs over the cap: queued.
        assert!(dispatcher.submit(processor()).is_none());
        assert_eq!(dispatcher.queued(), 1);

        // A completion promotes the queued processor, keeping the slot
        // occupied.
        assert!(dispatcher.complete().is_some());
        assert_eq!(dispatcher.running(), 2);
        assert_eq!(dispatcher.queued(), 0);

        assert!(dispatcher.complete().is_none());
        assert!(dispatcher.complete().is_none());
        assert_eq!(dispatcher.running(), 0);
    }
}
