//! Closable FIFO mailbox feeding the work manager's owner thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct Mailbox<T> {
    inner: Mutex<MailboxState<T>>,
    available: Condvar,
}

struct MailboxState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Push a message; returns it back if the mailbox is closed.
    pub fn push(&self, message: T) -> Result<(), T> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        if guard.closed {
            return Err(message);
        }
        guard.queue.push_back(message);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a message is available, or the mailbox is closed and drained.
    pub fn pop_blocking_or_closed(&self) -> Option<T> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        loop {
            if let Some(message) = guard.queue.pop_front() {
                return Some(message);
            }
            if guard.closed {
                return None;
            }
            guard = self.available.wait(guard).expect("condvar wait failed");
        }
    }

    /// Close the mailbox and wake all blocked consumers. Queued messages are
    /// still delivered.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.closed = true;
        self.available.notify_all();
    }

    /// Close the mailbox and hand back everything still queued.
    pub fn close_and_drain(&self) -> Vec<T> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.closed = true;
        self.available.notify_all();
        guard.queue.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        let guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.closed
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.queue.len()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn messages_arrive_in_order_once() {
        let mailbox = Arc::new(Mailbox::new());
        let producers = 4;
        let per_producer = 50u32;
        let barrier = Arc::new(Barrier::new(producers));

        let mut handles = Vec::new();
        for p in 0..producers as u32 {
            let mailbox = Arc::clone(&mailbox);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..per_producer {
                    mailbox.push((p, i)).expect("mailbox closed");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("producer thread panicked");
        }
        mailbox.close();

        let mut seen = HashSet::new();
        let mut last = vec![None; producers];
        while let Some((p, i)) = mailbox.pop_blocking_or_closed() {
            assert!(seen.insert((p, i)));
            // Per-producer order is preserved.
            assert!(last[p as usize].is_none_or(|prev| prev < i));
            last[p as usize] = Some(i);
        }
        assert_eq!(seen.len(), producers * per_producer as usize);
        assert_eq!(mailbox.len(), 0);
    }

    #[test]
    fn pop_blocking_wakes_on_push() {
        let mailbox = Arc::new(Mailbox::new());
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let mailbox_clone = Arc::clone(&mailbox);
        let handle = thread::spawn(move || {
            ready_tx.send(()).expect("send ready");
            let message = mailbox_clone
                .pop_blocking_or_closed()
                .expect("mailbox closed");
            tx.send(message).expect("send message");
        });

        ready_rx.recv_timeout(Duration::from_secs(1)).expect("ready");
        mailbox.push(99u64).expect("mailbox closed");

        let received = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("receive message");
        assert_eq!(received, 99);
        handle.join().expect("blocking pop thread panicked");
    }

    #[test]
    fn pop_blocking_or_closed_unblocks_on_close() {
        let mailbox: Arc<Mailbox<u64>> = Arc::new(Mailbox::new());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let mailbox_clone = Arc::clone(&mailbox);
        let handle = thread::spawn(move || {
            ready_tx.send(()).expect("ready");
            let message = mailbox_clone.pop_blocking_or_closed();
            done_tx.send(message.is_none()).expect("done");
        });

        ready_rx.recv_timeout(Duration::from_secs(1)).expect("ready");
        mailbox.close();

        let closed = done_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("done recv");
        assert!(closed);
        handle.join().expect("consumer thread panicked");
    }

    #[test]
    fn push_fails_after_close_and_drain_returns_backlog() {
        let mailbox = Mailbox::new();
        mailbox.push(1).expect("open");
        mailbox.push(2).expect("open");
        assert_eq!(mailbox.close_and_drain(), vec![1, 2]);
        assert!(mailbox.is_closed());
        assert_eq!(mailbox.push(3), Err(3));
    }
}
