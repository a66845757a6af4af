// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Fixed-capacity FIFO shared between the shell and the engine.
//!
//! Each queue has exactly one producer and one consumer thread, so a
//! mutex-guarded ring is sufficient; there is never real contention on
//! the lock.

use std::sync::Mutex;

pub struct BoundedQueue<T> {
    inner: Mutex<Ring<T>>,
}

struct Ring<T> {
    buf: Vec<Option<T>>,
    /// Index of the next item to pop
    head: usize,
    /// Index of the next free slot
    tail: usize,
    count: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Ring {
                buf: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
                count: 0,
            }),
        }
    }

    /// Appends `item` to the queue. When the queue is full the item is
    /// handed back to the caller so it can report the drop.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut ring = self.inner.lock().expect("queue lock failed");
        if ring.count == ring.buf.len() {
            return Err(item);
        }
        let tail = ring.tail;
        ring.buf[tail] = Some(item);
        ring.tail = (tail + 1) % ring.buf.len();
        ring.count += 1;
        Ok(())
    }

    /// Removes the oldest item, `None` when the queue is drained
    pub fn try_pop(&self) -> Option<T> {
        let mut ring = self.inner.lock().expect("queue lock failed");
        if ring.count == 0 {
            return None;
        }
        let head = ring.head;
        let item = ring.buf[head].take();
        ring.head = (head + 1) % ring.buf.len();
        ring.count -= 1;
        debug_assert!(item.is_some(), "occupied slot was empty");
        item
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock failed").count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("queue lock failed").buf.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.try_push(i).expect("push failed");
        }
        for i in 0..4 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_full_rejects_and_returns_item() {
        let queue = BoundedQueue::new(2);
        queue.try_push("a").expect("push failed");
        queue.try_push("b").expect("push failed");
        assert_eq!(queue.len(), queue.capacity());
        assert_eq!(queue.try_push("c"), Err("c"));
        // a pop makes room again
        assert_eq!(queue.try_pop(), Some("a"));
        queue.try_push("c").expect("push failed");
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), Some("c"));
    }

    #[test]
    fn test_wraparound() {
        let queue = BoundedQueue::new(3);
        for round in 0..10 {
            queue.try_push(round * 2).expect("push failed");
            queue.try_push(round * 2 + 1).expect("push failed");
            assert_eq!(queue.try_pop(), Some(round * 2));
            assert_eq!(queue.try_pop(), Some(round * 2 + 1));
        }
        assert!(queue.is_empty());
    }

    /// Popped items must form a prefix of the pushed sequence for any
    /// single-producer/single-consumer interleaving.
    #[test]
    fn test_spsc_prefix_law() {
        let queue = Arc::new(BoundedQueue::new(8));
        let producer_queue = queue.clone();

        let producer = thread::spawn(move || {
            let mut pushed = 0u32;
            while pushed < 1000 {
                if producer_queue.try_push(pushed).is_ok() {
                    pushed += 1;
                }
            }
        });

        let mut expected = 0u32;
        while expected < 1000 {
            if let Some(item) = queue.try_pop() {
                assert_eq!(item, expected);
                expected += 1;
            }
        }
        producer.join().expect("producer thread failed");
        assert!(queue.is_empty());
    }
}
