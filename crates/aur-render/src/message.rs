//! Update messages between the control and audio sides of a renderer
//!
//! A message carries the entity and path changes of exactly one scene update:
//! six vectors of pooled references. Messages themselves are pooled and
//! reference-counted; the queue hands the reference across threads, and the
//! audio side's drop after draining returns the message (and with it every
//! reference it carried) without touching the allocator. Messages are never
//! merged.

use aur_core::{AurError, AurResult, Pool, PoolBox, PoolItem, PoolRef};
use parking_lot::Mutex;

use crate::{RendererReceiver, RendererSource};

/// Entity and path changes of one scene update
pub struct UpdateMessage<P: PoolItem> {
    pub new_sources: Vec<PoolRef<RendererSource>>,
    pub del_sources: Vec<PoolRef<RendererSource>>,
    pub new_receivers: Vec<PoolRef<RendererReceiver>>,
    pub del_receivers: Vec<PoolRef<RendererReceiver>>,
    pub new_paths: Vec<PoolRef<P>>,
    pub del_paths: Vec<PoolRef<P>>,
}

impl<P: PoolItem> Default for UpdateMessage<P> {
    fn default() -> Self {
        Self {
            new_sources: Vec::new(),
            del_sources: Vec::new(),
            new_receivers: Vec::new(),
            del_receivers: Vec::new(),
            new_paths: Vec::new(),
            del_paths: Vec::new(),
        }
    }
}

impl<P: PoolItem> UpdateMessage<P> {
    pub fn is_empty(&self) -> bool {
        self.new_sources.is_empty()
            && self.del_sources.is_empty()
            && self.new_receivers.is_empty()
            && self.del_receivers.is_empty()
            && self.new_paths.is_empty()
            && self.del_paths.is_empty()
    }
}

impl<P: PoolItem> PoolItem for UpdateMessage<P> {
    fn reset(&mut self) {
        self.pre_release();
    }

    fn pre_release(&mut self) {
        self.new_sources.clear();
        self.del_sources.clear();
        self.new_receivers.clear();
        self.del_receivers.clear();
        self.new_paths.clear();
        self.del_paths.clear();
    }
}

/// In-flight message limit per renderer
const QUEUE_CAPACITY: usize = 256;

/// SPSC queue of pooled update messages
///
/// The producer half belongs to the control thread, the consumer half to the
/// audio thread; each mutex has a single owner by protocol.
pub struct UpdateQueue<P: PoolItem> {
    pool: Pool<UpdateMessage<P>>,
    producer: Mutex<rtrb::Producer<PoolRef<UpdateMessage<P>>>>,
    consumer: Mutex<rtrb::Consumer<PoolRef<UpdateMessage<P>>>>,
}

impl<P: PoolItem> UpdateQueue<P> {
    pub fn new() -> Self {
        let (producer, consumer) = rtrb::RingBuffer::new(QUEUE_CAPACITY);
        Self {
            pool: Pool::new(2, 1, UpdateMessage::default),
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
        }
    }

    /// Fresh empty message to fill on the control thread
    pub fn begin(&self) -> PoolBox<UpdateMessage<P>> {
        self.pool.request()
    }

    /// Publish a message to the audio thread (control thread)
    pub fn push(&self, message: PoolBox<UpdateMessage<P>>) -> AurResult<()> {
        self.producer
            .lock()
            .push(message.fix())
            .map_err(|_| AurError::Modal("renderer update queue is full".into()))
    }

    /// Drain pending messages (audio thread); the handler sees each message
    /// once, then its references are released
    pub fn drain(&self, mut handler: impl FnMut(&UpdateMessage<P>)) {
        let mut consumer = self.consumer.lock();
        while let Ok(message) = consumer.pop() {
            handler(&message);
        }
    }

    /// Number of live (undrained or still referenced) messages
    pub fn live_messages(&self) -> usize {
        self.pool.live()
    }
}

impl<P: PoolItem> Default for UpdateQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct DummyPath;
    impl PoolItem for DummyPath {
        fn reset(&mut self) {}
    }

    #[test]
    fn test_message_round_trip_returns_to_pool() {
        let queue: UpdateQueue<DummyPath> = UpdateQueue::new();
        let path_pool: Pool<DummyPath> = Pool::new(2, 1, DummyPath::default);

        let path = path_pool.request().fix();
        let mut msg = queue.begin();
        msg.new_paths.push(path.clone());
        queue.push(msg).unwrap();
        assert_eq!(queue.live_messages(), 1);

        let mut seen_paths = 0;
        queue.drain(|m| {
            seen_paths += m.new_paths.len();
            assert!(m.del_paths.is_empty());
        });
        assert_eq!(seen_paths, 1);

        // Message is back in the pool and dropped its path reference
        assert_eq!(queue.live_messages(), 0);
        assert_eq!(path.ref_count(), 1);
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let queue: UpdateQueue<DummyPath> = UpdateQueue::new();
        let path_pool: Pool<DummyPath> = Pool::new(4, 1, DummyPath::default);

        for n in 1..=3usize {
            let mut msg = queue.begin();
            for _ in 0..n {
                msg.new_paths.push(path_pool.request().fix());
            }
            queue.push(msg).unwrap();
        }

        let mut sizes = Vec::new();
        queue.drain(|m| sizes.push(m.new_paths.len()));
        assert_eq!(sizes, vec![1, 2, 3]);
    }
}
