//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Per-node RTU runtime: simulation, protocol listeners, control channel."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use scada_proto::Frame;
use tokio::sync::Notify;

/// Bounded frame queue feeding the control-channel writer.
///
/// The sampler and protocol listeners push regardless of master
/// connectivity; while the master is away frames accumulate here (dropping
/// the oldest on overflow) and are drained in order after the next
/// handshake, each frame keeping its original timestamps.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<Frame>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Push a frame, evicting the oldest one when full.
    pub fn push(&self, frame: Frame) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(frame);
        }
        self.inner.notify.notify_one();
    }

    /// Pop the oldest frame if one is queued.
    pub fn try_pop(&self) -> Option<Frame> {
        self.inner.queue.lock().pop_front()
    }

    /// Wait until a frame is available and pop it.
    pub async fn pop(&self) -> Frame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted since start.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_evicts_exactly_the_oldest() {
        let queue = OutboundQueue::new(3);
        for _ in 0..3 {
            queue.push(Frame::heartbeat());
        }
        let marker = Frame::Event(scada_proto::RtuEvent::Alarm {
            code: "TEST".into(),
            severity: "info".into(),
            message: "marker".into(),
            details: serde_json::json!({}),
            timestamp: chrono::Utc::now(),
        });
        queue.push(marker.clone());

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        // Two heartbeats survive, then the marker.
        assert_eq!(queue.try_pop().unwrap().kind(), "heartbeat");
        assert_eq!(queue.try_pop().unwrap().kind(), "heartbeat");
        assert_eq!(queue.try_pop().unwrap(), marker);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = OutboundQueue::new(8);
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(Frame::heartbeat());
        let frame = handle.await.unwrap();
        assert_eq!(frame.kind(), "heartbeat");
    }
}
