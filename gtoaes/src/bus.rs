//! Per-owner message queue.
//!
//! Every component that mutates cross-method state owns exactly one of
//! these; all of its public entry points enqueue and a single consumer task
//! drains. That single-consumer discipline replaces ad-hoc locking and keeps
//! periodic tasks and socket callbacks from re-entering each other.
//!
//! Two priorities exist: `post` is the normal path, `send` is reserved for
//! the shutdown message and may overtake posted messages. Within each
//! priority delivery order is submission order.

use tokio::sync::mpsc;

/// Pending messages per owner before producers start waiting.
pub const BUS_DEPTH: usize = 1024;

/// Producer half, cheap to clone.
#[derive(Debug)]
pub struct Bus<M> {
    normal: mpsc::Sender<M>,
    urgent: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Bus<M> {
    fn clone(&self) -> Self {
        Self {
            normal: self.normal.clone(),
            urgent: self.urgent.clone(),
        }
    }
}

impl<M> Bus<M> {
    /// Enqueue at normal priority. Waits when the queue is full; a closed
    /// queue (consumer gone) drops the message silently.
    pub async fn post(&self, msg: M) {
        let _ = self.normal.send(msg).await;
    }

    /// Enqueue at high priority; overtakes posted messages. Used only for
    /// the quit message of the owner's stop sequence.
    pub fn send(&self, msg: M) {
        let _ = self.urgent.send(msg);
    }
}

/// Consumer half; exactly one per owner.
#[derive(Debug)]
pub struct BusReceiver<M> {
    normal: mpsc::Receiver<M>,
    urgent: mpsc::UnboundedReceiver<M>,
}

impl<M> BusReceiver<M> {
    /// Next message, urgent first. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<M> {
        // Drain urgent messages before looking at the normal queue.
        if let Ok(msg) = self.urgent.try_recv() {
            return Some(msg);
        }
        tokio::select! {
            biased;
            msg = self.urgent.recv() => {
                match msg {
                    Some(msg) => Some(msg),
                    // Urgent side closed; fall back to the normal queue.
                    None => self.normal.recv().await,
                }
            }
            msg = self.normal.recv() => msg,
        }
    }
}

/// Build one owner's queue pair.
pub fn channel<M>() -> (Bus<M>, BusReceiver<M>) {
    let (normal_tx, normal_rx) = mpsc::channel(BUS_DEPTH);
    let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();
    (
        Bus {
            normal: normal_tx,
            urgent: urgent_tx,
        },
        BusReceiver {
            normal: normal_rx,
            urgent: urgent_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_submission_order() {
        let (bus, mut rx) = channel::<u32>();
        for i in 0..100 {
            bus.post(i).await;
        }
        for i in 0..100 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn urgent_overtakes_posted() {
        let (bus, mut rx) = channel::<&'static str>();
        bus.post("first").await;
        bus.post("second").await;
        bus.send("quit");
        assert_eq!(rx.recv().await, Some("quit"));
        assert_eq!(rx.recv().await, Some("first"));
        assert_eq!(rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn recv_ends_when_producers_drop() {
        let (bus, mut rx) = channel::<u32>();
        bus.post(7).await;
        drop(bus);
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }
}
