use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::Notify;

/// Where the dialer gets candidate addresses from (trackers, DHT, PEX).
pub trait PeerAddressSource: Send + Sync + 'static {
    /// Waits for the next address. `None` means the source is closed.
    fn next(&self) -> impl Future<Output = Option<SocketAddr>> + Send;
}

#[derive(Debug, Default)]
struct Queue {
    addrs: VecDeque<SocketAddr>,
    closed: bool,
}

/// An in-memory address source. Addresses can be pushed at any time,
/// including ones handed out before; duplicates of still-queued entries are
/// dropped.
///
/// # Examples
///
/// ```
/// use std::net::SocketAddr;
/// use peerwire::PeerList;
///
/// let list = PeerList::new();
/// let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
/// list.push([addr, addr]);
/// assert_eq!(list.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct PeerList {
    queue: Mutex<Queue>,
    notify: Notify,
}

impl PeerList {
    /// Creates an empty, open list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `addrs` and wakes the consumer if anything was added.
    pub fn push<I: IntoIterator<Item = SocketAddr>>(&self, addrs: I) {
        let mut queue = self.queue.lock();
        let before = queue.addrs.len();
        for addr in addrs {
            if !queue.addrs.contains(&addr) {
                queue.addrs.push_back(addr);
            }
        }
        if queue.addrs.len() > before {
            self.notify.notify_one();
        }
    }

    /// Wakes the consumer and makes `next` return `None` once drained.
    pub fn close(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }

    /// Number of queued addresses.
    pub fn len(&self) -> usize {
        self.queue.lock().addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().addrs.is_empty()
    }
}

impl PeerAddressSource for PeerList {
    async fn next(&self) -> Option<SocketAddr> {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(addr) = queue.addrs.pop_front() {
                    return Some(addr);
                }
                if queue.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}
