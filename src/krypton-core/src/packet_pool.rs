//! Reusable packet buffers for the datapath hot path.
//!
//! A fixed collection of packets that can be borrowed and returned, so the
//! datapath never allocates per packet. Borrowing blocks for a bounded time
//! under pressure and then gives up; the traffic is UDP, dropping under
//! exhaustion is acceptable.
//!
//! This type uses blocking synchronization and belongs on the datapath's
//! dedicated threads, not on a component looper.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

/// Each packet is roughly 1.5K, so 400 is about 0.6MB per direction.
pub const DEFAULT_POOL_SIZE: usize = 400;

/// Maximum payload one packet can hold.
pub const MAX_PACKET_SIZE: usize = 1500;

/// How long `borrow` waits for a packet before giving up.
const BORROW_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// One reusable buffer.
#[derive(Debug)]
pub struct Packet {
    data: Box<[u8; MAX_PACKET_SIZE]>,
    len: usize,
}

impl Packet {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; MAX_PACKET_SIZE]),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        MAX_PACKET_SIZE
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks `len` bytes as valid. Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= MAX_PACKET_SIZE);
        self.len = len;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

struct Shared {
    available: Mutex<Vec<Packet>>,
    returned: Condvar,
    capacity: usize,
}

/// Fixed-capacity pool of reusable packets.
pub struct PacketPool {
    shared: Arc<Shared>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let available = (0..capacity).map(|_| Packet::new()).collect();
        Self {
            shared: Arc::new(Shared {
                available: Mutex::new(available),
                returned: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Takes a packet from the pool, waiting a bounded time if none is
    /// available. Returns `None` on exhaustion; the caller drops the
    /// packet it was going to send.
    pub fn borrow(&self) -> Option<PacketLease> {
        let deadline = Instant::now() + BORROW_WAIT_TIMEOUT;
        let mut available = self.shared.available.lock().unwrap();
        loop {
            if let Some(mut packet) = available.pop() {
                packet.len = 0;
                return Some(PacketLease {
                    packet: Some(packet),
                    shared: Arc::clone(&self.shared),
                });
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return None;
            }
            let (guard, result) = self
                .shared
                .returned
                .wait_timeout(available, timeout)
                .unwrap();
            available = guard;
            if result.timed_out() && available.is_empty() {
                return None;
            }
        }
    }

    pub fn available(&self) -> usize {
        self.shared.available.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PacketPool {
    fn drop(&mut self) {
        let mut available = self.shared.available.lock().unwrap();
        while available.len() != self.shared.capacity {
            warn!("packet pool dropped with outstanding leases, waiting");
            available = self.shared.returned.wait(available).unwrap();
        }
    }
}

/// A borrowed packet. Returns its buffer to the pool on drop.
pub struct PacketLease {
    packet: Option<Packet>,
    shared: Arc<Shared>,
}

impl Deref for PacketLease {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        self.packet.as_ref().expect("lease holds a packet")
    }
}

impl DerefMut for PacketLease {
    fn deref_mut(&mut self) -> &mut Packet {
        self.packet.as_mut().expect("lease holds a packet")
    }
}

impl Drop for PacketLease {
    fn drop(&mut self) {
        if let Some(packet) = self.packet.take() {
            self.shared.available.lock().unwrap().push(packet);
            self.shared.returned.notify_all();
        }
    }
}
