use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::SystemTime,
};

use tokio::sync::{broadcast, Mutex as AsyncMutex};

use isobus::{matches_any, CanFilter, Frame};

use crate::can::CanSocket;

/// A frame as presented by the transport, with its delivery metadata.
#[derive(Clone, Debug)]
pub struct FrameEvent {
    pub frame: Frame,
    /// Approximate receive time.
    pub timestamp: SystemTime,
    /// Error frame; the identifier carries the error class bits.
    pub error: bool,
}

/// Frame transport under a network.
///
/// Either a SocketCAN socket bound to a physical interface or a tap on an
/// in-process bus segment. The in-process bus backs the simulator and the
/// test suite, where it behaves like a quiet CAN segment.
pub enum Bus {
    Socket(CanSocket),
    Virtual(VirtualBus),
}

impl Bus {
    pub async fn send(&self, frame: &Frame) -> io::Result<usize> {
        match self {
            Bus::Socket(socket) => socket.send(frame).await,
            Bus::Virtual(bus) => bus.send(frame),
        }
    }

    pub async fn recv(&self) -> io::Result<FrameEvent> {
        match self {
            Bus::Socket(socket) => socket.recv().await,
            Bus::Virtual(bus) => bus.recv().await,
        }
    }

    pub fn set_filters(&self, filters: &[CanFilter], err_mask: u32) -> io::Result<()> {
        match self {
            Bus::Socket(socket) => socket.set_filters(filters, err_mask),
            Bus::Virtual(bus) => {
                bus.set_filters(filters, err_mask);
                Ok(())
            }
        }
    }
}

/// An in-process bus segment.
///
/// Every tap sees every frame sent by the other taps, like stations on a
/// wire. A station does not hear its own transmissions; local echo is the
/// dispatcher's business.
#[derive(Clone)]
pub struct VirtualSegment {
    ifindex: u32,
    sender: broadcast::Sender<(u64, FrameEvent)>,
    next_node: Arc<AtomicU64>,
}

impl VirtualSegment {
    pub fn new(ifindex: u32) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            ifindex,
            sender,
            next_node: Arc::new(AtomicU64::new(1)),
        }
    }

    #[inline]
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Attach a new station to the segment.
    pub fn tap(&self) -> VirtualBus {
        VirtualBus {
            node: self.next_node.fetch_add(1, Ordering::Relaxed),
            sender: self.sender.clone(),
            receiver: AsyncMutex::new(self.sender.subscribe()),
            filters: Mutex::new((Vec::new(), 0)),
        }
    }

    /// Inject a frame that belongs to no station, e.g. scripted bus traffic.
    pub fn inject(&self, frame: Frame) {
        let _ = self.sender.send((
            0,
            FrameEvent {
                frame,
                timestamp: SystemTime::now(),
                error: false,
            },
        ));
    }
}

pub struct VirtualBus {
    node: u64,
    sender: broadcast::Sender<(u64, FrameEvent)>,
    receiver: AsyncMutex<broadcast::Receiver<(u64, FrameEvent)>>,
    filters: Mutex<(Vec<CanFilter>, u32)>,
}

impl VirtualBus {
    fn send(&self, frame: &Frame) -> io::Result<usize> {
        let _ = self.sender.send((
            self.node,
            FrameEvent {
                frame: *frame,
                timestamp: SystemTime::now(),
                error: false,
            },
        ));

        Ok(frame.len())
    }

    async fn recv(&self) -> io::Result<FrameEvent> {
        let mut receiver = self.receiver.lock().await;

        loop {
            match receiver.recv().await {
                Ok((node, _)) if node == self.node => continue,
                Ok((_, event)) => {
                    let (filters, err_mask) = &*self.filters.lock().unwrap();
                    if event.error {
                        if *err_mask == 0 {
                            continue;
                        }
                    } else if !matches_any(filters, event.frame.id()) {
                        continue;
                    }

                    return Ok(event);
                }
                // A slow reader skips the overwritten backlog, like a
                // controller dropping frames on a full receive buffer.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "bus segment gone",
                    ))
                }
            }
        }
    }

    fn set_filters(&self, filters: &[CanFilter], err_mask: u32) {
        *self.filters.lock().unwrap() = (filters.to_vec(), err_mask);
    }
}
