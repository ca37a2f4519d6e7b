//! The control network: per-interface frame dispatch, endpoints and
//! network management.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::SystemTime,
};

use tokio::sync::{broadcast, mpsc};

use isobus::{
    match_count, CanFilter, Frame, Name, GLOBAL_ADDRESS, NULL_ADDRESS, PDU_MAX_LENGTH, PGN,
};

use crate::{
    bus::{Bus, FrameEvent, VirtualSegment},
    can::{CanSocket, SockAddrCAN},
    iface::{self, LinkEvent, LinkMonitor},
    Error, Result,
};

mod claim;
mod endpoint;

pub use claim::ClaimState;
pub use endpoint::{Endpoint, EndpointHandle};

use endpoint::{EndpointShared, Fault};

/// Endpoint receive queue depth. The dispatcher drops at the tail and flags
/// the endpoint when the user falls this far behind.
const INBOX_DEPTH: usize = 256;

/// A received ISOBUS message with its delivery metadata.
#[derive(Clone, Debug)]
pub struct Message {
    /// Parameter group number.
    pub pgn: u32,
    /// Destination address; the global address for broadcasts.
    pub daddr: u8,
    /// Source address.
    pub saddr: u8,
    /// Priority.
    pub priority: u8,
    /// Receive time.
    pub timestamp: SystemTime,
    /// Error frame; `pgn` carries the raw error class bits instead.
    pub error: bool,
    data: [u8; PDU_MAX_LENGTH],
    dlen: usize,
}

impl Message {
    fn from_event(event: &FrameEvent) -> Self {
        let id = event.frame.id();

        let mut data = [0u8; PDU_MAX_LENGTH];
        data[..event.frame.len()].copy_from_slice(event.frame.pdu());

        Self {
            pgn: if event.error {
                id.as_raw()
            } else {
                id.pgn_raw()
            },
            daddr: id.destination_address().unwrap_or(GLOBAL_ADDRESS),
            saddr: id.source_address(),
            priority: id.priority(),
            timestamp: event.timestamp,
            error: event.error,
            data,
            dlen: event.frame.len(),
        }
    }

    /// Message payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlen]
    }
}

pub(crate) struct NetworkShared {
    bus: Bus,
    ifindex: u32,
    interface: String,
    endpoints: Mutex<Vec<Arc<EndpointShared>>>,
    next_endpoint: AtomicU64,
    loop_sender: mpsc::UnboundedSender<(FrameEvent, u64)>,
    fault: Mutex<Option<Fault>>,
}

impl NetworkShared {
    /// Transmit a frame on behalf of an endpoint.
    ///
    /// When the origin endpoint has loopback enabled the frame is also fed
    /// back through the dispatcher, where the other endpoints (and the
    /// origin itself, if it asked for own messages) pick it up.
    pub(crate) async fn transmit(&self, origin: u64, frame: Frame) -> Result<()> {
        self.bus.send(&frame).await?;

        let loopback = self
            .endpoint_by_id(origin)
            .map(|ep| ep.state.lock().unwrap().loopback)
            .unwrap_or(false);

        if loopback {
            let event = FrameEvent {
                frame,
                timestamp: SystemTime::now(),
                error: false,
            };
            let _ = self.loop_sender.send((event, origin));
        }

        Ok(())
    }

    fn endpoint_by_id(&self, id: u64) -> Option<Arc<EndpointShared>> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .find(|ep| ep.id == id)
            .cloned()
    }

    pub(crate) fn remove_endpoint(&self, id: u64) {
        self.endpoints.lock().unwrap().retain(|ep| ep.id != id);
        let _ = self.refresh_filters();
    }

    pub(crate) fn fault(&self) -> Option<Fault> {
        *self.fault.lock().unwrap()
    }

    /// Reprogram the driver with the union of every bound endpoint's
    /// filters, plus the fixed network management registrations.
    ///
    /// The driver swaps the whole list in one call, so either the new set is
    /// active or the previous one is untouched.
    pub(crate) fn refresh_filters(&self) -> Result<()> {
        let endpoints = self.endpoints.lock().unwrap().clone();

        let mut filters = Vec::new();
        let mut err_mask = 0;
        for endpoint in endpoints {
            let state = endpoint.state.lock().unwrap();
            if !state.bound {
                continue;
            }

            filters.extend_from_slice(&state.can_filters);
            filters.push(CanFilter::address_claimed());
            filters.push(CanFilter::request());
            err_mask |= state.err_mask;
        }

        self.bus.set_filters(&filters, err_mask)?;

        Ok(())
    }

    /// Route one frame to the network management handlers and the endpoint
    /// inboxes. Frames to transmit in response are collected in `out`.
    fn dispatch(&self, event: &FrameEvent, origin: Option<u64>, out: &mut Vec<(u64, Frame)>) {
        let endpoints = self.endpoints.lock().unwrap().clone();

        if event.error {
            for endpoint in endpoints {
                let mut state = endpoint.state.lock().unwrap();
                if !state.bound || state.err_mask & event.frame.id().as_raw() == 0 {
                    continue;
                }

                if endpoint.inbox.try_send(Message::from_event(event)).is_err() {
                    state.overflow = true;
                    endpoint.notify.notify_waiters();
                }
            }
            return;
        }

        let id = event.frame.id();
        if !id.is_valid() {
            log::debug!("{}: unsupported group number {}", self.interface, id);
            return;
        }

        let pgn = id.pgn();

        for endpoint in endpoints {
            let mut state = endpoint.state.lock().unwrap();
            if !state.bound {
                continue;
            }

            // Network management first, so that a claim transition is
            // visible before any queued user traffic is acted upon.
            if pgn == PGN::AddressClaimed && id.pdu_specific() == GLOBAL_ADDRESS {
                if origin != Some(endpoint.id) {
                    claim::handle_address_claimed(&endpoint, &mut state, &event.frame, out);
                }
            } else if pgn == PGN::Request {
                // Our own looped-back request is not a foreign station.
                if !(origin == Some(endpoint.id) && state.claim == ClaimState::WaitAddr) {
                    claim::handle_request(&endpoint, &mut state, &event.frame, out);
                }
            }

            if origin == Some(endpoint.id) && !state.recv_own {
                continue;
            }

            // One copy per matching filter; overlapping filters deliver
            // duplicates.
            for _ in 0..match_count(&state.can_filters, id) {
                if endpoint.inbox.try_send(Message::from_event(event)).is_err() {
                    state.overflow = true;
                    endpoint.notify.notify_waiters();
                    break;
                }
            }
        }
    }

    fn post_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Up(index) if index == self.ifindex => {
                log::info!("{}: link up", self.interface);
            }
            LinkEvent::Down(index) if index == self.ifindex => {
                log::warn!("{}: link down", self.interface);

                for endpoint in self.endpoints.lock().unwrap().iter() {
                    let mut state = endpoint.state.lock().unwrap();
                    state.fault = Some(Fault::NetworkDown);
                    endpoint.notify.notify_waiters();
                }
            }
            LinkEvent::Unregister(index) if index == self.ifindex => {
                log::warn!("{}: device unregistered", self.interface);

                *self.fault.lock().unwrap() = Some(Fault::NoDevice);

                for endpoint in self.endpoints.lock().unwrap().iter() {
                    let mut state = endpoint.state.lock().unwrap();
                    state.fault = Some(Fault::NoDevice);
                    state.bound = false;
                    state.claim = ClaimState::Idle;
                    state.address = NULL_ADDRESS;
                    endpoint.notify.notify_waiters();
                }

                let _ = self.refresh_filters();
            }
            _ => {}
        }
    }
}

/// A control network bound to one CAN interface.
///
/// Endpoints are opened against the network; a single dispatcher task
/// ([`Network::run`]) moves frames between the bus and the endpoints.
pub struct Network {
    shared: Arc<NetworkShared>,
    loop_receiver: Mutex<Option<mpsc::UnboundedReceiver<(FrameEvent, u64)>>>,
    link_receiver: Mutex<Option<broadcast::Receiver<LinkEvent>>>,
}

impl Network {
    fn new(
        bus: Bus,
        ifindex: u32,
        interface: &str,
        link_receiver: Option<broadcast::Receiver<LinkEvent>>,
    ) -> Self {
        let (loop_sender, loop_receiver) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(NetworkShared {
                bus,
                ifindex,
                interface: interface.to_owned(),
                endpoints: Mutex::new(Vec::new()),
                next_endpoint: AtomicU64::new(1),
                loop_sender,
                fault: Mutex::new(None),
            }),
            loop_receiver: Mutex::new(Some(loop_receiver)),
            link_receiver: Mutex::new(link_receiver),
        }
    }

    /// Bind to a CAN interface.
    ///
    /// The interface must exist, be of CAN type and be up.
    pub fn bind(interface: &str, monitor: &LinkMonitor) -> Result<Self> {
        let index = iface::index(interface).map_err(|_| Error::NoDevice)?;
        if !iface::is_can(interface).map_err(|_| Error::NoDevice)? {
            return Err(Error::NoDevice);
        }
        if !iface::is_up(interface).map_err(|_| Error::NoDevice)? {
            return Err(Error::NoDevice);
        }

        let socket = CanSocket::bind(&SockAddrCAN::new(index))?;
        let link_receiver = monitor.subscribe(interface, index);

        Ok(Self::new(
            Bus::Socket(socket),
            index,
            interface,
            Some(link_receiver),
        ))
    }

    /// Attach to an in-process bus segment.
    pub fn bind_virtual(segment: &VirtualSegment) -> Self {
        Self::new(
            Bus::Virtual(segment.tap()),
            segment.ifindex(),
            "vcan",
            None,
        )
    }

    #[inline]
    pub fn interface(&self) -> &str {
        &self.shared.interface
    }

    #[inline]
    pub fn ifindex(&self) -> u32 {
        self.shared.ifindex
    }

    /// Open an endpoint on this network.
    ///
    /// The endpoint starts idle with loopback on, own-message reception off
    /// and a single filter matching everything.
    pub fn open(&self, name: Name) -> Endpoint {
        let id = self.shared.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (inbox_sender, inbox_receiver) = mpsc::channel(INBOX_DEPTH);

        let shared = Arc::new(EndpointShared::new(
            id,
            Arc::downgrade(&self.shared),
            name,
            inbox_sender,
        ));

        self.shared.endpoints.lock().unwrap().push(shared.clone());

        Endpoint::new(shared, inbox_receiver)
    }

    /// Drive the network.
    ///
    /// Receives from the bus, dispatches to endpoints, feeds looped-back
    /// transmissions through the same path and reacts to link events. Runs
    /// until the device goes away or the dispatcher is cancelled.
    pub async fn run(&self) -> Result<()> {
        let mut loop_receiver = self
            .loop_receiver
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::InvalidArgument)?;
        let mut link_receiver = self.link_receiver.lock().unwrap().take();

        let mut out: Vec<(u64, Frame)> = Vec::new();

        loop {
            out.clear();

            tokio::select! {
                result = self.shared.bus.recv() => match result {
                    Ok(event) => self.shared.dispatch(&event, None, &mut out),
                    Err(e) => {
                        if self.shared.fault() == Some(Fault::NoDevice) {
                            return Ok(());
                        }
                        log::error!("{}: receive: {}", self.shared.interface, e);
                        continue;
                    }
                },
                Some((event, origin)) = loop_receiver.recv() => {
                    self.shared.dispatch(&event, Some(origin), &mut out);
                }
                result = recv_link(&mut link_receiver) => {
                    if let Some(event) = result {
                        self.shared.post_link_event(event);
                    }
                    continue;
                }
            }

            for (origin, frame) in out.drain(..) {
                if let Err(e) = self.shared.transmit(origin, frame).await {
                    log::error!("{}: transmit: {}", self.shared.interface, e);
                }
            }
        }
    }
}

async fn recv_link(receiver: &mut Option<broadcast::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match receiver {
        Some(receiver) => match receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => None,
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        },
        None => {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }
}
