use std::{
    sync::{Mutex, Weak},
    time::Duration,
};

use tokio::sync::{mpsc, Notify};

use isobus::{
    CanFilter, Filter, FrameBuilder, IdBuilder, Name, GLOBAL_ADDRESS, MAX_SC_ADDRESS,
    MIN_SC_ADDRESS, NULL_ADDRESS, PDU_MAX_LENGTH, PGN,
};

use crate::{Error, Result};

use super::{
    claim::{self, ClaimState},
    Message, NetworkShared,
};

pub(crate) const SC_SPAN: usize = (MAX_SC_ADDRESS - MIN_SC_ADDRESS) as usize + 1;

/// Asynchronous endpoint error, observed by the next blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fault {
    NoDevice,
    NetworkDown,
}

impl From<Fault> for Error {
    fn from(value: Fault) -> Self {
        match value {
            Fault::NoDevice => Error::NoDevice,
            Fault::NetworkDown => Error::NetworkDown,
        }
    }
}

pub(crate) struct EndpointState {
    pub bound: bool,
    pub claim: ClaimState,
    pub name: Name,
    pub preferred: u8,
    /// Claimed (or tentatively claimed) address; null otherwise.
    pub address: u8,
    pub pref_avail: bool,
    /// Free addresses in the self-configurable range.
    pub sc_free: [bool; SC_SPAN],
    pub filters: Vec<Filter>,
    pub can_filters: Vec<CanFilter>,
    pub loopback: bool,
    pub recv_own: bool,
    pub priority: u8,
    pub err_mask: u32,
    pub overflow: bool,
    pub fault: Option<Fault>,
    pub released: bool,
}

pub(crate) struct EndpointShared {
    pub id: u64,
    pub net: Weak<NetworkShared>,
    pub state: Mutex<EndpointState>,
    pub notify: Notify,
    pub inbox: mpsc::Sender<Message>,
}

impl EndpointShared {
    pub(crate) fn new(
        id: u64,
        net: Weak<NetworkShared>,
        name: Name,
        inbox: mpsc::Sender<Message>,
    ) -> Self {
        let default_filter = Filter::accept_all();
        let can_filters = match default_filter.to_can_filter() {
            Ok(filter) => vec![filter],
            Err(_) => Vec::new(),
        };

        Self {
            id,
            net,
            state: Mutex::new(EndpointState {
                bound: false,
                claim: ClaimState::Idle,
                name,
                preferred: NULL_ADDRESS,
                address: NULL_ADDRESS,
                pref_avail: false,
                sc_free: [true; SC_SPAN],
                can_filters,
                filters: vec![default_filter],
                loopback: true,
                recv_own: false,
                priority: isobus::DEFAULT_PRIORITY,
                err_mask: 0,
                overflow: false,
                fault: None,
                released: false,
            }),
            notify: Notify::new(),
            inbox,
        }
    }
}

/// Shareable half of an endpoint: everything except receiving.
///
/// Handles are cheap to clone and can set options and transmit from any
/// task while another owns the receive side.
#[derive(Clone)]
pub struct EndpointHandle {
    pub(crate) shared: std::sync::Arc<EndpointShared>,
}

impl EndpointHandle {
    fn net(&self) -> Result<std::sync::Arc<NetworkShared>> {
        self.shared.net.upgrade().ok_or(Error::NoDevice)
    }

    /// Current claim state.
    pub fn claim_state(&self) -> ClaimState {
        self.shared.state.lock().unwrap().claim
    }

    /// The claimed address, when one is held.
    pub fn address(&self) -> Option<u8> {
        let state = self.shared.state.lock().unwrap();
        (state.claim == ClaimState::HaveAddr).then_some(state.address)
    }

    /// Station NAME of the endpoint.
    pub fn name(&self) -> Name {
        self.shared.state.lock().unwrap().name
    }

    /// Replace the filter list.
    ///
    /// The new list is installed before the old one is dropped; when
    /// installation fails the previous list stays in effect.
    pub fn set_filters(&self, filters: Vec<Filter>) -> Result<()> {
        let mut can_filters = Vec::with_capacity(filters.len());
        for filter in &filters {
            can_filters.push(filter.to_can_filter()?);
        }

        let (old_filters, old_can, bound) = {
            let mut state = self.shared.state.lock().unwrap();
            let old_filters = std::mem::replace(&mut state.filters, filters);
            let old_can = std::mem::replace(&mut state.can_filters, can_filters);
            (old_filters, old_can, state.bound)
        };

        if !bound {
            return Ok(());
        }

        if let Err(e) = self.net()?.refresh_filters() {
            let mut state = self.shared.state.lock().unwrap();
            state.filters = old_filters;
            state.can_filters = old_can;
            drop(state);

            if let Ok(net) = self.net() {
                let _ = net.refresh_filters();
            }
            return Err(e);
        }

        Ok(())
    }

    /// Installed filter list.
    pub fn filters(&self) -> Vec<Filter> {
        self.shared.state.lock().unwrap().filters.clone()
    }

    /// Local loopback of own transmissions (default: on).
    pub fn set_loopback(&self, on: bool) {
        self.shared.state.lock().unwrap().loopback = on;
    }

    /// Reception of own looped-back messages (default: off).
    pub fn set_recv_own_msgs(&self, on: bool) {
        self.shared.state.lock().unwrap().recv_own = on;
    }

    /// Default send priority, 0 (highest) to 7 (lowest).
    pub fn set_priority(&self, priority: u8) -> Result<()> {
        if priority > 7 {
            return Err(Error::InvalidArgument);
        }
        self.shared.state.lock().unwrap().priority = priority;
        Ok(())
    }

    /// Error frame subscription mask; zero disables delivery.
    pub fn set_err_mask(&self, mask: u32) -> Result<()> {
        let bound = {
            let mut state = self.shared.state.lock().unwrap();
            state.err_mask = mask;
            state.bound
        };

        if bound {
            self.net()?.refresh_filters()?;
        }

        Ok(())
    }

    /// Send a broadcast message.
    ///
    /// The group number must be PDU2; directed groups need [`Self::send_to`].
    pub async fn send(&self, pgn: u32, data: &[u8]) -> Result<usize> {
        self.transmit(pgn, data, None).await
    }

    /// Send a message to a station.
    ///
    /// PDU2 group numbers only accept the global address as destination.
    pub async fn send_to(&self, pgn: u32, data: &[u8], dest: u8) -> Result<usize> {
        self.transmit(pgn, data, Some(dest)).await
    }

    async fn transmit(&self, pgn: u32, data: &[u8], dest: Option<u8>) -> Result<usize> {
        if data.len() > PDU_MAX_LENGTH || pgn & !isobus::PGN_MASK != 0 {
            return Err(Error::InvalidArgument);
        }
        // EDP set: not an ISO 11783 group number.
        if pgn & 0x2_0000 != 0 {
            return Err(Error::InvalidPgn);
        }

        let pdu1 = (pgn >> 8) & 0xff < 0xf0;
        let da = match (pdu1, dest) {
            (true, Some(da)) => da,
            (true, None) => return Err(Error::InvalidArgument),
            (false, None) | (false, Some(GLOBAL_ADDRESS)) => GLOBAL_ADDRESS,
            (false, Some(_)) => return Err(Error::InvalidArgument),
        };

        let (priority, source) = {
            let state = self.shared.state.lock().unwrap();
            if state.claim != ClaimState::HaveAddr {
                return Err(Error::AddressInUse);
            }
            (state.priority, state.address)
        };

        let frame = FrameBuilder::new(
            IdBuilder::from_pgn(PGN::from(pgn))
                .priority(priority)
                .da(da)
                .sa(source)
                .build(),
        )
        .copy_from_slice(data)
        .build();

        self.net()?.transmit(self.shared.id, frame).await?;

        Ok(data.len())
    }
}

/// An ISOBUS endpoint.
///
/// Opened in idle state from [`super::Network::open`]; [`Endpoint::bind`]
/// claims an address on the network, after which messages flow in both
/// directions. Dropping the endpoint withdraws its filters.
pub struct Endpoint {
    handle: EndpointHandle,
    inbox: mpsc::Receiver<Message>,
}

impl Endpoint {
    pub(crate) fn new(
        shared: std::sync::Arc<EndpointShared>,
        inbox: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            handle: EndpointHandle { shared },
            inbox,
        }
    }

    /// A shareable handle for sending and option changes.
    pub fn handle(&self) -> EndpointHandle {
        self.handle.clone()
    }

    /// Claim an address and start receiving.
    ///
    /// `preferred` is the address to claim, or [`isobus::ANY_ADDRESS`] to
    /// take any free self-configurable address. Blocks for the duration of
    /// the claim procedure, roughly half a second. Returns the claimed
    /// address.
    pub async fn bind(&mut self, preferred: u8) -> Result<u8> {
        if preferred == NULL_ADDRESS {
            return Err(Error::InvalidArgument);
        }

        let shared = &self.handle.shared;
        let net = shared.net.upgrade().ok_or(Error::NoDevice)?;
        if let Some(fault) = net.fault() {
            return Err(fault.into());
        }

        {
            let mut state = shared.state.lock().unwrap();
            if state.released {
                return Err(Error::Cancelled);
            }
            if state.bound {
                return Err(Error::InvalidArgument);
            }
            state.bound = true;
            state.preferred = preferred;
            state.fault = None;
        }

        if let Err(e) = net.refresh_filters() {
            shared.state.lock().unwrap().bound = false;
            return Err(e);
        }

        claim::claim_address(shared, &net).await
    }

    /// Receive the next message.
    ///
    /// Blocks until a message is queued. Asynchronous endpoint errors
    /// (device gone, link down, queue overflow, lost address) surface here
    /// before any queued data.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            {
                let mut state = self.handle.shared.state.lock().unwrap();
                if let Some(fault) = state.fault.take() {
                    return Err(fault.into());
                }
                if state.overflow {
                    state.overflow = false;
                    return Err(Error::Overflow);
                }
                if state.claim == ClaimState::Lost {
                    return Err(Error::AddressInUse);
                }
            }

            let notified = self.handle.shared.notify.notified();
            tokio::pin!(notified);

            tokio::select! {
                message = self.inbox.recv() => {
                    return message.ok_or(Error::Cancelled);
                }
                _ = &mut notified => continue,
            }
        }
    }

    /// Receive the next message, waiting at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Message> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| Error::WouldBlock)?
    }

    /// Give up the address and return to idle.
    ///
    /// Filters are withdrawn from the driver and queued messages dropped.
    /// The endpoint can be bound again afterwards.
    pub fn release(&mut self) {
        {
            let mut state = self.handle.shared.state.lock().unwrap();
            state.bound = false;
            state.claim = ClaimState::Idle;
            state.address = NULL_ADDRESS;
            state.preferred = NULL_ADDRESS;
            state.fault = None;
            state.overflow = false;
        }

        if let Some(net) = self.handle.shared.net.upgrade() {
            let _ = net.refresh_filters();
        }

        while self.inbox.try_recv().is_ok() {}
    }

    pub fn claim_state(&self) -> ClaimState {
        self.handle.claim_state()
    }

    pub fn address(&self) -> Option<u8> {
        self.handle.address()
    }

    pub fn name(&self) -> Name {
        self.handle.name()
    }

    pub fn set_filters(&self, filters: Vec<Filter>) -> Result<()> {
        self.handle.set_filters(filters)
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.handle.filters()
    }

    pub fn set_loopback(&self, on: bool) {
        self.handle.set_loopback(on)
    }

    pub fn set_recv_own_msgs(&self, on: bool) {
        self.handle.set_recv_own_msgs(on)
    }

    pub fn set_priority(&self, priority: u8) -> Result<()> {
        self.handle.set_priority(priority)
    }

    pub fn set_err_mask(&self, mask: u32) -> Result<()> {
        self.handle.set_err_mask(mask)
    }

    pub async fn send(&self, pgn: u32, data: &[u8]) -> Result<usize> {
        self.handle.send(pgn, data).await
    }

    pub async fn send_to(&self, pgn: u32, data: &[u8], dest: u8) -> Result<usize> {
        self.handle.send_to(pgn, data, dest).await
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.handle.shared.state.lock().unwrap().released = true;

        if let Some(net) = self.handle.shared.net.upgrade() {
            net.remove_endpoint(self.handle.shared.id);
        }
    }
}
