//! The address claim procedure.
//!
//! Binding an endpoint sends a request for address claimed, listens for the
//! claims of other stations, then claims the preferred address or the
//! lowest free self-configurable one. Contention is settled by NAME: the
//! lower NAME keeps the address, the other station re-arbitrates or gives
//! up.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use isobus::{
    protocol, Frame, Name, ANY_ADDRESS, GLOBAL_ADDRESS, MAX_SC_ADDRESS, MIN_SC_ADDRESS,
    NULL_ADDRESS,
};

use crate::{Error, Result};

use super::endpoint::{EndpointShared, EndpointState};
use super::NetworkShared;

/// Address claim phase of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimState {
    /// Not bound.
    Idle,
    /// Waiting for other stations to defend the preferred address.
    WaitAddr,
    /// Claim sent, waiting out the contention window.
    WaitHaveAddr,
    /// Address held.
    HaveAddr,
    /// No address could be claimed.
    Lost,
}

/// Both claim timers, per ISO 11783-5.
const CLAIM_TIMEOUT: Duration = Duration::from_millis(250);

/// Random transmit delay added to the first claim timer so that stations
/// powering up together do not answer in lockstep: a random byte times
/// 600 ns, at most 153 us.
fn claim_jitter() -> Duration {
    Duration::from_nanos(u64::from(rand::random::<u8>()) * 600)
}

/// Run the claim procedure for a freshly bound endpoint.
pub(crate) async fn claim_address(
    endpoint: &Arc<EndpointShared>,
    net: &Arc<NetworkShared>,
) -> Result<u8> {
    let preferred = {
        let mut state = endpoint.state.lock().unwrap();
        state.claim = ClaimState::WaitAddr;
        state.address = NULL_ADDRESS;
        state.pref_avail = true;
        state.sc_free = [true; super::endpoint::SC_SPAN];
        state.preferred
    };

    net.transmit(endpoint.id, protocol::request_for_address_claimed(preferred))
        .await?;
    log::debug!("request for address claimed sent");

    wait_claim(endpoint, Instant::now() + CLAIM_TIMEOUT + claim_jitter(), |s| {
        s.claim != ClaimState::WaitAddr
    })
    .await;

    let (address, name) = {
        let mut state = endpoint.state.lock().unwrap();
        if state.claim == ClaimState::Lost {
            return Err(Error::AddressInUse);
        }

        let mut address = NULL_ADDRESS;
        if state.preferred != ANY_ADDRESS && state.pref_avail {
            address = state.preferred;
        } else if state.name.self_configurable() {
            address = avail_sc_addr(&state.sc_free);
        }

        if address != NULL_ADDRESS {
            state.address = address;
            state.claim = ClaimState::WaitHaveAddr;
        }

        (address, state.name)
    };

    if address == NULL_ADDRESS {
        return lose(endpoint, net).await;
    }

    net.transmit(endpoint.id, protocol::address_claimed(address, name))
        .await?;
    log::debug!("address claimed sent for 0x{:X}", address);

    wait_claim(endpoint, Instant::now() + CLAIM_TIMEOUT, |s| {
        s.claim != ClaimState::WaitHaveAddr
    })
    .await;

    {
        let mut state = endpoint.state.lock().unwrap();
        if state.claim == ClaimState::Lost {
            // The contention handler already announced the loss.
            return Err(Error::AddressInUse);
        }

        state.claim = ClaimState::HaveAddr;
    }
    endpoint.notify.notify_waiters();

    log::debug!("ready to use address 0x{:X}", address);

    Ok(address)
}

/// Give up: announce cannot claim and park the endpoint.
async fn lose(endpoint: &Arc<EndpointShared>, net: &Arc<NetworkShared>) -> Result<u8> {
    let name = {
        let mut state = endpoint.state.lock().unwrap();
        state.address = NULL_ADDRESS;
        state.claim = ClaimState::Lost;
        state.name
    };
    endpoint.notify.notify_waiters();

    net.transmit(endpoint.id, protocol::cannot_claim_address(name))
        .await?;
    log::debug!("cannot claim address sent");

    Err(Error::AddressInUse)
}

/// Wait until the claim state satisfies `done` or the deadline passes.
async fn wait_claim<F>(endpoint: &EndpointShared, deadline: Instant, done: F)
where
    F: Fn(&EndpointState) -> bool,
{
    loop {
        let notified = endpoint.notify.notified();
        tokio::pin!(notified);

        if done(&endpoint.state.lock().unwrap()) {
            return;
        }

        let now = Instant::now();
        if now >= deadline {
            return;
        }

        let _ = tokio::time::timeout(deadline - now, &mut notified).await;
    }
}

/// Lowest free address in the self-configurable range.
fn avail_sc_addr(sc_free: &[bool]) -> u8 {
    for (i, free) in sc_free.iter().enumerate() {
        if *free {
            return MIN_SC_ADDRESS + i as u8;
        }
    }

    NULL_ADDRESS
}

/// Process an inbound address claimed broadcast.
///
/// Records occupied self-configurable addresses, defends or surrenders our
/// own address, and resolves the preferred address while we wait to claim
/// it. Frames to transmit in response are pushed onto `out`.
pub(crate) fn handle_address_claimed(
    endpoint: &EndpointShared,
    state: &mut EndpointState,
    frame: &Frame,
    out: &mut Vec<(u64, Frame)>,
) {
    if frame.len() != 8 {
        return;
    }

    let sa = frame.id().source_address();
    let theirs = Name::from_bytes(frame.pdu().try_into().unwrap());

    if (MIN_SC_ADDRESS..=MAX_SC_ADDRESS).contains(&sa) {
        state.sc_free[(sa - MIN_SC_ADDRESS) as usize] = false;
    }

    // A claim for the address we hold (or just claimed): the lower NAME
    // keeps it. On a tie we defend; two stations sharing a NAME is a
    // configuration fault.
    if matches!(state.claim, ClaimState::WaitHaveAddr | ClaimState::HaveAddr)
        && sa == state.address
    {
        if state.name <= theirs {
            out.push((endpoint.id, protocol::address_claimed(state.address, state.name)));
        } else {
            surrender(endpoint, state, out);
            return;
        }
    }

    if state.claim == ClaimState::WaitAddr && sa == state.preferred {
        if state.name < theirs {
            // We outrank the claimant; stop waiting and take the address.
            state.claim = ClaimState::WaitHaveAddr;
            endpoint.notify.notify_waiters();
        } else {
            state.pref_avail = false;
            if !state.name.self_configurable() {
                surrender(endpoint, state, out);
            }
        }
    }
}

fn surrender(endpoint: &EndpointShared, state: &mut EndpointState, out: &mut Vec<(u64, Frame)>) {
    state.address = NULL_ADDRESS;
    state.claim = ClaimState::Lost;
    out.push((endpoint.id, protocol::cannot_claim_address(state.name)));
    endpoint.notify.notify_waiters();
}

/// Process an inbound request while holding an address.
///
/// Requests for address claimed directed at us or at everyone are answered
/// with our claim; other requests are the business of the user filters.
pub(crate) fn handle_request(
    endpoint: &EndpointShared,
    state: &mut EndpointState,
    frame: &Frame,
    out: &mut Vec<(u64, Frame)>,
) {
    if !protocol::is_request_for_address_claimed(frame) {
        return;
    }

    let ps = frame.id().pdu_specific();
    if state.claim == ClaimState::HaveAddr && (ps == state.address || ps == GLOBAL_ADDRESS) {
        out.push((endpoint.id, protocol::address_claimed(state.address, state.name)));
    }
}
