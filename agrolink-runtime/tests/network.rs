//! Network behavior against an in-process bus segment.
//!
//! Time is paused: the claim timers run on the virtual clock, so these
//! tests complete immediately while still exercising the real timing
//! paths.

use std::{sync::Arc, time::Duration};

use agrolink::{
    bus::{Bus, VirtualSegment},
    net::{ClaimState, Endpoint, Network},
    Error,
};
use agrolink::isobus::{protocol, Filter, Name, NameBuilder, ANY_ADDRESS, NULL_ADDRESS};

const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

fn sc_name(identity: u32) -> Name {
    NameBuilder::default()
        .self_configurable(true)
        .identity_number(identity)
        .manufacturer_code(0x122)
        .function(0x1D)
        .build()
}

fn fixed_name(identity: u32) -> Name {
    NameBuilder::default()
        .identity_number(identity)
        .manufacturer_code(0x122)
        .function(0x1D)
        .build()
}

fn station(segment: &VirtualSegment, name: Name) -> (Arc<Network>, Endpoint) {
    let network = Arc::new(Network::bind_virtual(segment));
    let endpoint = network.open(name);

    {
        let network = network.clone();
        tokio::spawn(async move { network.run().await });
    }

    (network, endpoint)
}

/// A raw observer on the segment, seeing every frame.
fn observer(segment: &VirtualSegment) -> Bus {
    let bus = Bus::Virtual(segment.tap());
    bus.set_filters(&[Filter::accept_all().to_can_filter().unwrap()], 0)
        .unwrap();
    bus
}

async fn next_frame(bus: &Bus) -> isobus::Frame {
    tokio::time::timeout(Duration::from_secs(1), bus.recv())
        .await
        .unwrap()
        .unwrap()
        .frame
}

async fn drain(endpoint: &mut Endpoint) {
    while endpoint.recv_timeout(PROBE_TIMEOUT).await.is_ok() {}
}

#[tokio::test(start_paused = true)]
async fn claim_preferred_address() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));

    let address = endpoint.bind(0x80).await.unwrap();

    assert_eq!(address, 0x80);
    assert_eq!(endpoint.claim_state(), ClaimState::HaveAddr);
    assert_eq!(endpoint.address(), Some(0x80));
}

#[tokio::test(start_paused = true)]
async fn second_station_moves_to_next_address() {
    let segment = VirtualSegment::new(1);
    let (_net_a, mut a) = station(&segment, sc_name(1));
    let (_net_b, mut b) = station(&segment, sc_name(2));

    assert_eq!(a.bind(0x80).await.unwrap(), 0x80);

    // Same preference, higher NAME: the search lands on the next
    // self-configurable address.
    assert_eq!(b.bind(0x80).await.unwrap(), 0x81);

    assert_eq!(a.address(), Some(0x80));
    assert_eq!(b.address(), Some(0x81));
}

#[tokio::test(start_paused = true)]
async fn fixed_address_station_loses() {
    // Both stations carry fixed addresses; the later, higher NAME cannot
    // take the address and cannot fall back either.
    let segment = VirtualSegment::new(1);
    let (_net_a, mut a) = station(&segment, fixed_name(1));
    let (_net_b, mut b) = station(&segment, fixed_name(2));

    a.bind(0x80).await.unwrap();

    match b.bind(0x80).await {
        Err(Error::AddressInUse) => {}
        other => panic!("expected AddressInUse, got {:?}", other.map(|_| ())),
    }
    assert_eq!(b.claim_state(), ClaimState::Lost);
    assert_eq!(b.address(), None);
}

#[tokio::test(start_paused = true)]
async fn contention_has_one_winner() {
    let segment = VirtualSegment::new(1);
    let (_net_a, mut a) = station(&segment, sc_name(1));
    let (_net_b, mut b) = station(&segment, sc_name(2));

    let (result_a, result_b) = tokio::join!(a.bind(0x90), b.bind(0x90));

    let winners = [&a, &b]
        .iter()
        .filter(|ep| ep.address() == Some(0x90))
        .count();
    assert_eq!(winners, 1);

    // The loser either moved to the self-configurable range or backed off.
    for (endpoint, result) in [(&a, &result_a), (&b, &result_b)] {
        match result {
            Ok(_) => assert!(endpoint.address().is_some()),
            Err(Error::AddressInUse) => assert_eq!(endpoint.claim_state(), ClaimState::Lost),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn any_address_goes_to_the_sc_range() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));

    assert_eq!(endpoint.bind(ANY_ADDRESS).await.unwrap(), 0x80);
}

#[tokio::test(start_paused = true)]
async fn any_address_without_sc_capability_fails() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, fixed_name(1));

    assert!(matches!(
        endpoint.bind(ANY_ADDRESS).await,
        Err(Error::AddressInUse)
    ));
}

#[tokio::test(start_paused = true)]
async fn null_preferred_is_rejected() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));

    assert!(matches!(
        endpoint.bind(NULL_ADDRESS).await,
        Err(Error::InvalidArgument)
    ));
}

#[tokio::test(start_paused = true)]
async fn station_defends_its_address() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));
    endpoint.bind(0x80).await.unwrap();

    let bus = observer(&segment);

    // A station with a higher NAME tries to take 0x80.
    segment.inject(protocol::address_claimed(0x80, sc_name(9)));

    // The observer sees the challenge first, then our defense.
    let _challenge = next_frame(&bus).await;
    let defense = next_frame(&bus).await;
    assert_eq!(defense.id().pgn_raw(), 60_928);
    assert_eq!(defense.id().source_address(), 0x80);
    assert_eq!(
        Name::from_bytes(defense.pdu().try_into().unwrap()),
        sc_name(1)
    );
    assert_eq!(endpoint.claim_state(), ClaimState::HaveAddr);
}

#[tokio::test(start_paused = true)]
async fn station_surrenders_to_a_lower_name() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(5));
    endpoint.bind(0x80).await.unwrap();

    let bus = observer(&segment);

    segment.inject(protocol::address_claimed(0x80, sc_name(1)));

    // The loss is announced from the null address.
    let _challenge = next_frame(&bus).await;
    let surrender = next_frame(&bus).await;
    assert_eq!(surrender.id().pgn_raw(), 60_928);
    assert_eq!(surrender.id().source_address(), NULL_ADDRESS);

    // Pending calls observe the lost address.
    assert!(matches!(endpoint.recv().await, Err(Error::AddressInUse)));
    assert!(matches!(
        endpoint.send(0xFF00, &[0]).await,
        Err(Error::AddressInUse)
    ));
}

#[tokio::test(start_paused = true)]
async fn station_answers_request_for_address_claimed() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));
    endpoint.bind(0x80).await.unwrap();

    let bus = observer(&segment);

    segment.inject(protocol::request_for_address_claimed(0x80));

    let _request = next_frame(&bus).await;
    let reply = next_frame(&bus).await;
    assert_eq!(reply.id().pgn_raw(), 60_928);
    assert_eq!(reply.id().source_address(), 0x80);
    assert_eq!(
        Name::from_bytes(reply.pdu().try_into().unwrap()),
        sc_name(1)
    );
}

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_other_station() {
    let segment = VirtualSegment::new(1);
    let (_net_a, a) = {
        let (net, mut a) = station(&segment, sc_name(1));
        a.bind(0x80).await.unwrap();
        (net, a)
    };
    let (_net_b, mut b) = station(&segment, sc_name(2));
    b.bind(0x81).await.unwrap();

    b.set_filters(vec![Filter::from_pgn(0xFEE6)]).unwrap();
    drain(&mut b).await;

    a.send(0xFEE6, &[1, 2, 3, 4]).await.unwrap();

    let message = b.recv_timeout(PROBE_TIMEOUT).await.unwrap();
    assert_eq!(message.pgn, 0xFEE6);
    assert_eq!(message.saddr, 0x80);
    assert_eq!(message.daddr, 255);
    assert_eq!(message.data(), &[1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn directed_message_carries_addresses() {
    let segment = VirtualSegment::new(1);
    let (_net_a, mut a) = station(&segment, sc_name(1));
    a.bind(0x80).await.unwrap();
    let (_net_b, mut b) = station(&segment, sc_name(2));
    b.bind(0x81).await.unwrap();

    b.set_filters(vec![Filter::from_pgn(0xEF00)]).unwrap();
    drain(&mut b).await;

    a.send_to(0xEF00, &[0xAA], 0x81).await.unwrap();

    let message = b.recv_timeout(PROBE_TIMEOUT).await.unwrap();
    assert_eq!(message.pgn, 0xEF00);
    assert_eq!(message.daddr, 0x81);
    assert_eq!(message.saddr, 0x80);
    assert_eq!(message.priority, 6);
}

#[tokio::test(start_paused = true)]
async fn send_argument_validation() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));
    endpoint.bind(0x80).await.unwrap();

    // PDU1 needs a destination.
    assert!(matches!(
        endpoint.send(0xEF00, &[0]).await,
        Err(Error::InvalidArgument)
    ));
    // PDU2 takes at most the global destination.
    assert!(matches!(
        endpoint.send_to(0xFEE6, &[0], 0x42).await,
        Err(Error::InvalidArgument)
    ));
    assert!(endpoint.send_to(0xFEE6, &[0], 255).await.is_ok());
    // Nine data bytes never fit a single frame.
    assert!(matches!(
        endpoint.send(0xFEE6, &[0; 9]).await,
        Err(Error::InvalidArgument)
    ));
    // Extended data page set: not ours.
    assert!(matches!(
        endpoint.send(0x2FF00, &[0]).await,
        Err(Error::InvalidPgn)
    ));
}

#[tokio::test(start_paused = true)]
async fn own_messages_suppressed_by_default() {
    let segment = VirtualSegment::new(1);
    let network = Arc::new(Network::bind_virtual(&segment));
    {
        let network = network.clone();
        tokio::spawn(async move { network.run().await });
    }

    let mut e = network.open(sc_name(1));
    e.bind(0x80).await.unwrap();
    e.set_filters(vec![Filter::from_pgn(0xFF00)]).unwrap();
    drain(&mut e).await;

    e.send(0xFF00, &[1]).await.unwrap();
    assert!(matches!(
        e.recv_timeout(PROBE_TIMEOUT).await,
        Err(Error::WouldBlock)
    ));

    e.set_recv_own_msgs(true);
    e.send(0xFF00, &[2]).await.unwrap();
    let message = e.recv_timeout(PROBE_TIMEOUT).await.unwrap();
    assert_eq!(message.data(), &[2]);
    assert!(matches!(
        e.recv_timeout(PROBE_TIMEOUT).await,
        Err(Error::WouldBlock)
    ));
}

#[tokio::test(start_paused = true)]
async fn loopback_off_silences_the_local_side() {
    let segment = VirtualSegment::new(1);
    let network = Arc::new(Network::bind_virtual(&segment));
    {
        let network = network.clone();
        tokio::spawn(async move { network.run().await });
    }

    let mut e = network.open(sc_name(1));
    e.bind(0x80).await.unwrap();
    let mut f = network.open(sc_name(2));
    f.bind(0x81).await.unwrap();

    f.set_filters(vec![Filter::from_pgn(0xFF00)]).unwrap();
    drain(&mut f).await;

    e.set_loopback(false);
    e.send(0xFF00, &[1]).await.unwrap();
    assert!(matches!(
        f.recv_timeout(PROBE_TIMEOUT).await,
        Err(Error::WouldBlock)
    ));

    e.set_loopback(true);
    e.send(0xFF00, &[2]).await.unwrap();
    assert_eq!(f.recv_timeout(PROBE_TIMEOUT).await.unwrap().data(), &[2]);
}

#[tokio::test(start_paused = true)]
async fn overlapping_filters_deliver_duplicates() {
    let segment = VirtualSegment::new(1);
    let (_net_a, mut a) = station(&segment, sc_name(1));
    a.bind(0x80).await.unwrap();
    let (_net_b, mut b) = station(&segment, sc_name(2));
    b.bind(0x81).await.unwrap();

    b.set_filters(vec![Filter::from_pgn(0xFF00), Filter::from_saddr(0x80)])
        .unwrap();
    drain(&mut b).await;

    a.send(0xFF00, &[7]).await.unwrap();

    assert_eq!(b.recv_timeout(PROBE_TIMEOUT).await.unwrap().data(), &[7]);
    assert_eq!(b.recv_timeout(PROBE_TIMEOUT).await.unwrap().data(), &[7]);
    assert!(matches!(
        b.recv_timeout(PROBE_TIMEOUT).await,
        Err(Error::WouldBlock)
    ));
}

#[tokio::test(start_paused = true)]
async fn pdu2_destination_filter_is_rejected() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));
    endpoint.bind(0x80).await.unwrap();

    let before = endpoint.filters();

    let bad = Filter {
        pgn: 0xFEE6,
        pgn_mask: isobus::PGN_MASK,
        daddr_mask: 0xFF,
        ..Filter::default()
    };
    assert!(matches!(
        endpoint.set_filters(vec![bad]),
        Err(Error::InvalidFilter)
    ));

    // The old list stays in effect.
    assert_eq!(endpoint.filters().len(), before.len());
}

#[tokio::test(start_paused = true)]
async fn inbox_overflow_is_reported_once() {
    let segment = VirtualSegment::new(1);
    let (_net_a, mut a) = station(&segment, sc_name(1));
    a.bind(0x80).await.unwrap();
    let (_net_b, mut b) = station(&segment, sc_name(2));
    b.bind(0x81).await.unwrap();

    b.set_filters(vec![Filter::from_pgn(0xFF00)]).unwrap();
    drain(&mut b).await;

    for i in 0..300u32 {
        a.send(0xFF00, &i.to_le_bytes()).await.unwrap();
        // Let the dispatchers keep pace with the sender.
        tokio::task::yield_now().await;
    }
    // Let both dispatchers settle before probing the queue.
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(b.recv().await, Err(Error::Overflow)));

    // The queue still drains in order after the overflow report.
    let first = b.recv_timeout(PROBE_TIMEOUT).await.unwrap();
    assert_eq!(first.data(), &0u32.to_le_bytes());
}

#[tokio::test(start_paused = true)]
async fn release_returns_to_idle_and_rebinds() {
    let segment = VirtualSegment::new(1);
    let (_net, mut endpoint) = station(&segment, sc_name(1));

    endpoint.bind(0x80).await.unwrap();
    endpoint.release();

    assert_eq!(endpoint.claim_state(), ClaimState::Idle);
    assert_eq!(endpoint.address(), None);

    assert_eq!(endpoint.bind(0x85).await.unwrap(), 0x85);
}
