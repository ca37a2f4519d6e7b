//! Network management frame constructors.

use crate::{
    Frame, FrameBuilder, IdBuilder, Name, GLOBAL_ADDRESS, NULL_ADDRESS, PGN,
};

/// Request the given parameter group from a station.
///
/// The payload is the requested group number, most significant byte first.
#[must_use]
pub fn request(pgn: PGN, da: u8, sa: u8) -> Frame {
    let raw: u32 = pgn.into();

    FrameBuilder::new(IdBuilder::from_pgn(PGN::Request).da(da).sa(sa).build())
        .copy_from_slice(&[
            ((raw >> 16) & 0xff) as u8,
            ((raw >> 8) & 0xff) as u8,
            (raw & 0xff) as u8,
        ])
        .build()
}

/// Request for address claimed, sent while we hold no address.
#[must_use]
pub fn request_for_address_claimed(da: u8) -> Frame {
    request(PGN::AddressClaimed, da, NULL_ADDRESS)
}

/// Claim an address, announcing our NAME to every station.
#[must_use]
pub fn address_claimed(sa: u8, name: Name) -> Frame {
    FrameBuilder::new(
        IdBuilder::from_pgn(PGN::AddressClaimed)
            .da(GLOBAL_ADDRESS)
            .sa(sa)
            .build(),
    )
    .copy_from_slice(&name.to_bytes())
    .build()
}

/// Announce that no address could be claimed.
///
/// Same frame as a claim, sourced from the null address.
#[must_use]
pub fn cannot_claim_address(name: Name) -> Frame {
    address_claimed(NULL_ADDRESS, name)
}

/// Whether a request frame asks for address claimed.
///
/// Anything but the exact 3-byte payload is some other request and is left
/// to the user filters.
#[must_use]
pub fn is_request_for_address_claimed(frame: &Frame) -> bool {
    frame.len() == 3 && frame.pdu() == [0x00, 0xee, 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Id;

    #[test]
    fn request_frame() {
        let frame = request_for_address_claimed(0x80);

        assert_eq!(frame.id(), &Id::new(0x18EA_80FE));
        assert_eq!(frame.pdu(), &[0x00, 0xEE, 0x00]);
        assert_eq!(frame.len(), 3);
        assert!(is_request_for_address_claimed(&frame));
    }

    #[test]
    fn claim_frame() {
        let name = Name::new(0x8000_0000_0B03_0901);
        let frame = address_claimed(0x80, name);

        assert_eq!(frame.id(), &Id::new(0x18EE_FF80));
        assert_eq!(frame.len(), 8);
        assert_eq!(Name::from_bytes(frame.pdu().try_into().unwrap()), name);
    }

    #[test]
    fn cannot_claim_frame() {
        let frame = cannot_claim_address(Name::new(0x1));

        assert_eq!(frame.id().source_address(), NULL_ADDRESS);
        assert_eq!(frame.id().destination_address(), Some(GLOBAL_ADDRESS));
    }

    #[test]
    fn other_request() {
        let frame = request(PGN::TimeDate, GLOBAL_ADDRESS, 0x42);

        assert_eq!(frame.pdu(), &[0x00, 0xFE, 0xE6]);
        assert!(!is_request_for_address_claimed(&frame));
    }
}
