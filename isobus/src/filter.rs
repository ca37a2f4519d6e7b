use crate::Id;

/// Full 18-bit group number mask.
pub const PGN_MASK: u32 = 0x3_ffff;
/// Group number mask for PDU1 formats, whose low byte addresses a station.
pub const PDU1_PGN_MASK: u32 = 0x3_ff00;
/// Station address mask.
pub const ADDR_MASK: u8 = 0xff;
/// Priority mask.
pub const PRIORITY_MASK: u8 = 0x7;

/// A PDU2 filter carried a destination address mask.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidFilter;

impl core::fmt::Display for InvalidFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "destination address filter on a broadcast group number")
    }
}

/// Message filter over the ISOBUS parameters of a frame.
///
/// A frame matches when every masked parameter is equal, or the opposite
/// when the filter is inverted. An empty (all zero) filter matches every
/// frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    /// Parameter group number.
    pub pgn: u32,
    pub pgn_mask: u32,
    /// Directed address, not meaningful for PDU2 group numbers.
    pub daddr: u8,
    pub daddr_mask: u8,
    /// Source address.
    pub saddr: u8,
    pub saddr_mask: u8,
    /// Priority.
    pub priority: u8,
    pub priority_mask: u8,
    /// Negate the match.
    pub inverted: bool,
}

impl Filter {
    /// A filter matching every frame.
    #[must_use]
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Match a single group number, any source, any destination.
    #[must_use]
    pub fn from_pgn(pgn: u32) -> Self {
        Self {
            pgn,
            pgn_mask: PGN_MASK,
            ..Self::default()
        }
    }

    /// Match frames from one source address.
    #[must_use]
    pub fn from_saddr(saddr: u8) -> Self {
        Self {
            saddr,
            saddr_mask: ADDR_MASK,
            ..Self::default()
        }
    }

    /// Invert the filter.
    #[must_use]
    pub fn invert(mut self) -> Self {
        self.inverted = true;
        self
    }

    /// Translate to the identifier/mask pair the driver matches on.
    ///
    /// The destination address occupies the same identifier bits as the low
    /// byte of the group number, so for PDU1 group numbers the PGN mask is
    /// clamped to the upper bytes and the DA fields supply the low byte. A
    /// PDU2 group number has no destination to match and such a filter is
    /// rejected.
    pub fn to_can_filter(&self) -> Result<CanFilter, InvalidFilter> {
        let mut pgn_mask = self.pgn_mask;

        if (self.pgn >> 8) & 0xff < 0xf0 {
            pgn_mask &= PDU1_PGN_MASK;
        } else if self.daddr_mask != 0 {
            return Err(InvalidFilter);
        }

        Ok(CanFilter {
            id: canid(self.priority, self.pgn, self.daddr, self.saddr),
            mask: canid(self.priority_mask, pgn_mask, self.daddr_mask, self.saddr_mask),
            inverted: self.inverted,
        })
    }
}

const fn canid(priority: u8, pgn: u32, daddr: u8, saddr: u8) -> u32 {
    ((priority & PRIORITY_MASK) as u32) << 26
        | (pgn & PGN_MASK) << 8
        | (daddr as u32) << 8
        | saddr as u32
}

/// Driver level filter: match is `(id ^ filter.id) & filter.mask == 0`,
/// negated when inverted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
    pub inverted: bool,
}

impl CanFilter {
    /// Exact match on the address claimed group directed at the global address.
    #[must_use]
    pub fn address_claimed() -> Self {
        Self {
            id: (u32::from(crate::PGN::AddressClaimed) | crate::GLOBAL_ADDRESS as u32) << 8,
            mask: PGN_MASK << 8,
            inverted: false,
        }
    }

    /// Match the request group, wildcarding the requested station byte.
    #[must_use]
    pub fn request() -> Self {
        Self {
            id: u32::from(crate::PGN::Request) << 8,
            mask: PDU1_PGN_MASK << 8,
            inverted: false,
        }
    }

    /// Test an identifier against the filter.
    #[must_use]
    pub fn matches(&self, id: &Id) -> bool {
        ((id.as_raw() ^ self.id) & self.mask == 0) != self.inverted
    }
}

/// Test an identifier against a filter list, counting matches.
///
/// A frame matching several filters is delivered once per match; callers
/// that want a plain yes/no use `matches_any`.
#[must_use]
pub fn match_count(filters: &[CanFilter], id: &Id) -> usize {
    filters.iter().filter(|f| f.matches(id)).count()
}

#[must_use]
pub fn matches_any(filters: &[CanFilter], id: &Id) -> bool {
    filters.iter().any(|f| f.matches(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IdBuilder, PGN};

    #[test]
    fn filter_conv_1() {
        // PDU2 group, no addresses: PGN-only match.
        let filter = Filter::from_pgn(0xFEE6).to_can_filter().unwrap();

        assert_eq!(filter.id, 0xFEE6 << 8);
        assert_eq!(filter.mask, PGN_MASK << 8);
        assert!(!filter.inverted);

        let id = IdBuilder::from_pgn(PGN::Other(0xFEE6))
            .priority(3)
            .sa(0x42)
            .build();
        assert!(filter.matches(&id));

        let other = IdBuilder::from_pgn(PGN::Other(0xFEF7)).sa(0x42).build();
        assert!(!filter.matches(&other));
    }

    #[test]
    fn filter_conv_2() {
        // PDU1 group: the PGN mask is clamped and the DA fields take the low byte.
        let filter = Filter {
            pgn: 0xEA00,
            pgn_mask: PGN_MASK,
            daddr: 0x80,
            daddr_mask: ADDR_MASK,
            ..Filter::default()
        }
        .to_can_filter()
        .unwrap();

        assert_eq!(filter.id, (0xEA00 | 0x80) << 8);
        assert_eq!(filter.mask, (PDU1_PGN_MASK | 0xff) << 8);

        let to_us = IdBuilder::from_pgn(PGN::Request).da(0x80).sa(0x23).build();
        assert!(filter.matches(&to_us));

        let to_other = IdBuilder::from_pgn(PGN::Request).da(0x81).sa(0x23).build();
        assert!(!filter.matches(&to_other));
    }

    #[test]
    fn filter_conv_rejects_pdu2_daddr() {
        let filter = Filter {
            pgn: 0xFEE6,
            pgn_mask: PGN_MASK,
            daddr_mask: ADDR_MASK,
            ..Filter::default()
        };

        assert_eq!(filter.to_can_filter(), Err(InvalidFilter));
    }

    #[test]
    fn filter_saddr() {
        let filter = Filter::from_saddr(0x29).to_can_filter().unwrap();

        let id = IdBuilder::from_pgn(PGN::Other(0xFF02)).sa(0x29).build();
        assert!(filter.matches(&id));

        let id = IdBuilder::from_pgn(PGN::Other(0xFF02)).sa(0x30).build();
        assert!(!filter.matches(&id));
    }

    #[test]
    fn filter_inverted() {
        let filter = Filter::from_saddr(0x29).invert().to_can_filter().unwrap();

        let id = IdBuilder::from_pgn(PGN::Other(0xFF02)).sa(0x29).build();
        assert!(!filter.matches(&id));

        let id = IdBuilder::from_pgn(PGN::Other(0xFF02)).sa(0x30).build();
        assert!(filter.matches(&id));
    }

    #[test]
    fn filter_priority() {
        let filter = Filter {
            priority: 3,
            priority_mask: PRIORITY_MASK,
            ..Filter::default()
        }
        .to_can_filter()
        .unwrap();

        let id = IdBuilder::from_pgn(PGN::Other(0xFEE6))
            .priority(3)
            .sa(0x42)
            .build();
        assert!(filter.matches(&id));

        let id = IdBuilder::from_pgn(PGN::Other(0xFEE6))
            .priority(6)
            .sa(0x42)
            .build();
        assert!(!filter.matches(&id));
    }

    #[test]
    fn filter_accept_all() {
        let filter = Filter::accept_all().to_can_filter().unwrap();

        assert_eq!(filter.mask, 0);
        let id = IdBuilder::from_pgn(PGN::AddressClaimed).sa(0xFE).build();
        assert!(filter.matches(&id));
    }

    #[test]
    fn nm_filters() {
        let claimed = CanFilter::address_claimed();
        let id = IdBuilder::from_pgn(PGN::AddressClaimed)
            .da(crate::GLOBAL_ADDRESS)
            .sa(0x80)
            .build();
        assert!(claimed.matches(&id));

        let request = CanFilter::request();
        let id = IdBuilder::from_pgn(PGN::Request).da(0x1C).sa(0x80).build();
        assert!(request.matches(&id));
        let id = IdBuilder::from_pgn(PGN::AddressClaimed)
            .da(crate::GLOBAL_ADDRESS)
            .sa(0x80)
            .build();
        assert!(!request.matches(&id));
    }
}
