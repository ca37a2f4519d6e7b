/// Parameter Group Number.
///
/// Groups with a named variant are the ones this stack handles or that show
/// up routinely on agricultural networks; everything else round-trips
/// through [`PGN::Other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PGN {
    /// Request, PGN 59904.
    Request,
    /// Acknowledgment, PGN 59392.
    Acknowledgment,
    /// Address Claimed, PGN 60928.
    AddressClaimed,
    /// Commanded Address, PGN 65240.
    CommandedAddress,
    /// Proprietary A, PGN 61184.
    ProprietaryA,
    /// Proprietary B, PGN 65280 - 65535.
    ProprietaryB(u32),
    /// Electronic Engine Controller 1, PGN 61444.
    ElectronicEngineController1,
    /// Electronic Engine Controller 2, PGN 61443.
    ElectronicEngineController2,
    /// Wheel-based Speed and Distance, PGN 65096.
    WheelBasedSpeedAndDistance,
    /// Ground-based Speed and Distance, PGN 65097.
    GroundBasedSpeedAndDistance,
    /// Time / Date, PGN 65254.
    TimeDate,
    /// Vehicle Electrical Power 1, PGN 65271.
    VehicleElectricalPower1,
    /// Dash Display, PGN 65276.
    DashDisplay,
    /// Cruise Control / Vehicle Speed, PGN 65265.
    CruiseControlVehicleSpeed,
    /// Ambient Conditions, PGN 65269.
    AmbientConditions,
    /// Any other group number.
    Other(u32),
}

impl PGN {
    /// PDU format of the group number.
    ///
    /// PDU1 groups address a single station; PDU2 groups are broadcast and
    /// use the PS byte as a group extension.
    #[must_use]
    pub fn is_pdu1(&self) -> bool {
        let pgn: u32 = (*self).into();
        (pgn >> 8) & 0xff < 0xf0
    }
}

impl From<u32> for PGN {
    fn from(value: u32) -> Self {
        match value {
            59_392 => PGN::Acknowledgment,
            59_904 => PGN::Request,
            60_928 => PGN::AddressClaimed,
            61_184 => PGN::ProprietaryA,
            61_443 => PGN::ElectronicEngineController2,
            61_444 => PGN::ElectronicEngineController1,
            65_096 => PGN::WheelBasedSpeedAndDistance,
            65_097 => PGN::GroundBasedSpeedAndDistance,
            65_240 => PGN::CommandedAddress,
            65_254 => PGN::TimeDate,
            65_265 => PGN::CruiseControlVehicleSpeed,
            65_269 => PGN::AmbientConditions,
            65_271 => PGN::VehicleElectricalPower1,
            65_276 => PGN::DashDisplay,
            65_280..=65_535 => PGN::ProprietaryB(value),
            _ => PGN::Other(value),
        }
    }
}

impl From<PGN> for u32 {
    fn from(value: PGN) -> Self {
        match value {
            PGN::Acknowledgment => 59_392,
            PGN::Request => 59_904,
            PGN::AddressClaimed => 60_928,
            PGN::ProprietaryA => 61_184,
            PGN::ElectronicEngineController2 => 61_443,
            PGN::ElectronicEngineController1 => 61_444,
            PGN::WheelBasedSpeedAndDistance => 65_096,
            PGN::GroundBasedSpeedAndDistance => 65_097,
            PGN::CommandedAddress => 65_240,
            PGN::TimeDate => 65_254,
            PGN::CruiseControlVehicleSpeed => 65_265,
            PGN::AmbientConditions => 65_269,
            PGN::VehicleElectricalPower1 => 65_271,
            PGN::DashDisplay => 65_276,
            PGN::ProprietaryB(pgn) => pgn,
            PGN::Other(pgn) => pgn,
        }
    }
}
