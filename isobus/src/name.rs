/// Station NAME.
///
/// The NAME is a 64-bit identity that every station presents when claiming
/// an address. It doubles as the tie breaker during address contention: the
/// numerically *lower* NAME wins. Comparison is plain unsigned comparison of
/// the packed value, which the derived ordering provides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Name(u64);

impl Name {
    /// Construct NAME from the packed representation.
    #[must_use]
    pub const fn new(name: u64) -> Self {
        Self(name)
    }

    /// Return NAME as packed integer.
    #[inline]
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Construct NAME from its 8-byte wire representation.
    ///
    /// The wire order is little endian, least significant byte first, as
    /// carried in the address claimed payload.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Return the 8-byte wire representation.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Whether the station can claim an address from the self-configurable range.
    #[must_use]
    pub fn self_configurable(&self) -> bool {
        self.0 >> 63 != 0
    }

    /// Industry group.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn industry_group(&self) -> u8 {
        ((self.0 >> 60) & 0x7) as u8
    }

    /// Device class instance.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn device_class_instance(&self) -> u8 {
        ((self.0 >> 56) & 0xf) as u8
    }

    /// Device class.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn device_class(&self) -> u8 {
        ((self.0 >> 49) & 0x7f) as u8
    }

    /// Function.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn function(&self) -> u8 {
        ((self.0 >> 40) & 0xff) as u8
    }

    /// Function instance.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn function_instance(&self) -> u8 {
        ((self.0 >> 35) & 0x1f) as u8
    }

    /// ECU instance.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ecu_instance(&self) -> u8 {
        ((self.0 >> 32) & 0x7) as u8
    }

    /// Manufacturer code.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn manufacturer_code(&self) -> u16 {
        ((self.0 >> 21) & 0x7ff) as u16
    }

    /// Identity number.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn identity_number(&self) -> u32 {
        (self.0 & 0x1f_ffff) as u32
    }
}

impl core::fmt::Display for Name {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Identity: {} Manufacturer: {} Function: {}",
            self.identity_number(),
            self.manufacturer_code(),
            self.function()
        )
    }
}

#[derive(Default)]
pub struct NameBuilder {
    self_configurable: bool,
    industry_group: u8,
    device_class_instance: u8,
    device_class: u8,
    function: u8,
    function_instance: u8,
    ecu_instance: u8,
    manufacturer_code: u16,
    identity_number: u32,
}

impl NameBuilder {
    /// Mark the station as capable of self-configuring its address.
    #[inline]
    #[must_use]
    pub fn self_configurable(mut self, on: bool) -> Self {
        self.self_configurable = on;
        self
    }

    /// Set the industry group.
    #[inline]
    #[must_use]
    pub fn industry_group(mut self, group: u8) -> Self {
        self.industry_group = group;
        self
    }

    /// Set the device class instance.
    #[inline]
    #[must_use]
    pub fn device_class_instance(mut self, instance: u8) -> Self {
        self.device_class_instance = instance;
        self
    }

    /// Set the device class.
    #[inline]
    #[must_use]
    pub fn device_class(mut self, class: u8) -> Self {
        self.device_class = class;
        self
    }

    /// Set the function.
    #[inline]
    #[must_use]
    pub fn function(mut self, function: u8) -> Self {
        self.function = function;
        self
    }

    /// Set the function instance.
    #[inline]
    #[must_use]
    pub fn function_instance(mut self, instance: u8) -> Self {
        self.function_instance = instance;
        self
    }

    /// Set the ECU instance.
    #[inline]
    #[must_use]
    pub fn ecu_instance(mut self, instance: u8) -> Self {
        self.ecu_instance = instance;
        self
    }

    /// Set the manufacturer code.
    #[inline]
    #[must_use]
    pub fn manufacturer_code(mut self, code: u16) -> Self {
        self.manufacturer_code = code;
        self
    }

    /// Set the identity number.
    #[inline]
    #[must_use]
    pub fn identity_number(mut self, number: u32) -> Self {
        self.identity_number = number;
        self
    }

    /// Pack the NAME. Bit 48 is reserved and stays zero.
    #[must_use]
    pub fn build(self) -> Name {
        Name(
            u64::from(self.self_configurable) << 63
                | u64::from(self.industry_group & 0x7) << 60
                | u64::from(self.device_class_instance & 0xf) << 56
                | u64::from(self.device_class & 0x7f) << 49
                | u64::from(self.function) << 40
                | u64::from(self.function_instance & 0x1f) << 35
                | u64::from(self.ecu_instance & 0x7) << 32
                | u64::from(self.manufacturer_code & 0x7ff) << 21
                | u64::from(self.identity_number & 0x1f_ffff),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_build_1() {
        let name = NameBuilder::default()
            .self_configurable(true)
            .industry_group(2)
            .device_class_instance(1)
            .device_class(25)
            .function(130)
            .function_instance(3)
            .ecu_instance(1)
            .manufacturer_code(0x122)
            .identity_number(0xB0309)
            .build();

        assert!(name.self_configurable());
        assert_eq!(name.industry_group(), 2);
        assert_eq!(name.device_class_instance(), 1);
        assert_eq!(name.device_class(), 25);
        assert_eq!(name.function(), 130);
        assert_eq!(name.function_instance(), 3);
        assert_eq!(name.ecu_instance(), 1);
        assert_eq!(name.manufacturer_code(), 0x122);
        assert_eq!(name.identity_number(), 0xB0309);
    }

    #[test]
    fn name_bytes_roundtrip() {
        let name = NameBuilder::default()
            .identity_number(0x1)
            .manufacturer_code(0x29)
            .function(0x1D)
            .build();

        assert_eq!(Name::from_bytes(name.to_bytes()), name);
        // Least significant byte goes on the wire first.
        assert_eq!(name.to_bytes()[0], 0x01);
    }

    #[test]
    fn name_ordering() {
        // Lower NAME wins contention; ordering is unsigned.
        let low = Name::new(0x0000_0000_0000_0001);
        let high = Name::new(0x8000_0000_0000_0001);

        assert!(low < high);
        assert!(Name::new(u64::MAX) > high);
    }
}
