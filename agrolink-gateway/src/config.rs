use std::path::Path;

use agrolink::isobus::{Name, NameBuilder};

/// Station NAME presented by the gateway when claiming addresses.
#[derive(Clone, Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NameConfig {
    /// Identity number.
    pub identity_number: u32,
    /// Manufacturer code.
    pub manufacturer_code: u16,
    /// ECU instance.
    pub ecu_instance: u8,
    /// Function instance.
    pub function_instance: u8,
    /// Function.
    pub function: u8,
    /// Device class.
    pub device_class: u8,
    /// Device class instance.
    pub device_class_instance: u8,
    /// Industry group.
    pub industry_group: u8,
    /// Claim from the self-configurable address range.
    pub self_configurable: bool,
}

impl Default for NameConfig {
    fn default() -> Self {
        Self {
            identity_number: 0x1,
            manufacturer_code: 0,
            ecu_instance: 0,
            function_instance: 0,
            // Off-board gateway.
            function: 0x1C,
            device_class: 0,
            device_class_instance: 0,
            // Agricultural machinery.
            industry_group: 2,
            self_configurable: true,
        }
    }
}

impl NameConfig {
    pub fn to_name(&self) -> Name {
        NameBuilder::default()
            .identity_number(self.identity_number)
            .manufacturer_code(self.manufacturer_code)
            .ecu_instance(self.ecu_instance)
            .function_instance(self.function_instance)
            .function(self.function)
            .device_class(self.device_class)
            .device_class_instance(self.device_class_instance)
            .industry_group(self.industry_group)
            .self_configurable(self.self_configurable)
            .build()
    }
}

#[derive(Clone, Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Station NAME fields.
    pub name: NameConfig,
}

/// Read a configuration from a TOML file.
pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<GatewayConfig> {
    Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
}
