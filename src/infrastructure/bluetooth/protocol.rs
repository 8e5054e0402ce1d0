//! Bluetooth LE protocol helpers
//!
//! Base-UUID conversions, names of well-known GATT services, and a parser
//! for raw advertising data (AD structures) as captured by sniffers.

use crate::domain::models::Advertisement;
use std::collections::BTreeMap;
use tracing::trace;
use uuid::Uuid;

/// `00000000-0000-1000-8000-00805F9B34FB`
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// AD types used by the parser
pub mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_UUID16: u8 = 0x02;
    pub const COMPLETE_UUID16: u8 = 0x03;
    pub const INCOMPLETE_UUID32: u8 = 0x04;
    pub const COMPLETE_UUID32: u8 = 0x05;
    pub const INCOMPLETE_UUID128: u8 = 0x06;
    pub const COMPLETE_UUID128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const MANUFACTURER_SPECIFIC: u8 = 0xFF;
}

pub fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(u32::from(short))
}

pub fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128((u128::from(short) << 96) | BLUETOOTH_BASE_UUID)
}

/// The 16/32-bit alias of a base-derived UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    if value & ((1u128 << 96) - 1) == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u32)
    } else {
        None
    }
}

/// Name of a SIG-assigned GATT service.
pub fn service_name(uuid: &Uuid) -> Option<&'static str> {
    let name = match short_uuid(uuid)? {
        0x1800 => "Generic Access",
        0x1801 => "Generic Attribute",
        0x1802 => "Immediate Alert",
        0x1803 => "Link Loss",
        0x1804 => "Tx Power",
        0x1805 => "Current Time",
        0x1809 => "Health Thermometer",
        0x180A => "Device Information",
        0x180D => "Heart Rate",
        0x180F => "Battery Service",
        0x1810 => "Blood Pressure",
        0x1812 => "Human Interface Device",
        0x1816 => "Cycling Speed and Cadence",
        0x1818 => "Cycling Power",
        0x1819 => "Location and Navigation",
        0x181A => "Environmental Sensing",
        0x181C => "User Data",
        0x181D => "Weight Scale",
        _ => return None,
    };
    Some(name)
}

/// Human readable service label: SIG name, short alias or full UUID.
pub fn describe_service(uuid: &Uuid) -> String {
    match (service_name(uuid), short_uuid(uuid)) {
        (Some(name), Some(short)) => format!("{name} (0x{short:04X})"),
        (None, Some(short)) => format!("0x{short:04X}"),
        _ => uuid.to_string(),
    }
}

/// Fields decoded from one advertising payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvertisingData {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub tx_power: Option<i8>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl AdvertisingData {
    /// Copy the decoded fields onto an observation.
    pub fn apply_to(self, mut advertisement: Advertisement) -> Advertisement {
        if let Some(name) = self.local_name {
            advertisement = advertisement.with_name(name);
        }
        if let Some(tx_power) = self.tx_power {
            advertisement = advertisement.with_tx_power(i16::from(tx_power));
        }
        advertisement = advertisement.with_services(self.services);
        for (company, data) in self.manufacturer_data {
            advertisement = advertisement.with_manufacturer_data(company, data);
        }
        advertisement
    }
}

/// Walk the length-type-value AD structures of an advertising payload.
/// Parsing stops quietly at the first truncated structure.
pub fn parse_advertising_data(data: &[u8]) -> AdvertisingData {
    let mut out = AdvertisingData::default();
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            break;
        }
        let kind = data[i + 1];
        let value = &data[i + 2..i + 1 + len];

        match kind {
            ad_type::FLAGS => out.flags = value.first().copied(),
            ad_type::INCOMPLETE_UUID16 | ad_type::COMPLETE_UUID16 => {
                for chunk in value.chunks_exact(2) {
                    out.services
                        .push(uuid_from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            ad_type::INCOMPLETE_UUID32 | ad_type::COMPLETE_UUID32 => {
                for chunk in value.chunks_exact(4) {
                    out.services.push(uuid_from_u32(u32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ])));
                }
            }
            ad_type::INCOMPLETE_UUID128 | ad_type::COMPLETE_UUID128 => {
                for chunk in value.chunks_exact(16) {
                    let mut be = [0u8; 16];
                    for (dst, src) in be.iter_mut().zip(chunk.iter().rev()) {
                        *dst = *src;
                    }
                    out.services.push(Uuid::from_bytes(be));
                }
            }
            ad_type::SHORTENED_LOCAL_NAME | ad_type::COMPLETE_LOCAL_NAME => {
                // A complete name always beats a shortened one.
                if kind == ad_type::COMPLETE_LOCAL_NAME || out.local_name.is_none() {
                    out.local_name = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            ad_type::TX_POWER_LEVEL => out.tx_power = value.first().map(|b| *b as i8),
            ad_type::MANUFACTURER_SPECIFIC if value.len() >= 2 => {
                let company = u16::from_le_bytes([value[0], value[1]]);
                out.manufacturer_data.insert(company, value[2..].to_vec());
            }
            other => trace!("Skipping AD type {:#04x}", other),
        }
        i += len + 1;
    }
    out
}
