//! Supported device table
//!
//! Realtek RTL8812AU/RTL8821AU/RTL8814AU based adapters, including rebranded
//! Alfa products that keep the Realtek vendor ID.

use std::fmt;

/// Realtek USB vendor ID
pub const REALTEK_VENDOR_ID: u16 = 0x0BDA;

/// Chip family, derived from the product ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipType {
    Rtl8812au,
    Rtl8821au,
    Rtl8814au,
    /// Product added at runtime through configuration
    Unknown,
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChipType::Rtl8812au => "RTL8812AU",
            ChipType::Rtl8821au => "RTL8821AU",
            ChipType::Rtl8814au => "RTL8814AU",
            ChipType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

const KNOWN_PRODUCTS: &[(u16, ChipType, &str)] = &[
    (0x8812, ChipType::Rtl8812au, "RTL8812AU"),
    (0x881A, ChipType::Rtl8812au, "RTL8812AU"),
    (0x8822, ChipType::Rtl8812au, "RTL8812AU"),
    (0x8821, ChipType::Rtl8821au, "RTL8821AU"),
    (0x0821, ChipType::Rtl8821au, "RTL8821AU"),
    (0x0823, ChipType::Rtl8821au, "RTL8821AU"),
    (0x8813, ChipType::Rtl8814au, "RTL8814AU"),
    (0x8814, ChipType::Rtl8814au, "RTL8814AU"),
    (0x8021, ChipType::Rtl8814au, "Alfa AWUS1900"),
    (0x8022, ChipType::Rtl8812au, "Alfa AWUS036ACS"),
];

/// Check a (vendor, product) pair against the built-in table
pub fn is_device_supported(vendor_id: u16, product_id: u16) -> bool {
    DeviceTable::default().chip_type(vendor_id, product_id).is_some()
}

/// Built-in table plus any extra pairs from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTable {
    extra: Vec<(u16, u16)>,
}

impl DeviceTable {
    pub fn with_extra(extra: Vec<(u16, u16)>) -> Self {
        Self { extra }
    }

    /// Chip family for a supported pair, `None` for anything else
    pub fn chip_type(&self, vendor_id: u16, product_id: u16) -> Option<ChipType> {
        if vendor_id == REALTEK_VENDOR_ID {
            if let Some((_, chip, _)) = KNOWN_PRODUCTS.iter().find(|(pid, _, _)| *pid == product_id)
            {
                return Some(*chip);
            }
        }

        self.extra
            .contains(&(vendor_id, product_id))
            .then_some(ChipType::Unknown)
    }

    pub fn is_supported(&self, vendor_id: u16, product_id: u16) -> bool {
        self.chip_type(vendor_id, product_id).is_some()
    }

    /// Marketing name for listing purposes
    pub fn product_name(&self, vendor_id: u16, product_id: u16) -> Option<&'static str> {
        if vendor_id != REALTEK_VENDOR_ID {
            return None;
        }
        KNOWN_PRODUCTS
            .iter()
            .find(|(pid, _, _)| *pid == product_id)
            .map(|(_, _, name)| *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_products() {
        assert!(is_device_supported(0x0BDA, 0x8812));
        assert!(is_device_supported(0x0BDA, 0x0821));
        assert!(is_device_supported(0x0BDA, 0x8814));
        assert!(!is_device_supported(0x0BDA, 0x9999));
        // Right product, wrong vendor
        assert!(!is_device_supported(0x2357, 0x8812));
    }

    #[test]
    fn test_chip_type() {
        let table = DeviceTable::default();
        assert_eq!(table.chip_type(0x0BDA, 0x881A), Some(ChipType::Rtl8812au));
        assert_eq!(table.chip_type(0x0BDA, 0x0823), Some(ChipType::Rtl8821au));
        assert_eq!(table.chip_type(0x0BDA, 0x8021), Some(ChipType::Rtl8814au));
        assert_eq!(table.product_name(0x0BDA, 0x8022), Some("Alfa AWUS036ACS"));
    }

    #[test]
    fn test_extra_devices() {
        let table = DeviceTable::with_extra(vec![(0x2357, 0x0101)]);
        assert_eq!(table.chip_type(0x2357, 0x0101), Some(ChipType::Unknown));
        assert!(!table.is_supported(0x2357, 0x0103));
    }
}
