// Board partner names by PCI subsystem vendor id.
// Reference boards report NVIDIA itself, which is not listed.
const VENDORS: [(u16, &str); 14] = [
    (0x1043, "ASUS"),
    (0x107D, "Leadtek"),
    (0x10B0, "Gainward"),
    (0x1458, "Gigabyte"),
    (0x1462, "MSI"),
    (0x154B, "PNY"),
    (0x1682, "XFX"),
    (0x196D, "Club3D"),
    (0x19DA, "Zotac"),
    (0x19F1, "BFG"),
    (0x1ACC, "PoV"),
    (0x1B4C, "KFA2"),
    (0x3842, "EVGA"),
    (0x7377, "Colorful"),
];

// Name of the board vendor, empty when unknown
pub fn vendor_name(vendor_id: u16) -> &'static str {
    VENDORS
        .iter()
        .find(|(id, _)| *id == vendor_id)
        .map(|(_, name)| *name)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vendors() {
        assert_eq!(vendor_name(0x1462), "MSI");
        assert_eq!(vendor_name(0x3842), "EVGA");
        assert_eq!(vendor_name(0x7377), "Colorful");
    }

    #[test]
    fn unknown_vendor_is_empty() {
        assert_eq!(vendor_name(0x10DE), "");
        assert_eq!(vendor_name(0), "");
    }
}
