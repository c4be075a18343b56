use std::{collections::HashMap, fmt};

// Every management library operation the crate knows how to use.
// Availability depends on the installed driver version, so nothing
// outside this module may assume a capability is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Init,
    Shutdown,
    ErrorString,
    DriverVersion,
    DeviceCount,
    HandleByIndex,
    PciInfo,
    DeviceName,

    GetApiRestriction,
    SetApiRestriction,

    ApplicationsClock,
    DefaultApplicationsClock,
    SetApplicationsClocks,
    ResetApplicationsClocks,
    SupportedMemoryClocks,
    SupportedGraphicsClocks,
    Clock,

    PowerUsage,
    PowerLimit,
    PowerLimitConstraints,
    PowerLimitDefault,
    SetPowerLimit,

    Temperature,
    FanSpeed,
    PerformanceState,
    Serial,
    Uuid,
    VbiosVersion,
}

// The minimal set without which no handle can be built
pub const REQUIRED: [Capability; 7] = [
    Capability::Init,
    Capability::Shutdown,
    Capability::ErrorString,
    Capability::DeviceCount,
    Capability::HandleByIndex,
    Capability::PciInfo,
    Capability::DeviceName,
];

impl Capability {
    pub const ALL: [Capability; 28] = [
        Capability::Init,
        Capability::Shutdown,
        Capability::ErrorString,
        Capability::DriverVersion,
        Capability::DeviceCount,
        Capability::HandleByIndex,
        Capability::PciInfo,
        Capability::DeviceName,
        Capability::GetApiRestriction,
        Capability::SetApiRestriction,
        Capability::ApplicationsClock,
        Capability::DefaultApplicationsClock,
        Capability::SetApplicationsClocks,
        Capability::ResetApplicationsClocks,
        Capability::SupportedMemoryClocks,
        Capability::SupportedGraphicsClocks,
        Capability::Clock,
        Capability::PowerUsage,
        Capability::PowerLimit,
        Capability::PowerLimitConstraints,
        Capability::PowerLimitDefault,
        Capability::SetPowerLimit,
        Capability::Temperature,
        Capability::FanSpeed,
        Capability::PerformanceState,
        Capability::Serial,
        Capability::Uuid,
        Capability::VbiosVersion,
    ];

    // Candidate symbol names, most recent ABI first
    pub fn symbols(self) -> &'static [&'static str] {
        match self {
            Capability::Init => &["nvmlInit_v2", "nvmlInit"],
            Capability::Shutdown => &["nvmlShutdown"],
            Capability::ErrorString => &["nvmlErrorString"],
            Capability::DriverVersion => &["nvmlSystemGetDriverVersion"],
            Capability::DeviceCount => {
                &["nvmlDeviceGetCount_v2", "nvmlDeviceGetCount"]
            }
            Capability::HandleByIndex => &["nvmlDeviceGetHandleByIndex_v2"],
            Capability::PciInfo => {
                &["nvmlDeviceGetPciInfo_v2", "nvmlDeviceGetPciInfo"]
            }
            Capability::DeviceName => &["nvmlDeviceGetName"],
            Capability::GetApiRestriction => &["nvmlDeviceGetAPIRestriction"],
            Capability::SetApiRestriction => &["nvmlDeviceSetAPIRestriction"],
            Capability::ApplicationsClock => {
                &["nvmlDeviceGetApplicationsClock"]
            }
            Capability::DefaultApplicationsClock => {
                &["nvmlDeviceGetDefaultApplicationsClock"]
            }
            Capability::SetApplicationsClocks => {
                &["nvmlDeviceSetApplicationsClocks"]
            }
            Capability::ResetApplicationsClocks => {
                &["nvmlDeviceResetApplicationsClocks"]
            }
            Capability::SupportedMemoryClocks => {
                &["nvmlDeviceGetSupportedMemoryClocks"]
            }
            Capability::SupportedGraphicsClocks => {
                &["nvmlDeviceGetSupportedGraphicsClocks"]
            }
            Capability::Clock => &["nvmlDeviceGetClock"],
            Capability::PowerUsage => &["nvmlDeviceGetPowerUsage"],
            Capability::PowerLimit => &["nvmlDeviceGetPowerManagementLimit"],
            Capability::PowerLimitConstraints => {
                &["nvmlDeviceGetPowerManagementLimitConstraints"]
            }
            Capability::PowerLimitDefault => {
                &["nvmlDeviceGetPowerManagementDefaultLimit"]
            }
            Capability::SetPowerLimit => {
                &["nvmlDeviceSetPowerManagementLimit"]
            }
            Capability::Temperature => &["nvmlDeviceGetTemperature"],
            Capability::FanSpeed => &["nvmlDeviceGetFanSpeed"],
            Capability::PerformanceState => {
                &["nvmlDeviceGetPerformanceState"]
            }
            Capability::Serial => &["nvmlDeviceGetSerial"],
            Capability::Uuid => &["nvmlDeviceGetUUID"],
            Capability::VbiosVersion => &["nvmlDeviceGetVbiosVersion"],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The preferred symbol is the most useful name in diagnostics
        write!(f, "{}", self.symbols()[0])
    }
}

// Maps each capability to the symbol it was resolved from.
// Absent entries are unavailable in the loaded library.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    resolved: HashMap<Capability, &'static str>,
}

impl CapabilityTable {
    // Build the table from a symbol presence predicate supplied
    // by the loader. The first candidate found wins.
    pub fn probe(mut lookup: impl FnMut(&str) -> bool) -> Self {
        let resolved = Capability::ALL
            .iter()
            .filter_map(|&cap| {
                cap.symbols()
                    .iter()
                    .find(|symbol| lookup(symbol))
                    .map(|symbol| (cap, *symbol))
            })
            .collect();

        Self { resolved }
    }

    // Table with every capability present
    pub fn all() -> Self {
        Self::probe(|_| true)
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.resolved.contains_key(&cap)
    }

    pub fn symbol(&self, cap: Capability) -> Option<&'static str> {
        self.resolved.get(&cap).copied()
    }

    pub fn insert(&mut self, cap: Capability) {
        self.resolved.insert(cap, cap.symbols()[0]);
    }

    pub fn remove(&mut self, cap: Capability) {
        self.resolved.remove(&cap);
    }

    pub fn missing_required(&self) -> Vec<Capability> {
        REQUIRED.iter().copied().filter(|cap| !self.has(*cap)).collect()
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

impl FromIterator<Capability> for CapabilityTable {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut table = Self::default();
        for cap in iter {
            table.insert(cap);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_prefers_versioned_symbol() {
        let table = CapabilityTable::probe(|s| s.starts_with("nvml"));
        assert_eq!(table.symbol(Capability::Init), Some("nvmlInit_v2"));
        assert_eq!(
            table.symbol(Capability::PciInfo),
            Some("nvmlDeviceGetPciInfo_v2")
        );
    }

    #[test]
    fn probe_falls_back_to_unversioned_symbol() {
        let table = CapabilityTable::probe(|s| !s.ends_with("_v2"));
        assert_eq!(table.symbol(Capability::Init), Some("nvmlInit"));
        assert_eq!(
            table.symbol(Capability::DeviceCount),
            Some("nvmlDeviceGetCount")
        );
        // Handle by index has no unversioned fallback
        assert!(!table.has(Capability::HandleByIndex));
        assert_eq!(table.missing_required(), vec![Capability::HandleByIndex]);
    }

    #[test]
    fn full_table_has_no_missing_required() {
        let table = CapabilityTable::all();
        assert!(table.missing_required().is_empty());
        assert_eq!(table.len(), Capability::ALL.len());
    }

    #[test]
    fn optional_entries_are_independent() {
        let mut table: CapabilityTable = REQUIRED.into_iter().collect();
        assert!(table.missing_required().is_empty());
        assert!(!table.has(Capability::FanSpeed));

        table.insert(Capability::FanSpeed);
        assert!(table.has(Capability::FanSpeed));

        table.remove(Capability::Shutdown);
        assert_eq!(table.missing_required(), vec![Capability::Shutdown]);
    }
}
