//! Device identity and discovery records.

/// A remote sensor, identified by its transport address.
///
/// Identity is the address alone; the name is informational.
#[derive(Debug, Clone, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    address: String,
    name: Option<String>,
}

impl Device {
    /// Create a device record.
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Transport address (platform peripheral identifier).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised display name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// A candidate in the scan result list.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// The discovered device.
    pub device: Device,
    /// Most recent signal strength in dBm.
    pub rssi: i16,
    /// How many times the device was seen in this scan session.
    pub sightings: u32,
    /// Scan-wide sequence number of the most recent sighting.
    pub last_seen: u64,
}

impl DiscoveredDevice {
    /// Address of the discovered device.
    pub fn address(&self) -> &str {
        self.device.address()
    }
}
