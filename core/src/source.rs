//! Device descriptors as returned by a backend's `enumerate` op. Enumeration
//! is a one-shot query with no state of its own; it is specified here only
//! to the extent its results feed `Configure`.

/// One entry in an enumeration result. `id` is what a caller passes back into
/// `Configure`/`GetSupportedFormats`/`GetDefaultFormat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    /// Set for loopback process targets: the owning process id, so a caller
    /// can aggregate distinct PIDs across render endpoints without parsing
    /// `id`.
    pub process_id: Option<u32>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            process_id: None,
        }
    }

    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }
}

/// Deduplicates a set of enumeration results aggregated across more than one
/// backend source (e.g. loopback process targets walked across every active
/// render endpoint), keeping the first occurrence of each distinct id.
pub fn dedup_by_id(mut descriptors: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut seen = std::collections::HashSet::new();
    descriptors.retain(|d| seen.insert(d.id.clone()));
    descriptors
}
