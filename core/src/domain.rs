/// Which of the four capture domains a context belongs to. Fixed at context
/// creation; determines which vtable shape and which backend registry apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureDomain {
    Camera,
    Microphone,
    Loopback,
    Screen,
}

impl CaptureDomain {
    pub fn name(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Microphone => "microphone",
            Self::Loopback => "loopback",
            Self::Screen => "screen",
        }
    }

    /// Whether this domain's target identifiers are resolved through the
    /// Target Resolver. Camera and microphone address devices directly by
    /// device id; only loopback and screen carry a process/window/display
    /// target.
    pub fn uses_target_resolver(self) -> bool {
        matches!(self, Self::Loopback | Self::Screen)
    }
}
