//! Port-forward classification result.

use strum::{Display, IntoStaticStr};

/// Whether our listening port looks reachable from the open internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum PortForwardStatus {
    /// A send/receive gap well past any known NAT binding timeout.
    #[strum(serialize = "Port forwarded")]
    DefinitelyPortForwarded,
    /// A gap longer than typical NAT timeouts, but not conclusive.
    #[strum(serialize = "Maybe port forwarded")]
    MaybePortForwarded,
    /// No usable evidence either way.
    #[strum(serialize = "Status unknown")]
    DontKnow,
    /// No gap evidence by the presumed-guilty deadline.
    #[strum(serialize = "Maybe behind NAT")]
    MaybeNated,
    /// An external connectivity check reported failure recently.
    #[strum(serialize = "Behind NAT")]
    DefinitelyNated,
}

impl PortForwardStatus {
    /// Human-readable name for status displays.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
