//! HID protocol-mode negotiation.
//!
//! HID-over-GATT peers start in either boot or report protocol.  Report
//! protocol carries the richer descriptor-defined reports, so we move to it
//! whenever the peer exposes report characteristics, and fall back to boot
//! when it does not.

/// Protocol Mode characteristic value (0x2A4E).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolMode {
    Boot,
    Report,
}

impl ProtocolMode {
    /// Decode the characteristic byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProtocolMode::Boot),
            1 => Some(ProtocolMode::Report),
            _ => None,
        }
    }

    /// Encode for a characteristic write.
    pub fn as_byte(self) -> u8 {
        match self {
            ProtocolMode::Boot => 0,
            ProtocolMode::Report => 1,
        }
    }
}

/// What the HID client should do once the service is discovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolDecision {
    /// Current mode is right; subscribe as-is.
    Keep(ProtocolMode),
    /// Write the Protocol Mode characteristic, then subscribe.
    SwitchTo(ProtocolMode),
    /// Neither boot nor report characteristics were found.
    NoReports,
}

impl ProtocolDecision {
    /// Mode the link ends up in after applying the decision.
    pub fn effective_mode(self, current: ProtocolMode) -> ProtocolMode {
        match self {
            ProtocolDecision::Keep(mode) | ProtocolDecision::SwitchTo(mode) => mode,
            ProtocolDecision::NoReports => current,
        }
    }
}

/// Choose the protocol mode from what the peer exposes.
///
/// `has_report` is true when at least one Report (0x2A4D) characteristic was
/// discovered; `has_boot` when a Boot Mouse/Keyboard Input characteristic was.
pub fn negotiate(current: ProtocolMode, has_report: bool, has_boot: bool) -> ProtocolDecision {
    match (current, has_report, has_boot) {
        (ProtocolMode::Boot, true, _) => {
            info!("switching HID peer to report protocol");
            ProtocolDecision::SwitchTo(ProtocolMode::Report)
        }
        (ProtocolMode::Report, false, true) => {
            info!("report protocol without report characteristics, falling back to boot");
            ProtocolDecision::SwitchTo(ProtocolMode::Boot)
        }
        (_, false, false) => {
            warn!("no HID input reports exposed by peer");
            ProtocolDecision::NoReports
        }
        (mode, _, _) => ProtocolDecision::Keep(mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_with_report_support_switches_to_report() {
        assert_eq!(
            negotiate(ProtocolMode::Boot, true, true),
            ProtocolDecision::SwitchTo(ProtocolMode::Report)
        );
        assert_eq!(
            negotiate(ProtocolMode::Boot, true, false),
            ProtocolDecision::SwitchTo(ProtocolMode::Report)
        );
    }

    #[test]
    fn boot_only_peer_stays_in_boot() {
        assert_eq!(
            negotiate(ProtocolMode::Boot, false, true),
            ProtocolDecision::Keep(ProtocolMode::Boot)
        );
    }

    #[test]
    fn report_without_report_chars_falls_back_to_boot() {
        assert_eq!(
            negotiate(ProtocolMode::Report, false, true),
            ProtocolDecision::SwitchTo(ProtocolMode::Boot)
        );
    }

    #[test]
    fn report_mode_with_reports_is_kept() {
        assert_eq!(
            negotiate(ProtocolMode::Report, true, false),
            ProtocolDecision::Keep(ProtocolMode::Report)
        );
    }

    #[test]
    fn nothing_exposed() {
        let d = negotiate(ProtocolMode::Report, false, false);
        assert_eq!(d, ProtocolDecision::NoReports);
        assert_eq!(d.effective_mode(ProtocolMode::Report), ProtocolMode::Report);
    }

    #[test]
    fn mode_byte_round_trip() {
        assert_eq!(ProtocolMode::from_byte(0), Some(ProtocolMode::Boot));
        assert_eq!(ProtocolMode::from_byte(1), Some(ProtocolMode::Report));
        assert_eq!(ProtocolMode::from_byte(2), None);
        assert_eq!(ProtocolMode::Report.as_byte(), 1);
    }
}
