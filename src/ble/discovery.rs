//! GATT service discovery chains.
//!
//! Each link walks a fixed chain of discovery stages, one at a time.  A
//! stage that finds its service, finds nothing, or fails outright all move
//! the chain forward: a missing Battery or Device Information service must
//! never strand a link half-initialised.
//!
//! | Chain     | Stages                          |
//! |-----------|---------------------------------|
//! | Primary   | UART → HID → Battery → DevInfo  |
//! | Accessory | UART → MTU exchange             |

use super::peers::PeerId;
use crate::config::MAX_CONNECTIONS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    Uart,
    Hid,
    Battery,
    DeviceInfo,
    Mtu,
}

/// How a stage ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Found,
    NotFound,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChainKind {
    Primary,
    Accessory,
}

const PRIMARY_CHAIN: &[Stage] = &[Stage::Uart, Stage::Hid, Stage::Battery, Stage::DeviceInfo];
const ACCESSORY_CHAIN: &[Stage] = &[Stage::Uart, Stage::Mtu];

impl ChainKind {
    pub fn stages(self) -> &'static [Stage] {
        match self {
            ChainKind::Primary => PRIMARY_CHAIN,
            ChainKind::Accessory => ACCESSORY_CHAIN,
        }
    }
}

/// What the caller should do next for a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    Run(Stage),
    Complete,
}

#[derive(Clone, Copy)]
struct Cursor {
    kind: ChainKind,
    index: usize,
}

impl Cursor {
    fn stage(&self) -> Option<Stage> {
        self.kind.stages().get(self.index).copied()
    }
}

/// Discovery progress for every link, keyed by [`PeerId`].
pub struct DiscoveryOrchestrator<const N: usize = MAX_CONNECTIONS> {
    cursors: [Option<Cursor>; N],
}

impl<const N: usize> Default for DiscoveryOrchestrator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DiscoveryOrchestrator<N> {
    pub const fn new() -> Self {
        Self { cursors: [None; N] }
    }

    /// Start (or restart) the chain for `peer`.
    pub fn begin(&mut self, peer: PeerId, kind: ChainKind) -> Step {
        let Some(slot) = self.cursors.get_mut(peer.index()) else {
            warn!("discovery: peer {} out of range", peer.index());
            return Step::Complete;
        };
        let cursor = Cursor { kind, index: 0 };
        *slot = Some(cursor);
        match cursor.stage() {
            Some(stage) => Step::Run(stage),
            None => {
                *slot = None;
                Step::Complete
            }
        }
    }

    /// Record the outcome of `stage` and pick the next step.
    ///
    /// Returns `None` when `peer` has no chain in progress or `stage` is not
    /// the one it is waiting on; such completions are stale and ignored.
    pub fn advance(&mut self, peer: PeerId, stage: Stage, outcome: Outcome) -> Option<Step> {
        let slot = self.cursors.get_mut(peer.index())?;
        let cursor = slot.as_mut()?;
        if cursor.stage() != Some(stage) {
            debug!("discovery: stale {:?} completion for peer {}", stage, peer.index());
            return None;
        }
        match outcome {
            Outcome::Found => debug!("discovery: {:?} found", stage),
            Outcome::NotFound => info!("discovery: {:?} not present, skipping", stage),
            Outcome::Error => warn!("discovery: {:?} failed, continuing", stage),
        }
        cursor.index += 1;
        match cursor.stage() {
            Some(next) => Some(Step::Run(next)),
            None => {
                *slot = None;
                Some(Step::Complete)
            }
        }
    }

    pub fn cancel(&mut self, peer: PeerId) {
        if let Some(slot) = self.cursors.get_mut(peer.index()) {
            *slot = None;
        }
    }

    /// Stage `peer` is currently waiting on.
    pub fn current(&self, peer: PeerId) -> Option<Stage> {
        self.cursors.get(peer.index())?.as_ref()?.stage()
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.cursors.iter().filter(|c| c.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTCOMES: [Outcome; 3] = [Outcome::Found, Outcome::NotFound, Outcome::Error];

    #[test]
    fn primary_chain_order() {
        let mut d: DiscoveryOrchestrator = DiscoveryOrchestrator::new();
        let p = PeerId::new(0);
        assert_eq!(d.begin(p, ChainKind::Primary), Step::Run(Stage::Uart));
        assert_eq!(d.advance(p, Stage::Uart, Outcome::Found), Some(Step::Run(Stage::Hid)));
        assert_eq!(d.advance(p, Stage::Hid, Outcome::Found), Some(Step::Run(Stage::Battery)));
        assert_eq!(
            d.advance(p, Stage::Battery, Outcome::Found),
            Some(Step::Run(Stage::DeviceInfo))
        );
        assert_eq!(d.advance(p, Stage::DeviceInfo, Outcome::Found), Some(Step::Complete));
        assert_eq!(d.in_flight(), 0);
    }

    #[test]
    fn every_outcome_combination_completes_once() {
        for a in OUTCOMES {
            for b in OUTCOMES {
                for c in OUTCOMES {
                    for e in OUTCOMES {
                        let mut d: DiscoveryOrchestrator = DiscoveryOrchestrator::new();
                        let p = PeerId::new(1);
                        let mut step = d.begin(p, ChainKind::Primary);
                        let mut completions = 0;
                        for outcome in [a, b, c, e] {
                            let Step::Run(stage) = step else {
                                panic!("chain ended early");
                            };
                            step = d.advance(p, stage, outcome).unwrap();
                            if step == Step::Complete {
                                completions += 1;
                            }
                        }
                        assert_eq!(completions, 1);
                        assert_eq!(d.advance(p, Stage::DeviceInfo, Outcome::Found), None);
                    }
                }
            }
        }
    }

    #[test]
    fn accessory_chain_is_uart_then_mtu() {
        let mut d: DiscoveryOrchestrator = DiscoveryOrchestrator::new();
        let p = PeerId::new(2);
        assert_eq!(d.begin(p, ChainKind::Accessory), Step::Run(Stage::Uart));
        assert_eq!(d.advance(p, Stage::Uart, Outcome::Error), Some(Step::Run(Stage::Mtu)));
        assert_eq!(d.advance(p, Stage::Mtu, Outcome::Found), Some(Step::Complete));
    }

    #[test]
    fn chains_are_independent_per_peer() {
        let mut d: DiscoveryOrchestrator = DiscoveryOrchestrator::new();
        let (p0, p1) = (PeerId::new(0), PeerId::new(1));
        d.begin(p0, ChainKind::Primary);
        d.begin(p1, ChainKind::Accessory);
        d.advance(p0, Stage::Uart, Outcome::Found);
        assert_eq!(d.current(p0), Some(Stage::Hid));
        assert_eq!(d.current(p1), Some(Stage::Uart));
        assert_eq!(d.in_flight(), 2);
    }

    #[test]
    fn mismatched_stage_is_ignored() {
        let mut d: DiscoveryOrchestrator = DiscoveryOrchestrator::new();
        let p = PeerId::new(0);
        d.begin(p, ChainKind::Primary);
        assert_eq!(d.advance(p, Stage::Battery, Outcome::Found), None);
        assert_eq!(d.current(p), Some(Stage::Uart));
    }

    #[test]
    fn cancelled_chain_ignores_late_results() {
        let mut d: DiscoveryOrchestrator = DiscoveryOrchestrator::new();
        let p = PeerId::new(0);
        d.begin(p, ChainKind::Primary);
        d.cancel(p);
        assert_eq!(d.advance(p, Stage::Uart, Outcome::Found), None);
        assert_eq!(d.current(p), None);
    }

    #[test]
    fn out_of_range_peer() {
        let mut d: DiscoveryOrchestrator<1> = DiscoveryOrchestrator::new();
        let p = PeerId::new(5);
        assert_eq!(d.begin(p, ChainKind::Primary), Step::Complete);
        assert_eq!(d.advance(p, Stage::Uart, Outcome::Found), None);
    }
}
