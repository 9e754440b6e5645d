use serde::{Deserialize, Serialize};
use tm_core::sync::SyncAction;

use crate::client::ClientId;
use crate::rng::DeterministicRng;

/// Fault injection for client-to-server calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of calls that never reach the server and time out.
    pub drop_rate_percent: u8,
    /// Percentage of calls the server refuses with an application error.
    pub error_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 10,
            error_rate_percent: 5,
        }
    }
}

impl FaultConfig {
    /// No faults and immediate delivery.
    #[must_use]
    pub const fn calm() -> Self {
        Self {
            max_delay_rounds: 0,
            drop_rate_percent: 0,
            error_rate_percent: 0,
        }
    }
}

/// What goes wrong with a call, decided when it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// The request is lost; the client sees a timeout.
    Dropped,
    /// The server answers with a non-ok response without acting on it.
    Refused,
}

/// A call in transit.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub client: ClientId,
    pub seq: u64,
    pub action: SyncAction,
    pub fault: Option<Fault>,
}

#[derive(Debug, Clone, PartialEq)]
struct Pending {
    deliver_at_round: u64,
    envelope: Envelope,
}

/// Result of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub seq: u64,
    pub fault: Option<Fault>,
    pub delay_rounds: u8,
}

/// Deterministic fault-injecting link between clients and the server.
/// Every call is eventually delivered, possibly as a failure, so clients
/// never wait on a request forever.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedNetwork {
    pending: Vec<Pending>,
    fault: FaultConfig,
    next_seq: u64,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            fault,
            next_seq: 0,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Replace the fault settings for calls sent from now on. Calls already
    /// in transit keep their fate.
    pub const fn set_fault_config(&mut self, fault: FaultConfig) {
        self.fault = fault;
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn send(
        &mut self,
        client: ClientId,
        action: SyncAction,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        let seq = self.next_seq;
        self.next_seq += 1;

        let fault = if rng.hit_rate_percent(self.fault.drop_rate_percent) {
            Some(Fault::Dropped)
        } else if rng.hit_rate_percent(self.fault.error_rate_percent) {
            Some(Fault::Refused)
        } else {
            None
        };
        let delay_bound = u64::from(self.fault.max_delay_rounds) + 1;
        let delay_rounds =
            u8::try_from(rng.next_bounded(delay_bound)).unwrap_or(self.fault.max_delay_rounds);

        self.pending.push(Pending {
            deliver_at_round: round + u64::from(delay_rounds),
            envelope: Envelope {
                client,
                seq,
                action,
                fault,
            },
        });
        SendOutcome {
            seq,
            fault,
            delay_rounds,
        }
    }

    /// Remove and return every call due by `round`, ordered by client and
    /// then by send order.
    pub fn deliver_ready(&mut self, round: u64) -> Vec<Envelope> {
        let (ready, future): (Vec<Pending>, Vec<Pending>) = self
            .pending
            .drain(..)
            .partition(|p| p.deliver_at_round <= round);
        self.pending = future;

        let mut ready: Vec<Envelope> = ready.into_iter().map(|p| p.envelope).collect();
        ready.sort_by_key(|e| (e.client, e.seq));
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_core::sync::{PullRequest, SyncCursor};

    fn pull() -> SyncAction {
        SyncAction::Pull(PullRequest {
            since: SyncCursor::BEGINNING,
        })
    }

    #[test]
    fn calm_network_delivers_in_the_same_round() {
        let mut net = SimulatedNetwork::new(FaultConfig::calm());
        let mut rng = DeterministicRng::new(1);
        let out = net.send(0, pull(), 4, &mut rng);
        assert_eq!(out.fault, None);
        assert_eq!(out.delay_rounds, 0);
        assert_eq!(net.deliver_ready(4).len(), 1);
        assert_eq!(net.pending_len(), 0);
    }

    #[test]
    fn delayed_calls_wait_for_their_round() {
        let fault = FaultConfig {
            max_delay_rounds: 3,
            ..FaultConfig::calm()
        };
        let mut net = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(9);
        let delays: Vec<u8> = (0..20).map(|_| net.send(1, pull(), 0, &mut rng).delay_rounds).collect();
        assert!(delays.iter().all(|d| *d <= 3));

        let mut delivered = 0;
        for round in 0..=3 {
            let ready = net.deliver_ready(round);
            let due = delays.iter().filter(|d| u64::from(**d) == round).count();
            assert_eq!(ready.len(), due);
            delivered += ready.len();
        }
        assert_eq!(delivered, 20);
    }

    #[test]
    fn delivery_is_ordered_by_client_then_seq() {
        let mut net = SimulatedNetwork::new(FaultConfig::calm());
        let mut rng = DeterministicRng::new(2);
        net.send(2, pull(), 0, &mut rng);
        net.send(0, pull(), 0, &mut rng);
        net.send(2, pull(), 0, &mut rng);
        let order: Vec<(usize, u64)> = net.deliver_ready(0).iter().map(|e| (e.client, e.seq)).collect();
        assert_eq!(order, vec![(0, 1), (2, 0), (2, 2)]);
    }

    #[test]
    fn always_drop_marks_every_call() {
        let fault = FaultConfig {
            drop_rate_percent: 100,
            ..FaultConfig::calm()
        };
        let mut net = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(3);
        let out = net.send(0, pull(), 0, &mut rng);
        assert_eq!(out.fault, Some(Fault::Dropped));
        assert_eq!(net.deliver_ready(0)[0].fault, Some(Fault::Dropped));
    }
}
