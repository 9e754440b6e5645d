//! tm-sim library.
//!
//! Deterministic multi-client simulation of tm's sync protocol. Several
//! clients edit their own tasks and synchronize through one in-process
//! server over an unreliable network. A quiet phase at the end lets
//! everything settle, after which the oracle checks that every client
//! agrees with the server.
//!
//! All clients share one hand-driven clock. Within a round, client `i`
//! acts at `round * 100 + i` ms and receives replies at
//! `round * 100 + 50 + i` ms, so no two clients ever stamp the same
//! instant.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod client;
pub mod network;
pub mod oracle;
pub mod rng;

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tm_core::clock::ManualClock;
use tm_core::config::SyncConfig;
use tm_core::error::SyncError;
use tm_core::model::TaskRecord;
use tm_core::sync::wire::{RESPONSE_UNKNOWN, encode, error_envelope};
use tm_core::sync::{Endpoint, MemoryRemote, SyncAction};
use tracing::{debug, info};

use crate::client::{ClientAction, ClientId, ClientState, SimulatedClient};
use crate::network::{Fault, FaultConfig, SimulatedNetwork};
use crate::oracle::{ConvergenceOracle, ConvergenceReport};
use crate::rng::DeterministicRng;

/// Simulated time at round zero.
pub const BASE_MILLIS: i64 = 1_760_000_000_000;
/// Simulated time per round.
pub const ROUND_MILLIS: i64 = 100;
const REPLY_OFFSET_MILLIS: i64 = 50;
/// Client instants are offset by client id inside half a round.
pub const MAX_CLIENTS: usize = 50;
/// Keeps the task id stream apart from the action stream of the same seed.
const ID_STREAM_SALT: u64 = 0x7461_736b_5f69_6473;

/// Parameters for one simulated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub client_count: usize,
    /// Rounds with user activity and faults.
    pub rounds: u64,
    /// Fault-free rounds after activity stops.
    pub quiet_rounds: u64,
    /// Chance per round that a client performs an action.
    pub action_rate_percent: u8,
    pub fault: FaultConfig,
    pub sync: SyncConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            client_count: 3,
            rounds: 60,
            quiet_rounds: 40,
            action_rate_percent: 30,
            fault: FaultConfig::default(),
            sync: SyncConfig {
                push_delay_ms: 300,
                pull_interval_ms: 1_000,
            },
        }
    }
}

impl SimulationConfig {
    /// The round at which every client re-examines its tasks: after every
    /// call sent under faults has been delivered.
    #[must_use]
    pub fn refresh_round(&self) -> u64 {
        self.rounds + u64::from(self.fault.max_delay_rounds) + 1
    }

    /// Quiet rounds needed after the refresh for one push and two pull
    /// cycles to complete.
    #[must_use]
    pub fn min_quiet_rounds(&self) -> u64 {
        let round = ROUND_MILLIS.unsigned_abs();
        let settle = (self.sync.push_delay_ms + 2 * self.sync.pull_interval_ms).div_ceil(round);
        u64::from(self.fault.max_delay_rounds) + 1 + settle
    }

    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.client_count == 0 || self.client_count > MAX_CLIENTS {
            bail!("client_count must be in 1..={MAX_CLIENTS}");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.quiet_rounds < self.min_quiet_rounds() {
            bail!(
                "quiet_rounds must be >= {} for these delays",
                self.min_quiet_rounds()
            );
        }
        Ok(())
    }
}

/// What happened at one step of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEventKind {
    Act(ClientAction),
    Send {
        seq: u64,
        call: Endpoint,
        delay_rounds: u8,
        fault: Option<Fault>,
    },
    Settle {
        seq: u64,
        ok: bool,
    },
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub client: ClientId,
    pub kind: TraceEventKind,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub trace: Vec<TraceEvent>,
    pub states: Vec<ClientState>,
    /// Server content by task id, versions cleared.
    pub server: BTreeMap<String, TaskRecord>,
    pub convergence: ConvergenceReport,
    pub faults_injected: usize,
    /// At least one call failed, so recovery paths were exercised.
    pub interesting_state_reached: bool,
}

/// Runs one seed.
pub struct Simulator {
    config: SimulationConfig,
    clock: ManualClock,
    remote: MemoryRemote,
    clients: Vec<SimulatedClient>,
    network: SimulatedNetwork,
    rng: DeterministicRng,
    trace: Vec<TraceEvent>,
    faults_injected: usize,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let clock = ManualClock::new(BASE_MILLIS);
        let remote = MemoryRemote::new(Rc::new(clock.clone()));
        let mut ids = DeterministicRng::new(config.seed ^ ID_STREAM_SALT);
        let clients = (0..config.client_count)
            .map(|id| SimulatedClient::new(id, &clock, config.sync, instant(0, id, 0), ids.fork()))
            .collect();
        Ok(Self {
            config,
            clock,
            remote,
            clients,
            network: SimulatedNetwork::new(config.fault),
            rng: DeterministicRng::new(config.seed),
            trace: Vec::new(),
            faults_injected: 0,
        })
    }

    /// # Errors
    ///
    /// Returns an error on an internal failure: a request that cannot be
    /// encoded or a store operation rejected on a client's own task.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let total = self.config.rounds + self.config.quiet_rounds;
        let refresh_round = self.config.refresh_round();

        for round in 0..total {
            if round == self.config.rounds {
                debug!(round, "quiet phase");
                self.network.set_fault_config(FaultConfig::calm());
            }
            let active = round < self.config.rounds;
            self.client_phase(round, active, round == refresh_round)?;
            self.delivery_phase(round)?;
        }

        let states: Vec<ClientState> = self.clients.iter().map(SimulatedClient::snapshot).collect();
        let server = self.server_records()?;
        let convergence = ConvergenceOracle::evaluate(&states, &server);
        info!(
            seed = self.config.seed,
            tasks = server.len(),
            faults = self.faults_injected,
            converged = convergence.converged,
            "simulation finished"
        );
        Ok(SimulationResult {
            trace: std::mem::take(&mut self.trace),
            states,
            server,
            convergence,
            faults_injected: self.faults_injected,
            interesting_state_reached: self.faults_injected > 0,
        })
    }

    fn record(&mut self, round: u64, client: ClientId, kind: TraceEventKind) {
        self.trace.push(TraceEvent {
            round,
            client,
            kind,
        });
    }

    fn client_phase(&mut self, round: u64, active: bool, refresh: bool) -> Result<()> {
        for id in 0..self.clients.len() {
            let now = instant(round, id, 0);
            self.clock.set(now);

            if refresh {
                self.clients[id].refresh(now);
                self.record(round, id, TraceEventKind::Refresh);
            }
            if active && self.rng.hit_rate_percent(self.config.action_rate_percent) {
                let action = self.clients[id]
                    .act(&mut self.rng, now)
                    .with_context(|| format!("client {id} action in round {round}"))?;
                self.record(round, id, TraceEventKind::Act(action));
            }

            for action in self.clients[id].turn(now) {
                let call = match &action {
                    SyncAction::Push(_) => Endpoint::Save,
                    SyncAction::Pull(_) => Endpoint::Tasks,
                };
                let sent = self.network.send(id, action, round, &mut self.rng);
                if sent.fault.is_some() {
                    self.faults_injected += 1;
                }
                self.record(
                    round,
                    id,
                    TraceEventKind::Send {
                        seq: sent.seq,
                        call,
                        delay_rounds: sent.delay_rounds,
                        fault: sent.fault,
                    },
                );
            }
        }
        Ok(())
    }

    fn delivery_phase(&mut self, round: u64) -> Result<()> {
        for envelope in self.network.deliver_ready(round) {
            let now = instant(round, envelope.client, REPLY_OFFSET_MILLIS);
            self.clock.set(now);

            let reply = match envelope.fault {
                Some(Fault::Dropped) => Err(SyncError::Transport("request timed out".into())),
                Some(Fault::Refused) => Ok(error_envelope(RESPONSE_UNKNOWN)),
                None => Ok(self.serve(&envelope.action)?),
            };
            let ok = reply.is_ok() && envelope.fault.is_none();
            self.clients[envelope.client]
                .settle(&envelope.action, reply, now)
                .with_context(|| format!("client {} settling call {}", envelope.client, envelope.seq))?;
            self.record(
                round,
                envelope.client,
                TraceEventKind::Settle {
                    seq: envelope.seq,
                    ok,
                },
            );
        }
        Ok(())
    }

    fn serve(&self, action: &SyncAction) -> Result<Value> {
        let (endpoint, body) = match action {
            SyncAction::Push(batch) => (Endpoint::Save, encode(&batch.request)?),
            SyncAction::Pull(request) => (Endpoint::Tasks, encode(request)?),
        };
        Ok(self.remote.handle(endpoint, &body))
    }

    fn server_records(&self) -> Result<BTreeMap<String, TaskRecord>> {
        self.remote
            .records()
            .into_iter()
            .map(|(id, value)| {
                let record: TaskRecord = serde_json::from_value(value)
                    .with_context(|| format!("server content for {id}"))?;
                Ok((id, record.without_version()))
            })
            .collect()
    }
}

/// Simulated time for `client` in `round`, plus `offset` ms.
fn instant(round: u64, client: ClientId, offset: i64) -> i64 {
    let round = i64::try_from(round).unwrap_or(i64::MAX / ROUND_MILLIS);
    let client = i64::try_from(client).unwrap_or(0);
    BASE_MILLIS + round * ROUND_MILLIS + offset + client
}
