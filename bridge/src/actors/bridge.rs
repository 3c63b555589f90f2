//! AgentBridgeActor - coordinates one scrape job with a worker-agent.
//!
//! The bridge is the single subscription point on the broadcast bus. It owns
//! three concerns that the protocol intertwines:
//!
//! - **probing**: is a cooperating worker-agent out there at all?
//! - **dispatching**: publish exactly one START_TASK per job;
//! - **routing**: classify inbound traffic by kind and source, drop foreign
//!   noise, and forward recognized events to the registered listener.
//!
//! All state lives inside the actor and is mutated only by its serialized
//! mailbox; timers are tokio tasks casting back into the mailbox, guarded by
//! a generation counter so a stale timeout or tick can never act on state
//! that has already moved on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SpawnErr};
use shared_types::{
    CompletePayload, ErrorPayload, JobDescriptor, MessageKind, ProgressPayload, ProtocolMessage,
    CONTROLLER_SOURCE,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::actors::bus::{publish_message, BusDelivery, BusMsg, BusTap};
use crate::actors::simulation::{
    SimulatedAgentActor, SimulatedAgentArguments, SimulatedAgentMsg,
};
use crate::config::BridgeConfig;

// ============================================================================
// Caller-Facing Types
// ============================================================================

/// Events the bridge delivers to its registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Agent detection changed (probe answered, or probe timed out).
    StatusChange(bool),
    /// A PROGRESS message for the in-flight job.
    Progress { pages: u32, ads: u32 },
    /// The in-flight job finished with final totals.
    Complete { pages: u32, ads: u32 },
    /// The worker-agent (or simulation) reported a failure.
    Error(String),
}

/// Synchronously-surfaced caller errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("no worker-agent detected and simulation is not active")]
    AgentUnavailable,
    #[error("a job is already dispatched on this bridge")]
    AlreadyDispatched,
    #[error("broadcast bus rejected the message: {0}")]
    Bus(String),
    #[error("bridge is no longer running")]
    Terminated,
}

/// Lifecycle of one bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Idle,
    Probing,
    Detected,
    Undetected,
    Dispatched,
    Running,
}

/// Snapshot of bridge state, for callers that need to check readiness.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeState {
    pub phase: BridgePhase,
    pub agent_detected: bool,
    pub probing: bool,
    pub dispatched: bool,
    pub running: bool,
    pub simulating: bool,
    pub last_probe_reply_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Actor Protocol
// ============================================================================

/// Messages handled by AgentBridgeActor.
#[derive(Debug)]
pub enum BridgeMsg {
    /// Broadcast a PROBE and arm (or re-arm) the detection timeout.
    Probe,

    /// Publish START_TASK for `job` if the bridge is ready.
    Dispatch {
        job: JobDescriptor,
        reply: RpcReplyPort<Result<(), BridgeError>>,
    },

    /// Spin up the local simulated agent for `job`.
    StartSimulation { job: JobDescriptor },

    /// Cancel the simulated agent silently.
    StopSimulation,

    /// Raw traffic from the bus.
    Delivery(BusDelivery),

    /// Probe timeout fired; stale generations are discarded.
    ProbeTimeout { generation: u64 },

    /// Snapshot the current state.
    GetState { reply: RpcReplyPort<BridgeState> },

    /// Tear the bridge down; nothing is processed afterwards.
    Shutdown,
}

impl From<BusDelivery> for BridgeMsg {
    fn from(delivery: BusDelivery) -> Self {
        BridgeMsg::Delivery(delivery)
    }
}

#[derive(Debug, Clone)]
pub struct AgentBridgeArguments {
    pub bus: ActorRef<BusMsg>,
    pub listener: ActorRef<BridgeEvent>,
    pub config: BridgeConfig,
}

pub struct AgentBridgeState {
    bus: ActorRef<BusMsg>,
    listener: ActorRef<BridgeEvent>,
    config: BridgeConfig,
    tap: ActorRef<BusDelivery>,

    phase: BridgePhase,
    agent_detected: bool,
    probing: bool,
    dispatched: bool,
    running: bool,
    last_probe_reply_at: Option<DateTime<Utc>>,

    probe_generation: u64,
    probe_timeout: Option<JoinHandle<()>>,
    simulation: Option<ActorRef<SimulatedAgentMsg>>,
}

impl AgentBridgeState {
    fn snapshot(&self) -> BridgeState {
        BridgeState {
            phase: self.phase,
            agent_detected: self.agent_detected,
            probing: self.probing,
            dispatched: self.dispatched,
            running: self.running,
            simulating: self.simulation.is_some(),
            last_probe_reply_at: self.last_probe_reply_at,
        }
    }

    /// A run (real or simulated) is in flight and its traffic is welcome.
    fn accepting_run_traffic(&self) -> bool {
        self.dispatched || self.simulation.is_some()
    }

    fn settled_phase(&self) -> BridgePhase {
        if self.agent_detected {
            BridgePhase::Detected
        } else {
            BridgePhase::Undetected
        }
    }

    fn notify(&self, event: BridgeEvent) {
        if let Err(e) = self.listener.cast(event) {
            tracing::warn!(error = %e, "Bridge listener is gone; dropping event");
        }
    }

    fn cancel_probe_timeout(&mut self) {
        self.probe_generation += 1;
        if let Some(timer) = self.probe_timeout.take() {
            timer.abort();
        }
    }

    /// Reset after COMPLETE/ERROR/cancel so a fresh job can be dispatched.
    fn reset_run(&mut self) {
        self.dispatched = false;
        self.running = false;
        self.simulation = None;
        self.phase = self.settled_phase();
    }
}

#[derive(Debug, Default)]
pub struct AgentBridgeActor;

#[async_trait]
impl Actor for AgentBridgeActor {
    type Msg = BridgeMsg;
    type State = AgentBridgeState;
    type Arguments = AgentBridgeArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (tap, _) = Actor::spawn(None, BusTap::<BridgeMsg>::new(), myself.clone()).await?;
        args.bus
            .cast(BusMsg::Subscribe {
                subscriber: tap.clone(),
            })
            .map_err(|e| ActorProcessingErr::from(format!("bus subscribe failed: {e}")))?;

        Ok(AgentBridgeState {
            bus: args.bus,
            listener: args.listener,
            config: args.config,
            tap,
            phase: BridgePhase::Idle,
            agent_detected: false,
            probing: false,
            dispatched: false,
            running: false,
            last_probe_reply_at: None,
            probe_generation: 0,
            probe_timeout: None,
            simulation: None,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "AgentBridgeActor started; probing");
        let _ = myself.cast(BridgeMsg::Probe);
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BridgeMsg::Probe => self.handle_probe(myself, state),
            BridgeMsg::Dispatch { job, reply } => {
                let result = self.handle_dispatch(job, state);
                let _ = reply.send(result);
            }
            BridgeMsg::StartSimulation { job } => {
                self.handle_start_simulation(job, state).await;
            }
            BridgeMsg::StopSimulation => self.handle_stop_simulation(state),
            BridgeMsg::Delivery(delivery) => self.handle_delivery(delivery, state),
            BridgeMsg::ProbeTimeout { generation } => {
                self.handle_probe_timeout(generation, state)
            }
            BridgeMsg::GetState { reply } => {
                let _ = reply.send(state.snapshot());
            }
            BridgeMsg::Shutdown => {
                myself.stop(None);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.cancel_probe_timeout();
        if let Some(simulation) = state.simulation.take() {
            simulation.stop(None);
        }
        let _ = state.bus.cast(BusMsg::Unsubscribe {
            subscriber: state.tap.clone(),
        });
        state.tap.stop(None);
        tracing::info!(actor_id = %myself.get_id(), "AgentBridgeActor stopped");
        Ok(())
    }
}

impl AgentBridgeActor {
    fn handle_probe(&self, myself: ActorRef<BridgeMsg>, state: &mut AgentBridgeState) {
        // Re-probing supersedes any timeout already in flight.
        state.cancel_probe_timeout();
        state.probing = true;
        if !state.accepting_run_traffic() {
            state.phase = BridgePhase::Probing;
        }

        let probe = ProtocolMessage::probe(CONTROLLER_SOURCE);
        if let Err(e) = publish_message(&state.bus, &probe) {
            tracing::warn!(error = %e, "Probe publish failed; timeout will report undetected");
        }

        let generation = state.probe_generation;
        let timeout = state.config.probe_timeout();
        state.probe_timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = myself.cast(BridgeMsg::ProbeTimeout { generation });
        }));
        tracing::debug!(generation, timeout_ms = state.config.probe_timeout_ms, "Probe sent");
    }

    fn handle_probe_timeout(&self, generation: u64, state: &mut AgentBridgeState) {
        if generation != state.probe_generation || !state.probing {
            tracing::debug!(generation, "Stale probe timeout discarded");
            return;
        }
        state.probing = false;
        state.probe_timeout = None;
        state.agent_detected = false;
        if !state.accepting_run_traffic() {
            state.phase = BridgePhase::Undetected;
        }
        tracing::info!("No worker-agent answered the probe");
        state.notify(BridgeEvent::StatusChange(false));
    }

    fn handle_dispatch(
        &self,
        job: JobDescriptor,
        state: &mut AgentBridgeState,
    ) -> Result<(), BridgeError> {
        if state.dispatched {
            return Err(BridgeError::AlreadyDispatched);
        }
        if !state.agent_detected && state.simulation.is_none() {
            return Err(BridgeError::AgentUnavailable);
        }

        let start = ProtocolMessage::start_task(CONTROLLER_SOURCE, &job);
        publish_message(&state.bus, &start).map_err(BridgeError::Bus)?;

        state.dispatched = true;
        state.phase = BridgePhase::Dispatched;
        tracing::info!(
            job_id = %job.job_id,
            target_site = %job.target_site,
            task_type = %job.task_type,
            "Job dispatched"
        );
        Ok(())
    }

    async fn handle_start_simulation(&self, job: JobDescriptor, state: &mut AgentBridgeState) {
        if state.simulation.is_some() || state.dispatched {
            tracing::debug!("Simulation start ignored; a run is already active");
            return;
        }

        let page_target = job.page_target(state.config.default_page_target);
        let args = SimulatedAgentArguments {
            bus: state.bus.clone(),
            job,
            reply_delay: state.config.sim_reply_delay(),
            tick_interval: state.config.sim_tick_interval(),
            page_target,
            fail_after_pages: None,
        };
        match Actor::spawn(None, SimulatedAgentActor, args).await {
            Ok((simulation, _)) => {
                state.simulation = Some(simulation);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn simulated agent");
            }
        }
    }

    fn handle_stop_simulation(&self, state: &mut AgentBridgeState) {
        let Some(simulation) = state.simulation.take() else {
            tracing::debug!("Simulation stop ignored; nothing is running");
            return;
        };
        simulation.stop(None);
        state.reset_run();
        tracing::info!("Simulation cancelled");
    }

    fn handle_delivery(&self, delivery: BusDelivery, state: &mut AgentBridgeState) {
        let Some(message) = ProtocolMessage::from_value(&delivery.0) else {
            tracing::trace!("Undecodable channel traffic dropped");
            return;
        };
        // The bus echoes our own PROBE and START_TASK back to us.
        if message.source == CONTROLLER_SOURCE {
            return;
        }
        if !message.is_from_recognized_peer() {
            tracing::debug!(source = %message.source, "Foreign channel traffic dropped");
            return;
        }

        match message.kind {
            MessageKind::ProbeReply => self.on_probe_reply(state),
            MessageKind::Progress => self.on_progress(&message, state),
            MessageKind::Complete => self.on_complete(&message, state),
            MessageKind::Error => self.on_error(&message, state),
            MessageKind::Probe | MessageKind::StartTask => {
                tracing::debug!(kind = %message.kind, source = %message.source, "Controller-bound kind from peer dropped");
            }
        }
    }

    fn on_probe_reply(&self, state: &mut AgentBridgeState) {
        if state.probing {
            state.probing = false;
            state.cancel_probe_timeout();
        }
        state.last_probe_reply_at = Some(Utc::now());
        if state.agent_detected {
            tracing::debug!("Duplicate probe reply ignored");
            return;
        }
        state.agent_detected = true;
        if !state.accepting_run_traffic() {
            state.phase = BridgePhase::Detected;
        }
        tracing::info!("Worker-agent detected");
        state.notify(BridgeEvent::StatusChange(true));
    }

    fn on_progress(&self, message: &ProtocolMessage, state: &mut AgentBridgeState) {
        if !state.accepting_run_traffic() {
            tracing::debug!("Progress with no run in flight dropped");
            return;
        }
        let Some(ProgressPayload { pages, ads }) = message.decode_payload() else {
            tracing::debug!("Progress with invalid payload dropped");
            return;
        };
        // First progress doubles as the dispatch acknowledgement.
        state.running = true;
        state.phase = BridgePhase::Running;
        // Counters are forwarded verbatim; monotonicity is the agent's business.
        state.notify(BridgeEvent::Progress { pages, ads });
    }

    fn on_complete(&self, message: &ProtocolMessage, state: &mut AgentBridgeState) {
        if !state.accepting_run_traffic() {
            tracing::debug!("Complete with no run in flight dropped");
            return;
        }
        let Some(CompletePayload { pages, ads }) = message.decode_payload() else {
            tracing::debug!("Complete with invalid payload dropped");
            return;
        };
        state.reset_run();
        tracing::info!(pages, ads, "Job completed");
        state.notify(BridgeEvent::Complete { pages, ads });
    }

    fn on_error(&self, message: &ProtocolMessage, state: &mut AgentBridgeState) {
        if !state.accepting_run_traffic() {
            tracing::debug!("Error report with no run in flight dropped");
            return;
        }
        let reason = message
            .decode_payload::<ErrorPayload>()
            .map(|p| p.message)
            .unwrap_or_else(|| "worker-agent reported an unspecified error".to_string());
        state.reset_run();
        tracing::warn!(reason = %reason, "Job failed");
        state.notify(BridgeEvent::Error(reason));
    }
}

// ============================================================================
// Caller Facade
// ============================================================================

/// Typed facade over the bridge actor, the API callers hold on to.
#[derive(Clone)]
pub struct BridgeHandle {
    actor: ActorRef<BridgeMsg>,
}

impl BridgeHandle {
    /// Spawn a bridge on `bus`, delivering events to `listener`.
    ///
    /// The bridge probes for a worker-agent immediately.
    pub async fn spawn(
        bus: ActorRef<BusMsg>,
        listener: ActorRef<BridgeEvent>,
        config: BridgeConfig,
    ) -> Result<Self, SpawnErr> {
        let (actor, _) = Actor::spawn(
            None,
            AgentBridgeActor,
            AgentBridgeArguments {
                bus,
                listener,
                config,
            },
        )
        .await?;
        Ok(Self { actor })
    }

    /// Re-run detection; supersedes any probe already in flight.
    pub fn probe(&self) -> Result<(), BridgeError> {
        self.actor
            .cast(BridgeMsg::Probe)
            .map_err(|_| BridgeError::Terminated)
    }

    /// Dispatch `job`; rejected synchronously when the bridge is not ready
    /// or a job is already in flight.
    pub async fn dispatch(&self, job: JobDescriptor) -> Result<(), BridgeError> {
        ractor::call!(self.actor, |reply| BridgeMsg::Dispatch { job, reply })
            .map_err(|_| BridgeError::Terminated)?
    }

    /// Run `job` against the local simulated agent.
    pub fn start_simulation(&self, job: JobDescriptor) -> Result<(), BridgeError> {
        self.actor
            .cast(BridgeMsg::StartSimulation { job })
            .map_err(|_| BridgeError::Terminated)
    }

    /// Cancel a simulated run silently.
    pub fn stop_simulation(&self) -> Result<(), BridgeError> {
        self.actor
            .cast(BridgeMsg::StopSimulation)
            .map_err(|_| BridgeError::Terminated)
    }

    /// Snapshot the bridge state.
    pub async fn state(&self) -> Result<BridgeState, BridgeError> {
        ractor::call!(self.actor, |reply| BridgeMsg::GetState { reply })
            .map_err(|_| BridgeError::Terminated)
    }

    /// Tear down: unsubscribe from the bus and stop all timers. Messages
    /// still on the channel are never processed afterwards.
    pub fn shutdown(&self) {
        let _ = self.actor.cast(BridgeMsg::Shutdown);
    }
}

/// Forwards bridge events into a tokio channel for non-actor callers.
#[derive(Debug, Default)]
pub struct ChannelListener;

#[async_trait]
impl Actor for ChannelListener {
    type Msg = BridgeEvent;
    type State = mpsc::UnboundedSender<BridgeEvent>;
    type Arguments = mpsc::UnboundedSender<BridgeEvent>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = state.send(message);
        Ok(())
    }
}
