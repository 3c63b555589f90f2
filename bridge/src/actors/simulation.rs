//! SimulatedAgentActor - local stand-in for a real worker-agent.
//!
//! Speaks the same wire protocol over the bus under the "simulation" source:
//! a delayed PROBE_REPLY, then PROGRESS at a fixed cadence with a
//! pseudo-random ad increment per page, then a single COMPLETE at the page
//! target. Stopping the actor cancels its timers silently; no COMPLETE or
//! ERROR is emitted for a cancelled run.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use rand::Rng;
use shared_types::{JobDescriptor, ProtocolMessage, SIMULATION_SOURCE};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::actors::bus::{publish_message, BusMsg};

#[derive(Debug, Clone)]
pub struct SimulatedAgentArguments {
    pub bus: ActorRef<BusMsg>,
    pub job: JobDescriptor,
    pub reply_delay: Duration,
    pub tick_interval: Duration,
    pub page_target: u32,
    /// Emit ERROR instead of PROGRESS once this many pages are reached.
    pub fail_after_pages: Option<u32>,
}

#[derive(Debug)]
pub enum SimulatedAgentMsg {
    /// Fires once after `reply_delay`; answers the probe and starts ticking.
    EmitReply,
    /// One simulated page scraped.
    Tick,
}

pub struct SimulatedAgentState {
    bus: ActorRef<BusMsg>,
    job: JobDescriptor,
    tick_interval: Duration,
    page_target: u32,
    fail_after_pages: Option<u32>,
    pages_done: u32,
    ads_total: u32,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub struct SimulatedAgentActor;

#[async_trait]
impl Actor for SimulatedAgentActor {
    type Msg = SimulatedAgentMsg;
    type State = SimulatedAgentState;
    type Arguments = SimulatedAgentArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            job_id = %args.job.job_id,
            page_target = args.page_target,
            "Simulated agent starting"
        );

        let reply_ref = myself.clone();
        let reply_delay = args.reply_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(reply_delay).await;
            let _ = reply_ref.cast(SimulatedAgentMsg::EmitReply);
        });

        Ok(SimulatedAgentState {
            bus: args.bus,
            job: args.job,
            tick_interval: args.tick_interval,
            page_target: args.page_target,
            fail_after_pages: args.fail_after_pages,
            pages_done: 0,
            ads_total: 0,
            timer: Some(timer),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SimulatedAgentMsg::EmitReply => {
                self.publish(state, ProtocolMessage::probe_reply(SIMULATION_SOURCE));

                let tick_ref = myself.clone();
                let interval = state.tick_interval;
                state.timer = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        if tick_ref.cast(SimulatedAgentMsg::Tick).is_err() {
                            break;
                        }
                    }
                }));
            }
            SimulatedAgentMsg::Tick => {
                state.pages_done += 1;
                let ad_increment: u32 = rand::rng().random_range(1..=5);
                state.ads_total += ad_increment;

                if state
                    .fail_after_pages
                    .is_some_and(|n| state.pages_done >= n)
                {
                    if let Some(timer) = state.timer.take() {
                        timer.abort();
                    }
                    self.publish(
                        state,
                        ProtocolMessage::error_report(
                            SIMULATION_SOURCE,
                            format!("simulated failure on page {}", state.pages_done),
                        ),
                    );
                    myself.stop(None);
                    return Ok(());
                }

                self.publish(
                    state,
                    ProtocolMessage::progress(SIMULATION_SOURCE, state.pages_done, state.ads_total),
                );

                if state.pages_done >= state.page_target {
                    if let Some(timer) = state.timer.take() {
                        timer.abort();
                    }
                    self.publish(
                        state,
                        ProtocolMessage::complete(
                            SIMULATION_SOURCE,
                            state.pages_done,
                            state.ads_total,
                        ),
                    );
                    tracing::info!(
                        job_id = %state.job.job_id,
                        pages = state.pages_done,
                        ads = state.ads_total,
                        "Simulated agent finished"
                    );
                    myself.stop(None);
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // Silent cancellation path: abort timers, emit nothing.
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        Ok(())
    }
}

impl SimulatedAgentActor {
    fn publish(&self, state: &SimulatedAgentState, message: ProtocolMessage) {
        if let Err(e) = publish_message(&state.bus, &message) {
            tracing::warn!(kind = %message.kind, error = %e, "Simulation publish failed");
        }
    }
}
