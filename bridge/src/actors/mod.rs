pub mod bridge;
pub mod bus;
pub mod simulation;

#[cfg(test)]
mod bridge_test;

pub use bridge::{AgentBridgeActor, BridgeEvent, BridgeHandle, BridgeState, ChannelListener};
pub use bus::{BroadcastBusActor, BusDelivery, BusMsg};
pub use simulation::SimulatedAgentActor;
