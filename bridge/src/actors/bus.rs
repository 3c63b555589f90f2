//! BroadcastBusActor - the ambient shared channel between controller and agent.
//!
//! The channel carries raw JSON and knows nothing about the protocol: every
//! publish is echoed to every subscriber, including the publisher itself.
//! Typing and source filtering happen at the subscriber edge (see
//! `ProtocolMessage::from_value`), never on the bus.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::ProtocolMessage;
use std::marker::PhantomData;

/// A raw value delivered to a bus subscriber.
#[derive(Debug, Clone)]
pub struct BusDelivery(pub serde_json::Value);

/// Messages handled by BroadcastBusActor.
#[derive(Debug)]
pub enum BusMsg {
    /// Broadcast a raw value to every subscriber.
    Publish { message: serde_json::Value },

    /// Attach a subscriber; duplicate subscriptions are ignored.
    Subscribe { subscriber: ActorRef<BusDelivery> },

    /// Detach a subscriber.
    Unsubscribe { subscriber: ActorRef<BusDelivery> },

    /// Number of attached subscribers (for debugging and test sync).
    SubscriberCount { reply: RpcReplyPort<usize> },
}

pub struct BroadcastBusState {
    subscribers: Vec<ActorRef<BusDelivery>>,
}

#[derive(Debug, Default)]
pub struct BroadcastBusActor;

#[async_trait]
impl Actor for BroadcastBusActor {
    type Msg = BusMsg;
    type State = BroadcastBusState;
    type Arguments = ();

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(actor_id = %myself.get_id(), "BroadcastBusActor starting");
        Ok(BroadcastBusState {
            subscribers: Vec::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BusMsg::Publish { message } => {
                for subscriber in &state.subscribers {
                    if let Err(e) = subscriber.cast(BusDelivery(message.clone())) {
                        tracing::warn!(
                            subscriber_id = %subscriber.get_id(),
                            error = %e,
                            "Failed to deliver broadcast to subscriber"
                        );
                    }
                }
            }
            BusMsg::Subscribe { subscriber } => {
                let already = state
                    .subscribers
                    .iter()
                    .any(|s| s.get_id() == subscriber.get_id());
                if already {
                    tracing::debug!(
                        subscriber_id = %subscriber.get_id(),
                        "Subscriber already attached"
                    );
                } else {
                    state.subscribers.push(subscriber);
                }
            }
            BusMsg::Unsubscribe { subscriber } => {
                state
                    .subscribers
                    .retain(|s| s.get_id() != subscriber.get_id());
            }
            BusMsg::SubscriberCount { reply } => {
                let _ = reply.send(state.subscribers.len());
            }
        }
        Ok(())
    }
}

/// Serialize a protocol message and broadcast it.
pub fn publish_message(bus: &ActorRef<BusMsg>, message: &ProtocolMessage) -> Result<(), String> {
    let value = serde_json::to_value(message).map_err(|e| e.to_string())?;
    bus.cast(BusMsg::Publish { message: value })
        .map_err(|e| e.to_string())
}

/// Forwards raw bus deliveries into an owning actor's mailbox.
///
/// Ractor subscribers are typed by their message; this adapter lets an actor
/// with its own message enum sit on the bus without a second mailbox type.
pub struct BusTap<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> BusTap<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for BusTap<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M> Actor for BusTap<M>
where
    M: ractor::Message + From<BusDelivery>,
{
    type Msg = BusDelivery;
    type State = ActorRef<M>;
    type Arguments = ActorRef<M>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        target: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(target)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        target: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // Target gone means the owner tore down first; nothing to do.
        let _ = target.cast(M::from(message));
        Ok(())
    }
}
