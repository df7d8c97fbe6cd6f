//! Chain resolution: translate an ordered list of (actor, entities) stages
//! into bus subscriptions bridging each producer's outgoing topic to the
//! next stage's incoming topics.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::MessageBus;

#[derive(Debug, Clone)]
pub struct ChainStage {
    pub actor: String,
    pub entities: Vec<String>,
}

#[derive(Debug)]
pub struct Chain {
    pub name: String,
    /// Number of forwarders subscribed for this chain.
    pub links: usize,
}

/// Wire a chain: for each consecutive stage pair, subscribe a forwarder
/// from every producer entity's outgoing topic onto every consumer
/// entity's incoming topic. The forwarder's identity names its destination
/// topic. Chains shorter than two stages are rejected with a warning.
pub fn build_chain(bus: &Arc<MessageBus>, name: &str, stages: &[ChainStage]) -> Chain {
    if stages.len() < 2 {
        warn!(chain = name, "need at least two actors to create a chain");
        return Chain {
            name: name.to_string(),
            links: 0,
        };
    }

    let mut links = 0;
    for pair in stages.windows(2) {
        let (producer, consumer) = (&pair[0], &pair[1]);
        for producer_entity in &producer.entities {
            for consumer_entity in &consumer.entities {
                let source = MessageBus::outgoing_topic_for(&producer.actor, producer_entity);
                let destination =
                    MessageBus::incoming_topic_for(&consumer.actor, consumer_entity);
                let label = format!("chain:{name}->{destination}");
                let chain = name.to_string();
                let bus_cb = Arc::clone(bus);
                let destination_cb = destination.clone();
                bus.subscribe(&source, label, move |producer_topic, record| {
                    debug!(
                        chain = %chain,
                        from = producer_topic,
                        to = %destination_cb,
                        record = %record.debug(),
                        "forwarding record"
                    );
                    bus_cb.publish(&destination_cb, record);
                });
                links += 1;
            }
        }
    }

    Chain {
        name: name.to_string(),
        links,
    }
}
