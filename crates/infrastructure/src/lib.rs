pub mod ack;
pub mod broker;
pub mod codec;
pub mod connection;
pub mod consumer;
pub mod gateway;
pub mod metrics;
pub mod publisher;
pub mod schema;
pub mod topology;
pub mod wire;

pub use ack::AcknowledgementPolicy;
pub use broker::{
    AckOutcome, AckRecord, BrokerChannel, BrokerSession, BrokerTransport, Delivery, DeliveryHandle, DeliveryMeta,
    InMemoryBroker, MessageProperties, RabbitMqTransport,
};
pub use codec::EventCodec;
pub use connection::{strip_credentials, BrokerConnection, RetryPolicy};
pub use consumer::{
    handler_fn, ConsumerLoop, ConsumerState, ConsumerStats, EventHandler, HandlerFn, Inbound,
};
pub use gateway::Gateway;
pub use publisher::{Publisher, PublisherHandle, PublisherStats, PublisherWorker};
pub use schema::SchemaValidator;
pub use topology::{DeclaredTopology, QueueTopologyManager};
