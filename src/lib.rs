//! Packet Broker Agent
//!
//! Relays LoRaWAN traffic between a local network server cluster and a
//! federated routing broker. The agent can act as a Forwarder (gateway side)
//! and as a Home Network (device side), independently or both at once.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod convert;
pub mod correlation;
pub mod encryption;
pub mod error;
pub mod lorawan;
pub mod oauth2;
pub mod pool;
pub mod task;
pub mod tenant;
pub mod token;
pub mod types;
pub mod utils;

pub mod proto {
    pub mod packetbroker {
        tonic::include_proto!("packetbroker");
    }

    pub mod pba {
        tonic::include_proto!("pba");
    }
}

pub use agent::{Agent, AgentBuilder, Pipeline};
pub use config::Config;
pub use error::AgentError;
