pub mod gateway;

pub use gateway::RelayGateway;
