pub mod endpoint;
pub mod health;
#[cfg(test)]
pub mod memory;
pub mod pool;

pub use endpoint::{
    is_auth_required, Endpoint, EndpointError, EndpointFactory, WsEndpoint, WsEndpointFactory,
};
pub use health::{EndpointHealth, HealthTable};
pub use pool::{
    quorum, relay_set_key, ChallengeResponder, PoolEvent, PublishError, PublishOptions,
    RelayFailure, SubscriptionHandle, TransportPool,
};
