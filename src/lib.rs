//! # rsocket-client
//!
//! Client runtime for the ReactiveSocket (RSocket v0) wire protocol over
//! reliable byte transports, centered on a weighted, aperture-tuned
//! client-side load balancer.
//!
//! ## Architecture
//!
//! - **Protocol**: length-prefixed binary frames, a framer state machine,
//!   and a per-link connection state machine (SETUP handshake, stream
//!   demultiplexing, keepalive, lease accounting, request timeouts)
//! - **Decorators**: composable [`RSocket`] wrappers tracking drain state,
//!   predicted latency, failure accrual, and adaptive retry
//! - **Balancers**: an aperture balancer selecting by power-of-three-choices
//!   over `availability / (1 + predicted_latency * (outstanding + 1))`, and
//!   a simpler fixed-size TCP pool
//!
//! ## Example
//!
//! ```ignore
//! use rsocket_client::{
//!     ConnectionOptions, LoadBalancer, LoadBalancerOptions, Payload, RSocket,
//!     TcpConnectionFactory,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factories = vec![
//!         Arc::new(TcpConnectionFactory::new("10.0.0.1", 7878, ConnectionOptions::default())) as _,
//!         Arc::new(TcpConnectionFactory::new("10.0.0.2", 7878, ConnectionOptions::default())) as _,
//!     ];
//!     let balancer = LoadBalancer::new(factories, LoadBalancerOptions::default());
//!     balancer.ready().await;
//!
//!     let response = balancer
//!         .request(Payload::from_str(None, Some("ping")))
//!         .await?;
//!     println!("{:?}", response.data);
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod protocol;
pub mod socket;
pub mod stats;
pub mod transport;

mod lease;
mod writer;

pub use balancer::{
    HostPort, LoadBalancer, LoadBalancerOptions, SelectionStrategy, TcpLoadBalancer,
    TcpLoadBalancerOptions,
};
pub use connection::{
    Connection, ConnectionOptions, LeaseConfig, Responder, ResponderFuture, Role, ServerOptions,
};
pub use error::{RSocketError, Result};
pub use factory::{ConnectionFactory, TcpConnectionFactory};
pub use protocol::{ErrorCode, Frame, FrameType, Payload};
pub use socket::{
    CancelHandle, DrainingSocket, FailureAccrualSocket, RSocket, ReEnqueueFilter,
    ReEnqueueOptions, Response, WeightedSocket, WeightedSocketOptions,
};
