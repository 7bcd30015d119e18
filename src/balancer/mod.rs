//! Client-side load balancing.
//!
//! Two balancers over the same connection machinery:
//! - [`LoadBalancer`]: weighted, aperture-tuned selection over a dynamic
//!   factory set (the full machine)
//! - [`TcpLoadBalancer`]: a fixed-size pool over a host list with random
//!   dialing and power-of-two-choices handout

mod aperture;
mod tcp_pool;

pub use aperture::{LoadBalancer, LoadBalancerOptions};
pub use tcp_pool::{HostPort, SelectionStrategy, TcpLoadBalancer, TcpLoadBalancerOptions};
