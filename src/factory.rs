//! Connection factories.
//!
//! A [`ConnectionFactory`] is a named producer of sockets against a single
//! endpoint. The load balancer holds factories it is not currently using,
//! ranks them by `availability()` when it widens the aperture, and gets the
//! factory back whenever its spawned socket is removed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::connection::{Connection, ConnectionOptions};
use crate::error::Result;
use crate::socket::{BoxFuture, RSocket};
use crate::transport::connect_tcp;

/// Named producer of sockets against a single endpoint.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Build a new socket. Each call dials a fresh connection.
    fn build(&self) -> BoxFuture<Result<Arc<dyn RSocket>>>;

    /// Endpoint usability in `[0, 1]`; the balancer prefers higher values.
    fn availability(&self) -> f64;

    /// Stable endpoint name, `"host:port"` for TCP.
    fn name(&self) -> String;
}

/// Factory dialing TCP to a fixed `host:port`.
pub struct TcpConnectionFactory {
    host: String,
    port: u16,
    options: ConnectionOptions,
    /// Build failures since the last success; degrades availability so the
    /// balancer stops preferring an endpoint that keeps failing to dial.
    consecutive_failures: Arc<AtomicU32>,
}

impl TcpConnectionFactory {
    pub fn new(host: impl Into<String>, port: u16, options: ConnectionOptions) -> Self {
        Self {
            host: host.into(),
            port,
            options,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn build(&self) -> BoxFuture<Result<Arc<dyn RSocket>>> {
        let host = self.host.clone();
        let port = self.port;
        let options = self.options.clone();
        let failures = Arc::clone(&self.consecutive_failures);

        Box::pin(async move {
            match dial(&host, port, options).await {
                Ok(socket) => {
                    failures.store(0, Ordering::Release);
                    debug!(host = %host, port, "connection built");
                    Ok(socket)
                }
                Err(e) => {
                    failures.fetch_add(1, Ordering::AcqRel);
                    Err(e)
                }
            }
        })
    }

    fn availability(&self) -> f64 {
        let failures = self.consecutive_failures.load(Ordering::Acquire);
        1.0 / (1.0 + failures as f64)
    }

    fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

async fn dial(host: &str, port: u16, options: ConnectionOptions) -> Result<Arc<dyn RSocket>> {
    let transport = connect_tcp(host, port).await?;
    let connection = Connection::connect(transport, options).await?;
    Ok(Arc::new(connection) as Arc<dyn RSocket>)
}
