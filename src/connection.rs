use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

use crate::modbus::{self, FuturaTcpCodec, Request, ResponseKind};
use crate::registers::Space;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` within {0}")]
    ConnectTimeout(humantime::Duration, String),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the connection was closed before a response to transaction {0} arrived")]
    ConnectionClosed(u16),
    #[error("no response to transaction {1} within {0}")]
    ResponseTimeout(humantime::Duration, u16),
    #[error("the device responded with exception code {0}")]
    Exception(u8),
    #[error("the response does not match the request")]
    UnexpectedResponse,
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Host name or address of the device's Modbus TCP endpoint.
    ///
    /// May carry an explicit `host:port`; `--port` applies otherwise.
    #[arg(long)]
    pub host: String,

    /// The TCP port of the Modbus endpoint.
    #[arg(long, default_value = "502")]
    pub port: u16,

    /// The modbus unit ID of the device.
    #[arg(long, short = 'i', default_value = "1")]
    pub device_id: u8,

    /// Abandon the connection attempt if it does not complete in this amount of time.
    #[arg(long, default_value = "10s")]
    pub connect_timeout: humantime::Duration,

    /// Consider a request failed if no response arrives within this amount of time.
    #[arg(long, default_value = "2s")]
    pub request_timeout: humantime::Duration,
}

impl Args {
    fn address(&self) -> String {
        if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// A single Modbus TCP session.
///
/// Requests are strictly sequential. The Futura control board services one
/// request at a time and pipelining buys nothing, so each request waits for
/// its response (or the timeout) before the next one goes out.
pub struct Connection {
    io: Framed<TcpStream, FuturaTcpCodec>,
    device_id: u8,
    request_timeout: Duration,
    next_transaction_id: u16,
}

impl Connection {
    pub async fn open(args: &Args) -> Result<Connection, Error> {
        let address = args.address();
        info!(message = "connecting...", address);
        let deadline = Instant::now() + *args.connect_timeout;
        let connect = async {
            let addresses = tokio::net::lookup_host(&address)
                .await
                .map_err(|e| Error::LookupHost(e, address.clone()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            TcpStream::connect(&*addresses)
                .await
                .map_err(|e| Error::Connect(e, address.clone()))
        };
        let socket = tokio::time::timeout_at(deadline, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(args.connect_timeout, address.clone()))??;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        Ok(Connection {
            io: Framed::new(socket, FuturaTcpCodec {}),
            device_id: args.device_id,
            request_timeout: *args.request_timeout,
            next_transaction_id: 0,
        })
    }

    fn new_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    async fn transact(&mut self, operation: modbus::Operation) -> Result<ResponseKind, Error> {
        let transaction_id = self.new_transaction_id();
        let request = Request { device_id: self.device_id, transaction_id, operation };
        self.io.send(&request).await.map_err(Error::Send)?;
        let deadline = Instant::now() + self.request_timeout;
        loop {
            let response = tokio::time::timeout_at(deadline, self.io.next())
                .await
                .map_err(|_| Error::ResponseTimeout(self.request_timeout.into(), transaction_id))?;
            let response = match response {
                None => return Err(Error::ConnectionClosed(transaction_id)),
                Some(Err(e)) => return Err(Error::Receive(e)),
                Some(Ok(response)) => response,
            };
            if response.transaction_id != transaction_id {
                // A straggler from a request that already timed out.
                debug!(message = "skipping a stale response", transaction = response.transaction_id);
                continue;
            }
            if let Some(code) = response.exception_code() {
                return Err(Error::Exception(code));
            }
            return Ok(response.kind);
        }
    }

    /// Read `count` consecutive registers starting at `address`.
    pub async fn read_range(
        &mut self,
        space: Space,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, Error> {
        let operation = match space {
            Space::Input => modbus::Operation::ReadInput { address, count },
            Space::Holding => modbus::Operation::ReadHolding { address, count },
        };
        match self.transact(operation).await? {
            ResponseKind::ReadWords { values } if values.len() == usize::from(count) => Ok(values),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn write_one(&mut self, address: u16, value: u16) -> Result<(), Error> {
        match self.transact(modbus::Operation::WriteSingle { address, value }).await? {
            ResponseKind::WriteSingle { .. } => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn write_many(&mut self, address: u16, values: Vec<u16>) -> Result<(), Error> {
        match self.transact(modbus::Operation::WriteMultiple { address, values }).await? {
            ResponseKind::WriteMultiple { .. } => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.io.close().await.map_err(Error::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(host: &str, port: u16) -> Args {
        Args {
            host: host.to_string(),
            port,
            device_id: 1,
            connect_timeout: Duration::from_secs(10).into(),
            request_timeout: Duration::from_secs(2).into(),
        }
    }

    #[test]
    fn port_flag_applies_only_without_an_explicit_port() {
        assert_eq!(args("futura.lan", 502).address(), "futura.lan:502");
        assert_eq!(args("futura.lan:1502", 502).address(), "futura.lan:1502");
    }

    #[tokio::test]
    async fn connect_attempts_are_bounded() {
        // TEST-NET-3 addresses do not route; a black-holed connect must be
        // abandoned by the timeout rather than stalling the caller for the
        // OS default of minutes.
        let mut args = args("203.0.113.1", 502);
        args.connect_timeout = Duration::from_millis(50).into();
        let started = std::time::Instant::now();
        let result = Connection::open(&args).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
