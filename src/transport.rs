use crate::error::{ConnectionError, TransportError};
use crate::register_map::RegisterKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::{rtu, tcp, Client as _, Context};
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// The single master end of the field bus.
///
/// Methods take `&mut self`: whoever holds the transport is the only one who
/// can have a request on the wire.
#[async_trait]
pub trait BusTransport: Send {
    /// Opens the link. Succeeds immediately when already connected.
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    /// One framed read of `count` consecutive registers from `slave_id`.
    async fn read_register_block(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start_address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Releases the link. Safe to call when already closed.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Human readable description of where the bus lives, for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            other => Err(format!("expected none, odd or even, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(data_bits: DataBits) -> Self {
        match data_bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl FromStr for DataBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "5" => Ok(DataBits::Five),
            "6" => Ok(DataBits::Six),
            "7" => Ok(DataBits::Seven),
            "8" => Ok(DataBits::Eight),
            other => Err(format!("expected 5, 6, 7 or 8, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "2" => Ok(StopBits::Two),
            other => Err(format!("expected 1 or 2, got '{other}'")),
        }
    }
}

/// Line settings for an RTU serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEndpoint {
    /// Modbus RTU over a local serial device
    Serial(SerialSettings),
    /// Modbus TCP, e.g. through a serial gateway
    Tcp(SocketAddr),
}

impl fmt::Display for BusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEndpoint::Serial(s) => write!(
                f,
                "{} @ {} baud, parity={:?}, data={:?}, stop={:?}",
                s.port, s.baud_rate, s.parity, s.data_bits, s.stop_bits
            ),
            BusEndpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// `BusTransport` backed by a tokio-modbus client context.
pub struct ModbusTransport {
    endpoint: BusEndpoint,
    read_timeout: Duration,
    context: Option<Context>,
    /// A request went unanswered; a late reply may still be in flight.
    needs_resync: bool,
}

impl ModbusTransport {
    pub fn new(endpoint: BusEndpoint, read_timeout: Duration) -> Self {
        Self {
            endpoint,
            read_timeout,
            context: None,
            needs_resync: false,
        }
    }

    /// Swaps in a fresh context so a late reply cannot be matched to the next request.
    async fn resync(&mut self) -> Result<(), TransportError> {
        self.needs_resync = false;
        if let Some(mut stale) = self.context.take() {
            let _ = timeout(Duration::from_secs(2), stale.disconnect()).await;
        }
        match Self::open(&self.endpoint, self.read_timeout).await {
            Ok(ctx) => {
                debug!(endpoint = %self.endpoint, "Modbus context resynchronised");
                self.context = Some(ctx);
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Modbus resync failed, dropping link");
                Err(TransportError::Link(e.reason))
            }
        }
    }

    async fn open(
        endpoint: &BusEndpoint,
        read_timeout: Duration,
    ) -> Result<Context, ConnectionError> {
        let fail = |reason: String| ConnectionError {
            endpoint: endpoint.to_string(),
            reason,
        };
        match endpoint {
            BusEndpoint::Serial(settings) => {
                let stream = tokio_serial::new(&settings.port, settings.baud_rate)
                    .data_bits(settings.data_bits.into())
                    .stop_bits(settings.stop_bits.into())
                    .parity(settings.parity.into())
                    .timeout(read_timeout)
                    .open_native_async()
                    .map_err(|e| fail(e.to_string()))?;
                Ok(rtu::attach(stream))
            }
            BusEndpoint::Tcp(addr) => match timeout(read_timeout, tcp::connect(*addr)).await {
                Ok(Ok(ctx)) => Ok(ctx),
                Ok(Err(e)) => Err(fail(e.to_string())),
                Err(_) => Err(fail(format!("no answer within {read_timeout:?}"))),
            },
        }
    }
}

#[async_trait]
impl BusTransport for ModbusTransport {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.context.is_some() {
            return Ok(());
        }
        info!(endpoint = %self.endpoint, "Connecting to Modbus");
        let ctx = Self::open(&self.endpoint, self.read_timeout).await?;
        self.context = Some(ctx);
        debug!(endpoint = %self.endpoint, "Modbus context attached");
        Ok(())
    }

    async fn read_register_block(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start_address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if self.context.is_none() {
            return Err(TransportError::NotConnected);
        }
        if self.needs_resync {
            self.resync().await?;
        }
        let read_timeout = self.read_timeout;
        let ctx = self.context.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(slave_id));

        let request = async {
            match kind {
                RegisterKind::Input => ctx.read_input_registers(start_address, count).await,
                RegisterKind::Holding => ctx.read_holding_registers(start_address, count).await,
            }
        };

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        let outcome = timeout(read_timeout, request).await;
        match outcome {
            Ok(Ok(Ok(registers))) if registers.len() == usize::from(count) => Ok(registers),
            Ok(Ok(Ok(registers))) => Err(TransportError::Malformed(format!(
                "expected {count} registers, got {}",
                registers.len()
            ))),
            Ok(Ok(Err(exception))) => Err(TransportError::Exception(format!("{exception:?}"))),
            Ok(Err(e)) => {
                let error = classify_client_error(e);
                if error.is_link_level() {
                    warn!(slave_id, error = %error, "Modbus transport error, dropping link");
                    self.context = None;
                } else {
                    debug!(slave_id, error = %error, "Unexpected Modbus response");
                    self.needs_resync = true;
                }
                Err(error)
            }
            Err(_elapsed) => {
                debug!(slave_id, start_address, count, "Modbus read timed out");
                self.needs_resync = true;
                Err(TransportError::Timeout(read_timeout))
            }
        }
    }

    async fn disconnect(&mut self) {
        self.needs_resync = false;
        if let Some(mut ctx) = self.context.take() {
            let _ = timeout(Duration::from_secs(2), ctx.disconnect()).await;
            info!(endpoint = %self.endpoint, "Modbus disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Only I/O failures mean the link is gone. Protocol errors come from a
/// confused exchange with one meter.
fn classify_client_error(error: tokio_modbus::Error) -> TransportError {
    match error {
        tokio_modbus::Error::Transport(e) => TransportError::Link(e.to_string()),
        tokio_modbus::Error::Protocol(e) => TransportError::Malformed(e.to_string()),
    }
}
