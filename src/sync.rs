use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connection;
use crate::modbus::MAX_SAFE_READ_COUNT;
use crate::registers::{CodecError, Descriptor, Schema, SchemaError, Space, Value};

/// One contiguous register range read per poll tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub space: Space,
    pub start: u16,
    pub count: u16,
}

/// The ranges that cover every register the schema knows about, skipping the
/// reserved gaps in the device's address plan.
pub static DEFAULT_CHUNKS: &[Chunk] = &[
    Chunk { space: Space::Input, start: 0, count: 53 },
    Chunk { space: Space::Input, start: 80, count: 1 },
    Chunk { space: Space::Holding, start: 0, count: 25 },
    Chunk { space: Space::Holding, start: 300, count: 76 },
    Chunk { space: Space::Holding, start: 400, count: 74 },
];

/// One Modbus session. [`connection::Connection`] is the real thing; tests
/// substitute a scripted fake.
pub trait Transport {
    async fn read_range(
        &mut self,
        space: Space,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, connection::Error>;
    async fn write_one(&mut self, address: u16, value: u16) -> Result<(), connection::Error>;
    async fn write_many(&mut self, address: u16, values: Vec<u16>)
    -> Result<(), connection::Error>;
    async fn close(self) -> Result<(), connection::Error>;
}

/// Opens a fresh [`Transport`] for each poll tick or write.
pub trait Backend {
    type Conn: Transport;
    async fn open(&self) -> Result<Self::Conn, connection::Error>;
}

impl Transport for connection::Connection {
    async fn read_range(
        &mut self,
        space: Space,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, connection::Error> {
        connection::Connection::read_range(self, space, address, count).await
    }

    async fn write_one(&mut self, address: u16, value: u16) -> Result<(), connection::Error> {
        connection::Connection::write_one(self, address, value).await
    }

    async fn write_many(
        &mut self,
        address: u16,
        values: Vec<u16>,
    ) -> Result<(), connection::Error> {
        connection::Connection::write_many(self, address, values).await
    }

    async fn close(self) -> Result<(), connection::Error> {
        connection::Connection::close(self).await
    }
}

pub struct TcpBackend {
    args: connection::Args,
}

impl TcpBackend {
    pub fn new(args: connection::Args) -> Self {
        TcpBackend { args }
    }
}

impl Backend for TcpBackend {
    type Conn = connection::Connection;
    async fn open(&self) -> Result<connection::Connection, connection::Error> {
        connection::Connection::open(&self.args).await
    }
}

/// An immutable view of the device state as of some completed poll tick.
///
/// Values are keyed by register name; flags expanded out of the bit-mapped
/// registers live under `<register>.<flag>`.
#[derive(Clone, Default, Debug)]
pub struct Snapshot {
    values: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the unit reports the named `device_config` capability.
    ///
    /// `false` both for an absent capability and before the first successful
    /// poll of the capability word.
    pub fn is_capable(&self, capability: &str) -> bool {
        let key = format!("device_config.{capability}");
        matches!(self.values.get(&key), Some(Value::Bool(true)))
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EngineError {
    #[error("chunk {space} {start}+{count} splits the multi-word register `{name}`")]
    SplitRegister { space: Space, start: u16, count: u16, name: String },
    #[error("chunk {space} {start}+{count} exceeds the largest safe read of {max} registers")]
    ChunkTooLong { space: Space, start: u16, count: u16, max: u16 },
    #[error("chunk {space} {start}+{count} runs past the end of the address space")]
    ChunkOutOfRange { space: Space, start: u16, count: u16 },
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("register `{0}` is not writable")]
    NotWritable(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("the write could not be delivered")]
    Transport(#[source] connection::Error),
}

/// Keeps a [`Snapshot`] of the device in sync over a sequence of short-lived
/// Modbus sessions, one per poll tick.
#[derive(Debug)]
pub struct SyncEngine<B: Backend> {
    schema: Arc<Schema>,
    backend: B,
    chunks: Vec<Chunk>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    last_poll_succeeded: bool,
}

impl<B: Backend> SyncEngine<B> {
    pub fn new(schema: Arc<Schema>, backend: B, chunks: Vec<Chunk>) -> Result<Self, EngineError> {
        for chunk in &chunks {
            if chunk.count > MAX_SAFE_READ_COUNT {
                return Err(EngineError::ChunkTooLong {
                    space: chunk.space,
                    start: chunk.start,
                    count: chunk.count,
                    max: MAX_SAFE_READ_COUNT,
                });
            }
            // The address space ends at 65535; sum in u32 so a chunk reaching
            // past it is rejected instead of wrapping.
            let end = u32::from(chunk.start) + u32::from(chunk.count);
            if end > u32::from(u16::MAX) + 1 {
                return Err(EngineError::ChunkOutOfRange {
                    space: chunk.space,
                    start: chunk.start,
                    count: chunk.count,
                });
            }
            for descriptor in schema.in_space(chunk.space) {
                let address = u32::from(descriptor.address);
                let starts_inside = address >= u32::from(chunk.start) && address < end;
                if starts_inside && address + u32::from(descriptor.encoding.words()) > end {
                    return Err(EngineError::SplitRegister {
                        space: chunk.space,
                        start: chunk.start,
                        count: chunk.count,
                        name: descriptor.name.to_string(),
                    });
                }
            }
        }
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        Ok(SyncEngine { schema, backend, chunks, snapshot, last_poll_succeeded: false })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    /// Subscribers observe one update per completed poll tick, whether or not
    /// the tick managed to read anything.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.subscribe()
    }

    pub fn last_poll_succeeded(&self) -> bool {
        self.last_poll_succeeded
    }

    /// Run one poll tick. Returns whether at least one chunk was read.
    ///
    /// Failed chunks and undecodable values are logged and skipped; whatever
    /// did decode is overlaid onto the previous snapshot in one atomic
    /// replacement, so readers never observe a partially applied tick.
    pub async fn poll_once(&mut self) -> bool {
        let mut staged = BTreeMap::new();
        let mut any_chunk = false;
        match self.backend.open().await {
            Err(error) => {
                warn!(
                    message = "could not open a connection for the poll tick",
                    error = &error as &dyn std::error::Error,
                );
            }
            Ok(mut conn) => {
                for chunk in &self.chunks {
                    match conn.read_range(chunk.space, chunk.start, chunk.count).await {
                        Err(error) => {
                            warn!(
                                message = "reading a register chunk failed",
                                space = %chunk.space,
                                start = chunk.start,
                                count = chunk.count,
                                error = &error as &dyn std::error::Error,
                            );
                        }
                        Ok(words) => {
                            any_chunk = true;
                            stage_chunk(&self.schema, chunk, &words, &mut staged);
                        }
                    }
                }
                if let Err(error) = conn.close().await {
                    debug!(
                        message = "closing the poll connection failed",
                        error = &error as &dyn std::error::Error,
                    );
                }
            }
        }
        self.last_poll_succeeded = any_chunk;
        if any_chunk {
            let mut next = (**self.snapshot.borrow()).clone();
            next.values.extend(staged);
            self.snapshot.send_replace(Arc::new(next));
        } else {
            // Nothing was read; resend the previous snapshot so subscribers
            // still observe the tick.
            let unchanged = self.snapshot.borrow().clone();
            self.snapshot.send_replace(unchanged);
        }
        any_chunk
    }

    /// Poll forever at a fixed cadence.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    /// Write one holding register and refresh the snapshot.
    ///
    /// The value is validated and encoded before any connection is opened, so
    /// a rejected write never touches the device. Multi-word values go out as
    /// a single multi-register request. A failed post-write refresh is logged
    /// but does not fail a delivered write.
    pub async fn write(&mut self, name: &str, value: &Value) -> Result<(), WriteError> {
        let schema = Arc::clone(&self.schema);
        let descriptor = schema.resolve(name)?;
        if !descriptor.writable() {
            return Err(WriteError::NotWritable(name.to_string()));
        }
        let words = descriptor.encode(value)?;
        let address = descriptor.address;
        let mut conn = self.backend.open().await.map_err(WriteError::Transport)?;
        let delivery = if let &[word] = words.as_slice() {
            conn.write_one(address, word).await
        } else {
            conn.write_many(address, words).await
        };
        if let Err(error) = conn.close().await {
            debug!(
                message = "closing the write connection failed",
                error = &error as &dyn std::error::Error,
            );
        }
        delivery.map_err(WriteError::Transport)?;
        if !self.poll_once().await {
            warn!(message = "post-write refresh failed", register = name);
        }
        Ok(())
    }
}

/// Decode every register contained in `chunk` and stage it (plus the flags of
/// bit-mapped registers) for the snapshot replacement.
fn stage_chunk(schema: &Schema, chunk: &Chunk, words: &[u16], staged: &mut BTreeMap<String, Value>) {
    let end = u32::from(chunk.start) + u32::from(chunk.count);
    for descriptor in schema.in_space(chunk.space) {
        if descriptor.address < chunk.start || u32::from(descriptor.address) >= end {
            continue;
        }
        let offset = usize::from(descriptor.address - chunk.start);
        match descriptor.decode(words, offset) {
            Err(error) => {
                warn!(
                    message = "skipping an undecodable register",
                    register = %descriptor.name,
                    error = &error as &dyn std::error::Error,
                );
            }
            Ok(value) => {
                expand_bits(descriptor, &value, staged);
                staged.insert(descriptor.name.to_string(), value);
            }
        }
    }
}

/// Derive the `<register>.<flag>` booleans of a bit-mapped register.
fn expand_bits(descriptor: &Descriptor, value: &Value, staged: &mut BTreeMap<String, Value>) {
    let Some(bits) = descriptor.bits else {
        return;
    };
    let Some(pattern) = value.as_bits() else {
        return;
    };
    for &(bit, flag) in bits {
        let set = pattern & (1u64 << bit) != 0;
        staged.insert(format!("{}.{flag}", descriptor.name), Value::Bool(set));
    }
}
