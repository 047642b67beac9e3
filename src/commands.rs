use crate::registers::{DeviceVariant, Schema, Value};
use crate::sync::Snapshot;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Json,
}

/// The table output names the hardware variant alongside its raw value.
fn render_value(name: &str, value: &Value) -> String {
    if let ("device_variant", &Value::U16(raw)) = (name, value) {
        if let Some(variant) = DeviceVariant::from_raw(raw) {
            return format!("{variant} ({raw})");
        }
    }
    value.to_string()
}

fn render_snapshot(
    schema: &Schema,
    snapshot: &Snapshot,
    format: Format,
) -> Result<String, serde_json::Error> {
    Ok(match format {
        Format::Table => {
            let mut table = comfy_table::Table::new();
            table
                .set_header(vec!["Name", "Value", "Unit"])
                .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
            for (name, value) in snapshot.iter() {
                let unit = schema.resolve(name).ok().and_then(|d| d.unit).unwrap_or_default();
                table.add_row(vec![name.to_string(), render_value(name, value), unit.to_string()]);
            }
            table.to_string()
        }
        Format::Json => {
            let map: std::collections::BTreeMap<&str, &Value> = snapshot.iter().collect();
            serde_json::to_string(&map)?
        }
    })
}

fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod registers {
    use crate::registers::{Descriptor, Encoding, Schema, SchemaError, Space};

    use super::Format;

    /// Search and output the known device registers.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
        #[error("could not serialize registers to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not build the register schema")]
        Schema(#[from] SchemaError),
    }

    #[derive(serde::Serialize)]
    struct Row {
        name: String,
        space: Space,
        address: u16,
        encoding: Encoding,
        scale: Option<f64>,
        unit: Option<&'static str>,
        minimum: Option<i32>,
        maximum: Option<i32>,
        flags: Option<Vec<&'static str>>,
    }

    impl Row {
        fn new(descriptor: &Descriptor) -> Row {
            Row {
                name: descriptor.name.to_string(),
                space: descriptor.space,
                address: descriptor.address,
                encoding: descriptor.encoding,
                scale: descriptor.scale,
                unit: descriptor.unit,
                minimum: descriptor.min,
                maximum: descriptor.max,
                flags: descriptor
                    .bits
                    .map(|bits| bits.iter().map(|&(_, flag)| flag).collect()),
            }
        }

        fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.name.contains(&pattern)
                || self.address.to_string().contains(&pattern)
                || self
                    .flags
                    .as_ref()
                    .is_some_and(|flags| flags.iter().any(|flag| flag.contains(&pattern)))
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let schema = Schema::load()?;
        let rows = schema
            .descriptors()
            .iter()
            .map(Row::new)
            .filter(|row| args.filter.as_ref().is_none_or(|pattern| row.is_match(pattern)))
            .collect::<Vec<_>>();
        let data = match args.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_header(vec![
                        "Space", "Address", "Name", "Type", "Scale", "Unit", "Min", "Max", "Flags",
                    ])
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                for row in &rows {
                    table.add_row(vec![
                        row.space.to_string(),
                        row.address.to_string(),
                        row.name.clone(),
                        row.encoding.to_string(),
                        row.scale.map(|s| s.to_string()).unwrap_or_default(),
                        row.unit.unwrap_or_default().to_string(),
                        row.minimum.map(|v| v.to_string()).unwrap_or_default(),
                        row.maximum.map(|v| v.to_string()).unwrap_or_default(),
                        row.flags
                            .as_ref()
                            .map(|flags| flags.join(", "))
                            .unwrap_or_default(),
                    ]);
                }
                table.to_string()
            }
            Format::Json => serde_json::to_string(&rows).map_err(Error::SerializeJson)?,
        };
        use std::io::Write as _;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{data}").map_err(Error::WriteStdout)
    }
}

pub mod read {
    use std::sync::Arc;

    use crate::registers::{Schema, SchemaError};
    use crate::sync::{DEFAULT_CHUNKS, EngineError, SyncEngine, TcpBackend};
    use crate::{commands, connection};

    use super::Format;

    /// Poll the device once and output the full register snapshot.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not build the register schema")]
        Schema(#[from] SchemaError),
        #[error("could not set up the synchronization engine")]
        Engine(#[from] EngineError),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not read any register chunk from the device")]
        PollFailed,
        #[error("could not serialize the snapshot to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = commands::runtime().map_err(Error::Runtime)?;
        let schema = Arc::new(Schema::load()?);
        let backend = TcpBackend::new(args.connection);
        let mut engine = SyncEngine::new(Arc::clone(&schema), backend, DEFAULT_CHUNKS.to_vec())?;
        let snapshot = runtime.block_on(async {
            if !engine.poll_once().await {
                return Err(Error::PollFailed);
            }
            Ok(engine.snapshot())
        })?;
        let data = commands::render_snapshot(&schema, &snapshot, args.format)
            .map_err(Error::SerializeJson)?;
        use std::io::Write as _;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{data}").map_err(Error::WriteStdout)
    }
}

pub mod watch {
    use std::sync::Arc;

    use crate::registers::{Schema, SchemaError};
    use crate::sync::{DEFAULT_CHUNKS, EngineError, SyncEngine, TcpBackend};
    use crate::{commands, connection};

    use super::Format;

    /// Poll the device periodically and output a snapshot per tick.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Json)]
        format: Format,
        /// How often to poll the device.
        #[arg(long, default_value = "30s")]
        interval: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not build the register schema")]
        Schema(#[from] SchemaError),
        #[error("could not set up the synchronization engine")]
        Engine(#[from] EngineError),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not serialize the snapshot to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = commands::runtime().map_err(Error::Runtime)?;
        let schema = Arc::new(Schema::load()?);
        let backend = TcpBackend::new(args.connection);
        let engine = SyncEngine::new(Arc::clone(&schema), backend, DEFAULT_CHUNKS.to_vec())?;
        let mut changes = engine.subscribe();
        runtime.block_on(async move {
            tokio::select! {
                _ = engine.run(*args.interval) => Ok(()),
                result = async {
                    loop {
                        if changes.changed().await.is_err() {
                            return Ok(());
                        }
                        let snapshot = changes.borrow_and_update().clone();
                        let data = commands::render_snapshot(&schema, &snapshot, args.format)
                            .map_err(Error::SerializeJson)?;
                        use std::io::Write as _;
                        let mut stdout = std::io::stdout().lock();
                        writeln!(stdout, "{data}").map_err(Error::WriteStdout)?;
                    }
                } => result,
            }
        })
    }
}

pub mod write {
    use std::sync::Arc;

    use crate::registers::{
        Descriptor, Encoding, Schema, SchemaError, Value, VentilationLevel, ZoneButtonMode,
    };
    use crate::sync::{DEFAULT_CHUNKS, EngineError, SyncEngine, TcpBackend, WriteError};
    use crate::{commands, connection};

    /// Write a value to one of the device's control registers.
    ///
    /// Scaled registers accept decimal values in their engineering unit (e.g.
    /// `21.5` for a temperature). The holiday registers accept an RFC 3339
    /// timestamp or unix seconds. `ventilation_level` and the zone button
    /// modes also accept their symbolic names.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// The name of the register, as output by the `registers` command.
        name: String,
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not build the register schema")]
        Schema(#[from] SchemaError),
        #[error("could not set up the synchronization engine")]
        Engine(#[from] EngineError),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not parse `{1}` as a decimal value")]
        ParseFloat(#[source] std::num::ParseFloatError, String),
        #[error("could not parse `{1}` as an integer value")]
        ParseInteger(#[source] std::num::ParseIntError, String),
        #[error("could not parse `{1}` as a timestamp")]
        ParseTimestamp(#[source] jiff::Error, String),
        #[error("the timestamp `{0}` does not fit the register")]
        TimestampOutOfRange(String),
        #[error("could not write the register")]
        Write(#[from] WriteError),
    }

    fn parse_integer(descriptor: &Descriptor, input: &str) -> Result<Value, Error> {
        let parse_error = |e| Error::ParseInteger(e, input.to_string());
        Ok(match descriptor.encoding {
            Encoding::U16 => Value::U16(input.parse().map_err(parse_error)?),
            Encoding::I16 => Value::I16(input.parse().map_err(parse_error)?),
            Encoding::U32 => Value::U32(input.parse().map_err(parse_error)?),
            Encoding::I32 => Value::I32(input.parse().map_err(parse_error)?),
        })
    }

    fn parse_value(descriptor: &Descriptor, input: &str) -> Result<Value, Error> {
        if descriptor.scale.is_some() {
            let value = input
                .parse::<f64>()
                .map_err(|e| Error::ParseFloat(e, input.to_string()))?;
            return Ok(Value::Scaled(value));
        }
        if descriptor.unit == Some("unix") {
            let seconds = if input.chars().all(|c| c.is_ascii_digit()) {
                i64::from(
                    input
                        .parse::<u32>()
                        .map_err(|e| Error::ParseInteger(e, input.to_string()))?,
                )
            } else {
                input
                    .parse::<jiff::Timestamp>()
                    .map_err(|e| Error::ParseTimestamp(e, input.to_string()))?
                    .as_second()
            };
            let seconds = u32::try_from(seconds)
                .map_err(|_| Error::TimestampOutOfRange(input.to_string()))?;
            return Ok(Value::U32(seconds));
        }
        if descriptor.name == "ventilation_level" {
            if let Ok(level) = input.parse::<VentilationLevel>() {
                return Ok(Value::U16(level as u16));
            }
        }
        if descriptor.name.ends_with("_button_mode") {
            if let Ok(mode) = input.parse::<ZoneButtonMode>() {
                return Ok(Value::U16(mode as u16));
            }
        }
        parse_integer(descriptor, input)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = commands::runtime().map_err(Error::Runtime)?;
        let schema = Arc::new(Schema::load()?);
        let value = parse_value(schema.resolve(&args.name)?, &args.value)?;
        let backend = TcpBackend::new(args.connection);
        let mut engine = SyncEngine::new(schema, backend, DEFAULT_CHUNKS.to_vec())?;
        runtime.block_on(engine.write(&args.name, &value))?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn parse(name: &str, input: &str) -> Result<Value, Error> {
            let schema = Schema::load().unwrap();
            parse_value(schema.resolve(name).unwrap(), input)
        }

        #[test]
        fn scaled_registers_take_decimal_values() {
            assert_eq!(parse("temp_setpoint", "21.5").unwrap(), Value::Scaled(21.5));
            assert!(matches!(
                parse("temp_setpoint", "warm").unwrap_err(),
                Error::ParseFloat(..)
            ));
        }

        #[test]
        fn ventilation_level_accepts_symbolic_names() {
            assert_eq!(parse("ventilation_level", "auto").unwrap(), Value::U16(6));
            assert_eq!(parse("ventilation_level", "3").unwrap(), Value::U16(3));
            assert!(matches!(
                parse("ventilation_level", "turbo").unwrap_err(),
                Error::ParseInteger(..)
            ));
        }

        #[test]
        fn button_modes_accept_symbolic_names() {
            assert_eq!(parse("zone_2_button_mode", "kitchen_hood").unwrap(), Value::U16(1));
            assert_eq!(parse("zone_2_button_mode", "0").unwrap(), Value::U16(0));
        }

        #[test]
        fn holiday_registers_take_timestamps_or_seconds() {
            assert_eq!(
                parse("holiday_begin", "2026-08-30T00:00:00Z").unwrap(),
                Value::U32(1_788_048_000)
            );
            assert_eq!(parse("holiday_end", "1788048000").unwrap(), Value::U32(1_788_048_000));
            assert!(matches!(
                parse("holiday_begin", "tomorrow").unwrap_err(),
                Error::ParseTimestamp(..)
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_variant_renders_symbolically() {
        assert_eq!(render_value("device_variant", &Value::U16(2)), "futura_m (2)");
        assert_eq!(render_value("device_variant", &Value::U16(9)), "9");
        assert_eq!(render_value("temp_fresh", &Value::Scaled(21.5)), "21.5");
    }
}
