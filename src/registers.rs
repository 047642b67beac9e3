use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

/// The two register banks exposed by the Futura unit.
///
/// Input registers are telemetry and can only be read (modbus function code
/// 4). Holding registers hold the control state and can be read and written
/// (function codes 3, 6 and 16). Both banks are addressed independently
/// starting at 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    Input,
    Holding,
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Space::Input => "input",
            Space::Holding => "holding",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    U16,
    I16,
    /// Two consecutive registers, high word first.
    U32,
    /// Two consecutive registers, high word first, two's complement.
    I32,
}

impl Encoding {
    pub const fn words(&self) -> u16 {
        match self {
            Encoding::U16 | Encoding::I16 => 1,
            Encoding::U32 | Encoding::I32 => 2,
        }
    }

    const fn natural_range(&self) -> (i64, i64) {
        match self {
            Encoding::U16 => (0, u16::MAX as i64),
            Encoding::I16 => (i16::MIN as i64, i16::MAX as i64),
            Encoding::U32 => (0, u32::MAX as i64),
            Encoding::I32 => (i32::MIN as i64, i32::MAX as i64),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Encoding::U16 => "u16",
            Encoding::I16 => "i16",
            Encoding::U32 => "u32",
            Encoding::I32 => "i32",
        })
    }
}

/// A decoded register value or a derived status flag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    /// Fixed-point register after its scale factor has been applied.
    Scaled(f64),
    /// A single flag expanded out of a bit-mapped register.
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::U16(n) => f64::from(n),
            Value::I16(n) => f64::from(n),
            Value::U32(n) => f64::from(n),
            Value::I32(n) => f64::from(n),
            Value::Scaled(v) => v,
            Value::Bool(b) => f64::from(u8::from(b)),
        }
    }

    /// The raw bit pattern, for registers that pack flags. Scaled and boolean
    /// values carry no meaningful bit pattern.
    pub fn as_bits(&self) -> Option<u64> {
        match *self {
            Value::U16(n) => Some(u64::from(n)),
            Value::I16(n) => Some(u64::from(n as u16)),
            Value::U32(n) => Some(u64::from(n)),
            Value::I32(n) => Some(u64::from(n as u32)),
            Value::Scaled(_) | Value::Bool(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::U16(n) => write!(f, "{n}"),
            Value::I16(n) => write!(f, "{n}"),
            Value::U32(n) => write!(f, "{n}"),
            Value::I32(n) => write!(f, "{n}"),
            Value::Scaled(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::U16(n) => serializer.serialize_u16(n),
            Value::I16(n) => serializer.serialize_i16(n),
            Value::U32(n) => serializer.serialize_u32(n),
            Value::I32(n) => serializer.serialize_i32(n),
            Value::Scaled(v) => serializer.serialize_f64(v),
            Value::Bool(b) => serializer.serialize_bool(b),
        }
    }
}

/// One `bit position -> flag name` entry of a bit-mapped register.
pub type BitFlag = (u8, &'static str);

/// Flags packed into the `current_mode` register.
pub static MODE_BITS: &[BitFlag] = &[
    (0, "boost_active"),
    (1, "circulation_active"),
    (2, "time_program_active"),
    (3, "overpressure_active"),
    (4, "holiday_active"),
    (5, "party_active"),
    (6, "night_mode_active"),
    (7, "antiradon_active"),
    (8, "device_on"),
    (9, "filter_check"),
    (10, "drying"),
    (11, "bypass_open"),
    (12, "low_outdoor_temp"),
    (13, "error_shutdown"),
    (14, "starting"),
    (15, "service_mode"),
    (16, "freeze_protection"),
    (17, "freeze_protection_active"),
    (18, "emergency_stop"),
    (19, "pressure_loss_measurement"),
    (20, "standby"),
    (21, "zone_boost"),
    (22, "zone_pressure_measurement"),
];

/// Flags packed into the `errors` register.
pub static ERROR_BITS: &[BitFlag] = &[
    (0, "ambient_sensor_error"),
    (1, "indoor_sensor_error"),
    (2, "fresh_sensor_error"),
    (3, "waste_sensor_error"),
    (4, "supply_fan_error"),
    (5, "exhaust_fan_error"),
    (6, "heat_exchanger_comm_error"),
    (7, "heat_exchanger_valve_error"),
    (8, "io_board_comm_error"),
    (9, "supply_fan_blocked"),
    (10, "exhaust_fan_blocked"),
    (11, "coolbreeze_comm_error"),
    (12, "coolbreeze_outdoor_unit_error"),
];

/// Flags packed into the `warnings` register.
pub static WARNING_BITS: &[BitFlag] = &[
    (0, "filter_not_initialized"),
    (1, "filter_dirty"),
    (2, "filter_overused"),
    (3, "rtc_battery_low"),
    (4, "supply_fan_high_rpm"),
    (5, "exhaust_fan_high_rpm"),
    (8, "low_outdoor_temp_limited"),
    (9, "zone_supply_config_error"),
    (10, "zone_exhaust_config_error"),
    (11, "emergency_stop_warning"),
    (12, "superbreeze_comm_error"),
    (13, "superbreeze_general_error"),
];

/// Capability flags packed into the `device_config` register. These gate
/// which optional accessories the unit is built with.
pub static CONFIG_BITS: &[BitFlag] = &[
    (0, "internal_heating_supported"),
    (1, "coolbreeze_cooling_available"),
    (2, "coolbreeze_heating_available"),
    (3, "bypass_supported"),
    (4, "variobreeze_supported"),
    (5, "internal_circulation_supported"),
    (6, "coolbreeze_supported"),
    (7, "heat_exchanger_control_supported"),
];

/// Zone presence flags packed into the `vzv_identify` register.
pub static ZONE_BITS: &[BitFlag] = &[
    (0, "supply_zone_1"),
    (1, "supply_zone_2"),
    (2, "supply_zone_3"),
    (3, "supply_zone_4"),
    (4, "supply_zone_5"),
    (5, "supply_zone_6"),
    (6, "supply_zone_7"),
    (7, "supply_zone_8"),
    (8, "exhaust_zone_1"),
    (9, "exhaust_zone_2"),
    (10, "exhaust_zone_3"),
    (11, "exhaust_zone_4"),
    (12, "exhaust_zone_5"),
    (13, "exhaust_zone_6"),
    (14, "exhaust_zone_7"),
    (15, "exhaust_zone_8"),
];

/// A row of the static register tables below.
#[derive(Clone, Copy)]
pub struct RegisterDef {
    pub address: u16,
    pub encoding: Encoding,
    pub name: &'static str,
    pub scale: Option<f64>,
    pub unit: Option<&'static str>,
    /// Raw (pre-scale) inclusive write bounds.
    pub min: Option<i32>,
    pub max: Option<i32>,
    pub bits: Option<&'static [BitFlag]>,
}

impl RegisterDef {
    fn descriptor(&self, space: Space) -> Descriptor {
        Descriptor {
            name: Cow::Borrowed(self.name),
            space,
            address: self.address,
            encoding: self.encoding,
            scale: self.scale,
            unit: self.unit,
            min: self.min,
            max: self.max,
            bits: self.bits,
        }
    }
}

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

macro_rules! register_table {
    ($($addr: literal: $enc: ident, $name: literal
        $(, scale = $scale: literal)?
        $(, unit = $unit: literal)?
        $(, min = $min: literal)?
        $(, max = $max: literal)?
        $(, bits = $bits: ident)?
    ;)+) => {
        &[$(RegisterDef {
            address: $addr,
            encoding: Encoding::$enc,
            name: $name,
            scale: optional!($($scale)?),
            unit: optional!($($unit)?),
            min: optional!($($min)?),
            max: optional!($($max)?),
            bits: optional!($($bits)?),
        }),+]
    };
}

pub static INPUT_REGISTERS: &[RegisterDef] = register_table! {
    0: U16, "device_id";
    1: U32, "serial_number";
    3: U16, "mac_address_1";
    4: U16, "mac_address_2";
    5: U16, "mac_address_3";
    6: U32, "hw_version";
    8: U32, "fw_version";
    12: U32, "regmap_version";
    14: U16, "device_variant";
    15: U16, "device_config", bits = CONFIG_BITS;
    16: U32, "current_mode", bits = MODE_BITS;
    18: U32, "errors", bits = ERROR_BITS;
    20: U32, "warnings", bits = WARNING_BITS;
    30: I16, "temp_ambient", scale = 0.1, unit = "°C";
    31: I16, "temp_fresh", scale = 0.1, unit = "°C";
    32: I16, "temp_indoor", scale = 0.1, unit = "°C";
    33: I16, "temp_waste", scale = 0.1, unit = "°C";
    34: I16, "humidity_ambient", scale = 0.1, unit = "%";
    35: I16, "humidity_fresh", scale = 0.1, unit = "%";
    36: I16, "humidity_indoor", scale = 0.1, unit = "%";
    37: I16, "humidity_waste", scale = 0.1, unit = "%";
    38: I16, "temp_external_ntc", scale = 0.1, unit = "°C";
    40: U16, "filter_wear_level", unit = "%";
    41: U16, "power_consumption", unit = "W";
    42: U16, "heat_recovery", unit = "W";
    43: U16, "heating_power", unit = "W";
    44: U16, "air_flow", unit = "m³/h";
    45: U16, "fan_supply_pwm", unit = "%";
    46: U16, "fan_exhaust_pwm", unit = "%";
    47: U16, "fan_supply_rpm", unit = "rpm";
    48: U16, "fan_exhaust_rpm", unit = "rpm";
    49: U16, "voltage_uin1", scale = 0.001, unit = "V";
    50: U16, "voltage_uin2", scale = 0.001, unit = "V";
    51: U16, "digital_inputs";
    52: U16, "battery_voltage", scale = 0.001, unit = "V";
    80: U16, "vzv_identify", bits = ZONE_BITS;
};

pub static HOLDING_REGISTERS: &[RegisterDef] = register_table! {
    0: U16, "ventilation_level", min = 0, max = 6;
    1: U16, "boost_time", unit = "s", min = 0, max = 7200;
    2: U16, "circulation_time", unit = "s", min = 0, max = 7200;
    3: U16, "overpressure_time", unit = "s", min = 0, max = 7200;
    4: U16, "night_time", unit = "s", min = 0, max = 7200;
    5: U16, "party_time", unit = "s", min = 0, max = 28800;
    6: U32, "holiday_begin", unit = "unix";
    8: U32, "holiday_end", unit = "unix";
    10: U16, "temp_setpoint", scale = 0.1, unit = "°C", min = 100, max = 300;
    11: U16, "humidity_setpoint", scale = 0.1, unit = "%", min = 250, max = 750;
    12: U16, "time_program_enable", min = 0, max = 1;
    13: U16, "antiradon_enable", min = 0, max = 1;
    14: U16, "bypass_enable", min = 0, max = 1;
    15: U16, "heating_enable", min = 0, max = 1;
    16: U16, "cooling_enable", min = 0, max = 1;
    17: U16, "comfort_enable", min = 0, max = 1;
    20: U16, "vb_coolbreeze_priority", min = 0, max = 1;
    21: U16, "vb_kitchen_hood_normal", min = 0, max = 1;
    22: U16, "vb_boost_volume", unit = "m³/h", min = 50, max = 150;
    23: U16, "vb_kitchen_hood_volume", unit = "m³/h", min = 50, max = 150;
};

/// One field of a register block that repeats once per zone.
pub struct ZoneField {
    pub offset: u16,
    pub encoding: Encoding,
    pub suffix: &'static str,
    pub scale: Option<f64>,
    pub unit: Option<&'static str>,
    pub min: Option<i32>,
    pub max: Option<i32>,
}

pub const ZONE_COUNT: u16 = 8;
pub const ZONE_SENSOR_BASE: u16 = 300;
pub const ZONE_BUTTON_BASE: u16 = 400;
pub const ZONE_STRIDE: u16 = 10;

macro_rules! zone_table {
    ($($offset: literal: $enc: ident, $suffix: literal
        $(, scale = $scale: literal)?
        $(, unit = $unit: literal)?
        $(, min = $min: literal)?
        $(, max = $max: literal)?
    ;)+) => {
        &[$(ZoneField {
            offset: $offset,
            encoding: Encoding::$enc,
            suffix: $suffix,
            scale: optional!($($scale)?),
            unit: optional!($($unit)?),
            min: optional!($($min)?),
            max: optional!($($max)?),
        }),+]
    };
}

pub static ZONE_SENSOR_FIELDS: &[ZoneField] = zone_table! {
    0: U16, "sensors_present";
    1: U16, "sensors_invalidate";
    2: I16, "temperature", scale = 0.1, unit = "°C", min = -200, max = 1000;
    3: U16, "humidity", unit = "%", min = 0, max = 100;
    4: U16, "co2", unit = "ppm", min = 0, max = 10000;
    5: I16, "floor_temperature", scale = 0.1, unit = "°C", min = -200, max = 1000;
};

pub static ZONE_BUTTON_FIELDS: &[ZoneField] = zone_table! {
    0: U16, "button_present";
    1: U16, "button_mode", min = 0, max = 1;
    2: U16, "button_timer", unit = "s", min = 0, max = 10800;
    3: U16, "button_active", min = 0, max = 1;
};

pub fn zone_field_address(base: u16, zone: u16, offset: u16) -> u16 {
    base + (zone - 1) * ZONE_STRIDE + offset
}

impl ZoneField {
    fn descriptor(&self, base: u16, zone: u16) -> Descriptor {
        Descriptor {
            name: Cow::Owned(format!("zone_{zone}_{}", self.suffix)),
            space: Space::Holding,
            address: zone_field_address(base, zone, self.offset),
            encoding: self.encoding,
            scale: self.scale,
            unit: self.unit,
            min: self.min,
            max: self.max,
            bits: None,
        }
    }
}

/// The full definition of one named register.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub name: Cow<'static, str>,
    pub space: Space,
    pub address: u16,
    pub encoding: Encoding,
    pub scale: Option<f64>,
    pub unit: Option<&'static str>,
    pub min: Option<i32>,
    pub max: Option<i32>,
    pub bits: Option<&'static [BitFlag]>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("register data has {len} words but the value needs words at offset {offset}")]
    DecodeOutOfBounds { offset: usize, len: usize },
    #[error("raw value {value} is outside the range {min}..={max} of `{name}`")]
    ValueOutOfRange { name: String, value: i64, min: i64, max: i64 },
    #[error("`{0}` cannot be encoded as {1}")]
    Unencodable(String, Encoding),
}

impl Descriptor {
    pub fn writable(&self) -> bool {
        self.space == Space::Holding
    }

    /// Decode this register out of a chunk of raw words read off the wire.
    ///
    /// `offset` is relative to the start of `words`, in registers.
    pub fn decode(&self, words: &[u16], offset: usize) -> Result<Value, CodecError> {
        let needed = offset + usize::from(self.encoding.words());
        if needed > words.len() {
            return Err(CodecError::DecodeOutOfBounds { offset, len: words.len() });
        }
        let raw: i64 = match self.encoding {
            Encoding::U16 => i64::from(words[offset]),
            Encoding::I16 => i64::from(words[offset] as i16),
            Encoding::U32 => {
                i64::from(u32::from(words[offset]) << 16 | u32::from(words[offset + 1]))
            }
            Encoding::I32 => {
                i64::from((u32::from(words[offset]) << 16 | u32::from(words[offset + 1])) as i32)
            }
        };
        Ok(match self.scale {
            Some(scale) => Value::Scaled(raw as f64 * scale),
            None => match self.encoding {
                Encoding::U16 => Value::U16(raw as u16),
                Encoding::I16 => Value::I16(raw as i16),
                Encoding::U32 => Value::U32(raw as u32),
                Encoding::I32 => Value::I32(raw as i32),
            },
        })
    }

    /// Encode a value for writing, high word first for 32-bit encodings.
    ///
    /// The scale factor is divided out and the resulting raw integer is
    /// validated against the declared `min`/`max` before anything touches the
    /// wire.
    pub fn encode(&self, value: &Value) -> Result<Vec<u16>, CodecError> {
        let raw = match self.scale {
            Some(scale) => (value.as_f64() / scale).round(),
            None => value.as_f64().round(),
        };
        let (natural_min, natural_max) = self.encoding.natural_range();
        if !raw.is_finite() || raw < natural_min as f64 || raw > natural_max as f64 {
            return Err(CodecError::Unencodable(value.to_string(), self.encoding));
        }
        let raw = raw as i64;
        let min = self.min.map_or(natural_min, i64::from);
        let max = self.max.map_or(natural_max, i64::from);
        if raw < min || raw > max {
            return Err(CodecError::ValueOutOfRange {
                name: self.name.to_string(),
                value: raw,
                min,
                max,
            });
        }
        Ok(match self.encoding {
            Encoding::U16 | Encoding::I16 => vec![raw as u16],
            Encoding::U32 | Encoding::I32 => {
                let wide = raw as u32;
                vec![(wide >> 16) as u16, wide as u16]
            }
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SchemaError {
    #[error("register `{0}` is not known")]
    UnknownRegister(String),
    #[error("duplicate address {1} in the {0} register space")]
    DuplicateAddress(Space, u16),
    #[error("duplicate register name `{0}`")]
    DuplicateName(String),
    #[error("flag `{0}` is declared by more than one bit map")]
    DuplicateFlag(&'static str),
    #[error("register `{0}` declares both a scale and a bit map")]
    ScaledBitMap(String),
}

/// The immutable register map. Built once at startup and validated in the
/// process: duplicate addresses, duplicate names and duplicate bit-map flags
/// are construction errors, not runtime surprises.
#[derive(Debug)]
pub struct Schema {
    descriptors: Vec<Descriptor>,
    by_name: BTreeMap<String, usize>,
}

impl Schema {
    /// Build the schema from the static tables, expanding the per-zone
    /// register blocks for all [`ZONE_COUNT`] zones.
    pub fn load() -> Result<Schema, SchemaError> {
        let mut descriptors = Vec::new();
        for def in INPUT_REGISTERS {
            descriptors.push(def.descriptor(Space::Input));
        }
        for def in HOLDING_REGISTERS {
            descriptors.push(def.descriptor(Space::Holding));
        }
        for zone in 1..=ZONE_COUNT {
            for field in ZONE_SENSOR_FIELDS {
                descriptors.push(field.descriptor(ZONE_SENSOR_BASE, zone));
            }
            for field in ZONE_BUTTON_FIELDS {
                descriptors.push(field.descriptor(ZONE_BUTTON_BASE, zone));
            }
        }
        Schema::from_descriptors(descriptors)
    }

    fn from_descriptors(mut descriptors: Vec<Descriptor>) -> Result<Schema, SchemaError> {
        descriptors.sort_by_key(|d| (d.space, d.address));
        for pair in descriptors.windows(2) {
            if pair[0].space == pair[1].space && pair[0].address == pair[1].address {
                return Err(SchemaError::DuplicateAddress(pair[0].space, pair[0].address));
            }
        }
        let mut by_name = BTreeMap::new();
        let mut flags = BTreeSet::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            if by_name.insert(descriptor.name.to_string(), index).is_some() {
                return Err(SchemaError::DuplicateName(descriptor.name.to_string()));
            }
            let Some(bits) = descriptor.bits else {
                continue;
            };
            if descriptor.scale.is_some() {
                return Err(SchemaError::ScaledBitMap(descriptor.name.to_string()));
            }
            for &(_, flag) in bits {
                if !flags.insert(flag) {
                    return Err(SchemaError::DuplicateFlag(flag));
                }
            }
        }
        Ok(Schema { descriptors, by_name })
    }

    pub fn resolve(&self, name: &str) -> Result<&Descriptor, SchemaError> {
        self.by_name
            .get(name)
            .map(|&index| &self.descriptors[index])
            .ok_or_else(|| SchemaError::UnknownRegister(name.to_string()))
    }

    /// All descriptors of one space, ordered by address.
    pub fn in_space(&self, space: Space) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(move |d| d.space == space)
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }
}

/// Symbolic names for the `ventilation_level` holding register.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive, strum::Display, strum::EnumString,
)]
pub enum VentilationLevel {
    #[strum(serialize = "off")]
    Off = 0,
    #[strum(serialize = "level_1")]
    Level1 = 1,
    #[strum(serialize = "level_2")]
    Level2 = 2,
    #[strum(serialize = "level_3")]
    Level3 = 3,
    #[strum(serialize = "level_4")]
    Level4 = 4,
    #[strum(serialize = "level_5")]
    Level5 = 5,
    #[strum(serialize = "auto")]
    Auto = 6,
}

/// Symbolic names for the per-zone `button_mode` registers.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive, strum::Display, strum::EnumString,
)]
pub enum ZoneButtonMode {
    #[strum(serialize = "boost")]
    Boost = 0,
    #[strum(serialize = "kitchen_hood")]
    KitchenHood = 1,
}

/// Hardware variants reported by the `device_variant` identity register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum DeviceVariant {
    #[strum(serialize = "futura_l")]
    FuturaL,
    #[strum(serialize = "futura_m")]
    FuturaM,
}

impl DeviceVariant {
    /// Register values 0 and 1 both identify the L variant.
    pub fn from_raw(raw: u16) -> Option<DeviceVariant> {
        match raw {
            0 | 1 => Some(DeviceVariant::FuturaL),
            2 => Some(DeviceVariant::FuturaM),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive as _;

    #[test]
    fn schema_loads_and_resolves() {
        let schema = Schema::load().expect("static register tables are valid");
        let fresh = schema.resolve("temp_fresh").unwrap();
        assert_eq!(fresh.space, Space::Input);
        assert_eq!(fresh.address, 31);
        assert_eq!(fresh.scale, Some(0.1));

        let begin = schema.resolve("holiday_begin").unwrap();
        assert_eq!(begin.space, Space::Holding);
        assert_eq!(begin.encoding, Encoding::U32);

        assert!(matches!(
            schema.resolve("no_such_register"),
            Err(SchemaError::UnknownRegister(_))
        ));
    }

    #[test]
    fn zone_registers_expand_with_stride() {
        let schema = Schema::load().unwrap();
        let co2 = schema.resolve("zone_3_co2").unwrap();
        assert_eq!(co2.address, 324);
        let timer = schema.resolve("zone_8_button_timer").unwrap();
        assert_eq!(timer.address, 472);
        // Zone 1 starts right at the block base.
        assert_eq!(schema.resolve("zone_1_sensors_present").unwrap().address, 300);
    }

    #[test]
    fn space_iteration_is_address_ordered() {
        let schema = Schema::load().unwrap();
        for space in [Space::Input, Space::Holding] {
            let addresses: Vec<u16> = schema.in_space(space).map(|d| d.address).collect();
            let mut sorted = addresses.clone();
            sorted.sort_unstable();
            assert_eq!(addresses, sorted);
        }
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let schema = Schema::load().unwrap();
        let mut descriptors = schema.descriptors().to_vec();
        let mut dup = descriptors[0].clone();
        dup.name = Cow::Borrowed("imposter");
        descriptors.push(dup);
        let err = Schema::from_descriptors(descriptors).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAddress(..)));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let schema = Schema::load().unwrap();
        let mut descriptors = schema.descriptors().to_vec();
        let mut dup = descriptors[0].clone();
        dup.address = 9999;
        descriptors.push(dup);
        let err = Schema::from_descriptors(descriptors).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateName(_)));
    }

    #[test]
    fn bit_maps_never_carry_a_scale() {
        let schema = Schema::load().unwrap();
        for descriptor in schema.descriptors() {
            if descriptor.bits.is_some() {
                assert_eq!(descriptor.scale, None, "{}", descriptor.name);
            }
        }
    }

    #[test]
    fn i16_reinterpretation() {
        let schema = Schema::load().unwrap();
        let fresh = schema.resolve("temp_fresh").unwrap();
        assert_eq!(fresh.decode(&[215], 0).unwrap(), Value::Scaled(21.5));
        assert_eq!(fresh.decode(&[65326], 0).unwrap(), Value::Scaled(-21.0));
        // Unscaled signed registers take the same path.
        let plain = Descriptor { scale: None, ..fresh.clone() };
        assert_eq!(plain.decode(&[65326], 0).unwrap(), Value::I16(-210));
        assert_eq!(plain.decode(&[215], 0).unwrap(), Value::I16(215));
    }

    #[test]
    fn u32_composition_is_high_word_first() {
        let schema = Schema::load().unwrap();
        let serial = schema.resolve("serial_number").unwrap();
        let value = serial.decode(&[0x0001, 0x86A0], 0).unwrap();
        assert_eq!(value, Value::U32(100_000));
    }

    #[test]
    fn decode_out_of_bounds_is_reported() {
        let schema = Schema::load().unwrap();
        let serial = schema.resolve("serial_number").unwrap();
        // A 32-bit value needs the word at the offset and the one after it.
        let err = serial.decode(&[0x0001], 0).unwrap_err();
        assert_eq!(err, CodecError::DecodeOutOfBounds { offset: 0, len: 1 });
        let device = schema.resolve("device_id").unwrap();
        let err = device.decode(&[1, 2], 5).unwrap_err();
        assert_eq!(err, CodecError::DecodeOutOfBounds { offset: 5, len: 2 });
    }

    #[test]
    fn encode_decode_round_trips() {
        let schema = Schema::load().unwrap();
        let cases = [
            ("temp_setpoint", Value::Scaled(21.5)),
            ("zone_2_temperature", Value::Scaled(-12.5)),
            ("ventilation_level", Value::U16(4)),
            ("party_time", Value::U16(28800)),
            ("holiday_begin", Value::U32(1_756_684_800)),
        ];
        for (name, value) in cases {
            let descriptor = schema.resolve(name).unwrap();
            let words = descriptor.encode(&value).unwrap();
            assert_eq!(words.len(), usize::from(descriptor.encoding.words()));
            let back = descriptor.decode(&words, 0).unwrap();
            assert_eq!(back, value, "{name}");
        }
    }

    #[test]
    fn encode_splits_u32_high_word_first() {
        let schema = Schema::load().unwrap();
        let begin = schema.resolve("holiday_begin").unwrap();
        let words = begin.encode(&Value::U32(0x1234_5678)).unwrap();
        assert_eq!(words, vec![0x1234, 0x5678]);
    }

    #[test]
    fn encode_rejects_out_of_range_values() {
        let schema = Schema::load().unwrap();
        let setpoint = schema.resolve("temp_setpoint").unwrap();
        // 35.0 °C divides out to raw 350, above the raw maximum of 300.
        let err = setpoint.encode(&Value::Scaled(35.0)).unwrap_err();
        assert!(matches!(err, CodecError::ValueOutOfRange { value: 350, .. }));
        let level = schema.resolve("ventilation_level").unwrap();
        let err = level.encode(&Value::U16(7)).unwrap_err();
        assert!(matches!(err, CodecError::ValueOutOfRange { value: 7, .. }));
    }

    #[test]
    fn encode_rejects_unrepresentable_values() {
        let schema = Schema::load().unwrap();
        let co2 = schema.resolve("zone_1_co2").unwrap();
        let err = co2.encode(&Value::Scaled(f64::NAN)).unwrap_err();
        assert!(matches!(err, CodecError::Unencodable(..)));
    }

    #[test]
    fn negative_values_wrap_into_twos_complement() {
        let schema = Schema::load().unwrap();
        let temp = schema.resolve("zone_1_temperature").unwrap();
        let words = temp.encode(&Value::Scaled(-20.0)).unwrap();
        assert_eq!(words, vec![65336]);
    }

    #[test]
    fn device_variants_map_from_the_identity_register() {
        assert_eq!(DeviceVariant::from_raw(0), Some(DeviceVariant::FuturaL));
        assert_eq!(DeviceVariant::from_raw(1), Some(DeviceVariant::FuturaL));
        assert_eq!(DeviceVariant::from_raw(2), Some(DeviceVariant::FuturaM));
        assert_eq!(DeviceVariant::from_raw(3), None);
        assert_eq!(DeviceVariant::FuturaM.to_string(), "futura_m");
    }

    #[test]
    fn symbolic_level_names_round_trip() {
        assert_eq!("auto".parse::<VentilationLevel>().unwrap(), VentilationLevel::Auto);
        assert_eq!(VentilationLevel::from_u16(3), Some(VentilationLevel::Level3));
        assert_eq!(VentilationLevel::Level3.to_string(), "level_3");
        assert_eq!(ZoneButtonMode::from_u16(1), Some(ZoneButtonMode::KitchenHood));
    }
}
