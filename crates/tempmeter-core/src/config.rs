//! Configuration for the ingestion pipeline.
//!
//! Every value has a default, and every effective value is printable through
//! `Display` so the daemon can log the full configuration at startup.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Error returned when a configuration value is invalid.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A field holds a value outside its allowed domain.
    Invalid { field: &'static str, reason: String },
    /// A textual value could not be parsed.
    Syntax { input: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { field, reason } => write!(f, "invalid {}: {}", field, reason),
            ConfigError::Syntax { input, reason } => {
                write!(f, "cannot parse '{}': {}", input, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn syntax(input: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Syntax {
        input: input.to_string(),
        reason: reason.into(),
    }
}

// ── Serial line settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

impl FromStr for Parity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            _ => Err(syntax(s, "expected none, odd or even")),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
        })
    }
}

impl FromStr for DataBits {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "5" => Ok(DataBits::Five),
            "6" => Ok(DataBits::Six),
            "7" => Ok(DataBits::Seven),
            "8" => Ok(DataBits::Eight),
            _ => Err(syntax(s, "expected 5, 6, 7 or 8")),
        }
    }
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataBits::Five => "5",
            DataBits::Six => "6",
            DataBits::Seven => "7",
            DataBits::Eight => "8",
        })
    }
}

impl FromStr for StopBits {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "2" => Ok(StopBits::Two),
            _ => Err(syntax(s, "expected 1 or 2")),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopBits::One => "1",
            StopBits::Two => "2",
        })
    }
}

impl FromStr for FlowControl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(FlowControl::None),
            "software" | "xonxoff" => Ok(FlowControl::Software),
            "hardware" | "rtscts" => Ok(FlowControl::Hardware),
            _ => Err(syntax(s, "expected none, software or hardware")),
        }
    }
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowControl::None => "none",
            FlowControl::Software => "software",
            FlowControl::Hardware => "hardware",
        })
    }
}

/// Serial port settings used by `PortConnection::open`.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    /// Port identifier, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Upper bound for a single `read_chunk` call.
    pub read_timeout: Duration,
    /// Maximum number of bytes returned by a single read.
    pub chunk_size: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            read_timeout: Duration::from_millis(500),
            chunk_size: 1024,
        }
    }
}

impl PortConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(invalid("port", "must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud_rate", "must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(invalid("read_timeout", "must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be positive"));
        }
        Ok(())
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "port={} baud={} parity={} data_bits={} stop_bits={} flow={} read_timeout={}ms chunk={}B",
            self.port,
            self.baud_rate,
            self.parity,
            self.data_bits,
            self.stop_bits,
            self.flow_control,
            self.read_timeout.as_millis(),
            self.chunk_size
        )
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Frame boundary settings used by `FrameReader`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameConfig {
    /// Non-empty byte sequence terminating each frame.
    pub delimiter: Vec<u8>,
    /// Longest frame body accepted, delimiter excluded.
    pub max_frame_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            delimiter: b"\n".to_vec(),
            max_frame_len: 256,
        }
    }
}

impl FrameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delimiter.is_empty() {
            return Err(invalid("delimiter", "must not be empty"));
        }
        if self.max_frame_len == 0 {
            return Err(invalid("max_frame_len", "must be positive"));
        }
        Ok(())
    }
}

impl fmt::Display for FrameConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delimiter=\"{}\" max_frame_len={}",
            escape_bytes(&self.delimiter),
            self.max_frame_len
        )
    }
}

/// Parses a delimiter given on the command line.
///
/// Understands `\n`, `\r`, `\t`, `\0`, `\\` and `\xNN` escapes.
pub fn parse_delimiter(s: &str) -> Result<Vec<u8>, ConfigError> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .map_err(|_| syntax(s, format!("bad hex escape '\\x{}'", hex)))?;
                out.push(byte);
            }
            Some(other) => return Err(syntax(s, format!("unknown escape '\\{}'", other))),
            None => return Err(syntax(s, "trailing backslash")),
        }
    }
    if out.is_empty() {
        return Err(syntax(s, "delimiter must not be empty"));
    }
    Ok(out)
}

/// Renders bytes with control characters escaped, for logs.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

// ── Frame format ─────────────────────────────────────────────────────────────

/// What a positional field in a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Temperature,
    Humidity,
    /// Present in the frame but not stored.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub role: FieldRole,
    pub optional: bool,
}

/// Positional layout of the fields within a frame.
///
/// Written as a comma separated list, e.g. `temperature,humidity?`. A trailing
/// `?` marks a field the device may omit; optional fields must come last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    fields: Vec<FieldSpec>,
}

impl FieldLayout {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, ConfigError> {
        let layout = Self { fields };
        layout.validate()?;
        Ok(layout)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Number of fields a frame must carry at least.
    pub fn required_count(&self) -> usize {
        self.fields.iter().filter(|f| !f.optional).count()
    }

    /// Number of fields a frame may carry at most.
    pub fn max_count(&self) -> usize {
        self.fields.len()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let temperatures: Vec<&FieldSpec> = self
            .fields
            .iter()
            .filter(|f| f.role == FieldRole::Temperature)
            .collect();
        if temperatures.len() != 1 {
            return Err(invalid("layout", "exactly one temperature field is required"));
        }
        if temperatures[0].optional {
            return Err(invalid("layout", "the temperature field cannot be optional"));
        }
        if self
            .fields
            .iter()
            .filter(|f| f.role == FieldRole::Humidity)
            .count()
            > 1
        {
            return Err(invalid("layout", "at most one humidity field is allowed"));
        }
        let first_optional = self.fields.iter().position(|f| f.optional);
        if let Some(idx) = first_optional
            && self.fields[idx..].iter().any(|f| !f.optional)
        {
            return Err(invalid("layout", "optional fields must come last"));
        }
        Ok(())
    }
}

impl Default for FieldLayout {
    fn default() -> Self {
        Self {
            fields: vec![
                FieldSpec {
                    role: FieldRole::Temperature,
                    optional: false,
                },
                FieldSpec {
                    role: FieldRole::Humidity,
                    optional: true,
                },
            ],
        }
    }
}

impl FromStr for FieldLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            let (name, optional) = match part.strip_suffix('?') {
                Some(name) => (name.trim(), true),
                None => (part, false),
            };
            let role = match name.to_ascii_lowercase().as_str() {
                "temperature" | "temp" | "t" => FieldRole::Temperature,
                "humidity" | "hum" | "h" => FieldRole::Humidity,
                "ignore" | "_" => FieldRole::Ignore,
                _ => return Err(syntax(s, format!("unknown field '{}'", name))),
            };
            fields.push(FieldSpec { role, optional });
        }
        FieldLayout::new(fields)
    }
}

impl fmt::Display for FieldLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|spec| {
                let name = match spec.role {
                    FieldRole::Temperature => "temperature",
                    FieldRole::Humidity => "humidity",
                    FieldRole::Ignore => "ignore",
                };
                if spec.optional {
                    format!("{}?", name)
                } else {
                    name.to_string()
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Inclusive plausibility bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(invalid(field, "bounds must be finite"));
        }
        if self.min > self.max {
            return Err(invalid(field, format!("min {} exceeds max {}", self.min, self.max)));
        }
        Ok(())
    }
}

impl FromStr for ValueRange {
    type Err = ConfigError;

    /// Parses `MIN..MAX` (both inclusive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s
            .split_once("..")
            .ok_or_else(|| syntax(s, "expected MIN..MAX"))?;
        let min = min
            .trim()
            .parse::<f64>()
            .map_err(|e| syntax(s, e.to_string()))?;
        let max = max
            .trim()
            .parse::<f64>()
            .map_err(|e| syntax(s, e.to_string()))?;
        Ok(Self { min, max })
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// Linear conversion of a raw ADC count into a temperature.
///
/// `value = (raw * reference_voltage / adc_max - offset_volts) * units_per_volt`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcScaling {
    pub reference_voltage: f64,
    pub adc_max: u32,
    pub offset_volts: f64,
    pub units_per_volt: f64,
}

impl AdcScaling {
    /// TMP36 on a 10-bit ADC: 500 mV offset, 10 mV per degree Celsius.
    pub fn tmp36(reference_voltage: f64) -> Self {
        Self {
            reference_voltage,
            adc_max: 1023,
            offset_volts: 0.5,
            units_per_volt: 100.0,
        }
    }

    pub fn convert(&self, raw: u32) -> f64 {
        (raw as f64 * self.reference_voltage / self.adc_max as f64 - self.offset_volts)
            * self.units_per_volt
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.adc_max == 0 {
            return Err(invalid("adc_scaling", "adc_max must be positive"));
        }
        if !self.reference_voltage.is_finite()
            || !self.offset_volts.is_finite()
            || !self.units_per_volt.is_finite()
        {
            return Err(invalid("adc_scaling", "coefficients must be finite"));
        }
        Ok(())
    }
}

impl FromStr for AdcScaling {
    type Err = ConfigError;

    /// Parses `VREF:ADC_MAX:OFFSET_VOLTS:UNITS_PER_VOLT`, or `tmp36` / `tmp36:VREF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let number = |p: &str| p.parse::<f64>().map_err(|e| syntax(s, e.to_string()));
        match parts.as_slice() {
            ["tmp36"] => Ok(Self::tmp36(5.0)),
            ["tmp36", vref] => Ok(Self::tmp36(number(vref)?)),
            [vref, max, offset, gain] => Ok(Self {
                reference_voltage: number(vref)?,
                adc_max: max.parse::<u32>().map_err(|e| syntax(s, e.to_string()))?,
                offset_volts: number(offset)?,
                units_per_volt: number(gain)?,
            }),
            _ => Err(syntax(s, "expected VREF:ADC_MAX:OFFSET:GAIN or tmp36[:VREF]")),
        }
    }
}

impl fmt::Display for AdcScaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.reference_voltage, self.adc_max, self.offset_volts, self.units_per_volt
        )
    }
}

/// How frame text maps onto a `Reading`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatConfig {
    /// Separator between fields within one frame.
    pub separator: String,
    pub layout: FieldLayout,
    pub temperature_range: ValueRange,
    pub humidity_range: ValueRange,
    /// When set, the temperature field is a raw ADC count.
    pub adc: Option<AdcScaling>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            separator: ",".to_string(),
            layout: FieldLayout::default(),
            // TMP36 operating range.
            temperature_range: ValueRange::new(-40.0, 125.0),
            humidity_range: ValueRange::new(0.0, 100.0),
            adc: None,
        }
    }
}

impl FormatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.separator.is_empty() {
            return Err(invalid("separator", "must not be empty"));
        }
        self.layout.validate()?;
        self.temperature_range.validate("temperature_range")?;
        self.humidity_range.validate("humidity_range")?;
        if let Some(adc) = &self.adc {
            adc.validate()?;
        }
        Ok(())
    }
}

impl fmt::Display for FormatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "separator=\"{}\" layout={} temperature={} humidity={} adc={}",
            escape_bytes(self.separator.as_bytes()),
            self.layout,
            self.temperature_range,
            self.humidity_range,
            self.adc
                .map(|a| a.to_string())
                .unwrap_or_else(|| "off".to_string())
        )
    }
}

// ── Retry ────────────────────────────────────────────────────────────────────

/// Reconnect delay policy: exponential growth, capped, with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the reconnect following `failures` previous consecutive failures.
    ///
    /// `sample` is a uniform random value in `[0, 1)`. The result never exceeds
    /// `max`, and for a fixed sample it never decreases as `failures` grows.
    pub fn delay_for(&self, failures: u32, sample: f64) -> Duration {
        let max = self.max.as_secs_f64();
        let exp = self.initial.as_secs_f64() * self.multiplier.powi(failures.min(64) as i32);
        let capped = exp.min(max);
        let sample = sample.clamp(0.0, 1.0);
        let jittered = (capped * (1.0 + self.jitter * sample)).min(max);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial > self.max {
            return Err(invalid("backoff", "initial delay exceeds max delay"));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(invalid("backoff", "multiplier must be a finite value >= 1"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(invalid("backoff", "jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

impl fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "initial={}ms max={}ms multiplier={} jitter={}",
            self.initial.as_millis(),
            self.max.as_millis(),
            self.multiplier,
            self.jitter
        )
    }
}

// ── Top level ────────────────────────────────────────────────────────────────

/// Everything the ingestion loop needs.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub port: PortConfig,
    pub framing: FrameConfig,
    pub format: FormatConfig,
    pub backoff: BackoffPolicy,
    /// How long a sink may take to accept one reading before it counts as stalled.
    pub sink_timeout: Duration,
    /// Capacity of the fault event channel.
    pub fault_queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            port: PortConfig::default(),
            framing: FrameConfig::default(),
            format: FormatConfig::default(),
            backoff: BackoffPolicy::default(),
            sink_timeout: Duration::from_secs(2),
            fault_queue_capacity: 256,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.port.validate()?;
        self.framing.validate()?;
        self.format.validate()?;
        self.backoff.validate()?;
        if self.sink_timeout.is_zero() {
            return Err(invalid("sink_timeout", "must be positive"));
        }
        Ok(())
    }
}

impl fmt::Display for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; {}; {}; backoff {}; sink_timeout={}ms fault_queue={}",
            self.port,
            self.framing,
            self.format,
            self.backoff,
            self.sink_timeout.as_millis(),
            self.fault_queue_capacity
        )
    }
}
