//! Frame to `Reading` conversion.
//!
//! Parsing is a pure function of the frame bytes, the configured format and
//! the capture timestamp supplied by the caller. Ambiguous input is rejected,
//! never guessed at: numbers must be plain decimals (optional sign, digits, at
//! most one `.`), and a field may only carry a trailing alphabetic unit label
//! such as `23.45 Celsius`.

use std::fmt;

use crate::config::{AdcScaling, FieldLayout, FieldRole, FormatConfig, ValueRange};
use crate::framing::Frame;
use crate::reading::Reading;

/// Why a frame was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Bad encoding, wrong field count, or text that is not a number.
    MalformedFrame(String),
    /// A value failed its plausibility check.
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    /// A raw ADC value could not be scaled into a temperature.
    UnitConversionFailure(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedFrame(msg) => write!(f, "malformed frame: {}", msg),
            ParseError::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{} {} outside plausible range {}..{}", field, value, min, max),
            ParseError::UnitConversionFailure(msg) => write!(f, "unit conversion failed: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

pub struct ReadingParser {
    separator: String,
    layout: FieldLayout,
    temperature_range: ValueRange,
    humidity_range: ValueRange,
    adc: Option<AdcScaling>,
}

impl ReadingParser {
    pub fn new(config: &FormatConfig) -> Self {
        Self {
            separator: config.separator.clone(),
            layout: config.layout.clone(),
            temperature_range: config.temperature_range,
            humidity_range: config.humidity_range,
            adc: config.adc,
        }
    }

    /// Parses one frame captured at `captured_at` (unix seconds).
    pub fn parse(&self, frame: &Frame, captured_at: i64) -> Result<Reading, ParseError> {
        let text = std::str::from_utf8(frame.as_bytes()).map_err(|e| {
            ParseError::MalformedFrame(format!("invalid UTF-8 at byte {}", e.valid_up_to()))
        })?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::MalformedFrame("empty frame".to_string()));
        }

        let fields: Vec<&str> = text.split(self.separator.as_str()).map(str::trim).collect();
        let (min, max) = (self.layout.required_count(), self.layout.max_count());
        if fields.len() < min || fields.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{}..{}", min, max)
            };
            return Err(ParseError::MalformedFrame(format!(
                "expected {} fields, got {}",
                expected,
                fields.len()
            )));
        }

        let mut temperature = None;
        let mut humidity = None;

        for (spec, raw) in self.layout.fields().iter().zip(&fields) {
            if raw.is_empty() {
                if spec.optional {
                    continue;
                }
                return Err(ParseError::MalformedFrame(format!(
                    "required field {:?} is empty",
                    spec.role
                )));
            }
            match spec.role {
                FieldRole::Temperature => temperature = Some(self.temperature(raw)?),
                FieldRole::Humidity => {
                    let value = parse_decimal(raw)?;
                    check_range("humidity", value, &self.humidity_range)?;
                    humidity = Some(value);
                }
                FieldRole::Ignore => {}
            }
        }

        // The layout always holds one required temperature field.
        let temperature = temperature.ok_or_else(|| {
            ParseError::MalformedFrame("frame carries no temperature".to_string())
        })?;

        Ok(Reading::new(captured_at, temperature, humidity))
    }

    fn temperature(&self, raw: &str) -> Result<f64, ParseError> {
        let value = match &self.adc {
            Some(adc) => scale_adc(raw, adc)?,
            None => parse_decimal(raw)?,
        };
        check_range("temperature", value, &self.temperature_range)?;
        Ok(value)
    }
}

fn check_range(field: &'static str, value: f64, range: &ValueRange) -> Result<(), ParseError> {
    if range.contains(value) {
        Ok(())
    } else {
        Err(ParseError::OutOfRange {
            field,
            value,
            min: range.min,
            max: range.max,
        })
    }
}

/// Splits `"23.45 Celsius"` into `"23.45"`, rejecting anything after the
/// number that is not a unit label.
fn numeric_part(field: &str) -> Result<&str, ParseError> {
    let mut tokens = field.split_whitespace();
    let number = tokens.next().unwrap_or("");
    for token in tokens {
        let is_label = token
            .chars()
            .all(|c| c.is_alphabetic() || c == '°' || c == '%');
        if !is_label {
            return Err(ParseError::MalformedFrame(format!(
                "unexpected text after number in '{}'",
                field
            )));
        }
    }
    Ok(number)
}

fn parse_decimal(field: &str) -> Result<f64, ParseError> {
    let number = numeric_part(field)?;
    let digits = number.strip_prefix(&['+', '-'][..]).unwrap_or(number);

    let mut seen_digit = false;
    let mut seen_dot = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => {
                return Err(ParseError::MalformedFrame(format!(
                    "'{}' is not a decimal number",
                    field
                )));
            }
        }
    }
    if !seen_digit {
        return Err(ParseError::MalformedFrame(format!(
            "'{}' is not a decimal number",
            field
        )));
    }

    number
        .parse::<f64>()
        .map_err(|e| ParseError::MalformedFrame(format!("'{}': {}", field, e)))
}

fn scale_adc(field: &str, adc: &AdcScaling) -> Result<f64, ParseError> {
    let number = numeric_part(field)?;
    if number.contains('.') || number.starts_with('-') {
        // Still numeric, just not a valid ADC count.
        parse_decimal(number)?;
        return Err(ParseError::UnitConversionFailure(format!(
            "raw ADC value '{}' is not a non-negative integer",
            number
        )));
    }
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseError::MalformedFrame(format!(
            "'{}' is not an ADC count",
            field
        )));
    }
    let raw: u32 = digits.parse().map_err(|_| {
        ParseError::UnitConversionFailure(format!("ADC count '{}' does not fit", digits))
    })?;
    if raw > adc.adc_max {
        return Err(ParseError::UnitConversionFailure(format!(
            "ADC count {} exceeds maximum {}",
            raw, adc.adc_max
        )));
    }
    let value = adc.convert(raw);
    if !value.is_finite() {
        return Err(ParseError::UnitConversionFailure(format!(
            "ADC count {} scales to a non-finite value",
            raw
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Frame {
        Frame::new(bytes.to_vec())
    }

    fn parser() -> ReadingParser {
        ReadingParser::new(&FormatConfig::default())
    }

    #[test]
    fn test_temperature_and_humidity() {
        let reading = parser().parse(&frame(b"23.5,41"), 1000).unwrap();
        assert_eq!(reading, Reading::new(1000, 23.5, Some(41.0)));

        let reading = parser().parse(&frame(b"24.1,40\r"), 1001).unwrap();
        assert_eq!(reading, Reading::new(1001, 24.1, Some(40.0)));
    }

    #[test]
    fn test_optional_humidity() {
        assert_eq!(
            parser().parse(&frame(b"23.5"), 1).unwrap(),
            Reading::new(1, 23.5, None)
        );
        assert_eq!(
            parser().parse(&frame(b"23.5,"), 1).unwrap(),
            Reading::new(1, 23.5, None)
        );
    }

    #[test]
    fn test_unit_label_is_ignored() {
        let reading = parser().parse(&frame(b" 23.45 Celsius"), 5).unwrap();
        assert_eq!(reading.temperature(), 23.45);
        let reading = parser().parse(&frame(b"23.45 \xc2\xb0C, 40 %"), 5).unwrap();
        assert_eq!(reading.humidity(), Some(40.0));
    }

    #[test]
    fn test_malformed_frames() {
        let cases: &[&[u8]] = &[
            b"",
            b"   ",
            b"abc",
            b"23.5,41,7",
            b"1e3",
            b"0x1A",
            b"nan",
            b"inf",
            b"23..5",
            b"2.3.5",
            b"-",
            b".",
            b"23.5 12",
            b"\xff\xfe",
            b",41",
        ];
        for case in cases {
            let result = parser().parse(&frame(case), 0);
            assert!(
                matches!(result, Err(ParseError::MalformedFrame(_))),
                "{:?} -> {:?}",
                String::from_utf8_lossy(case),
                result
            );
        }
    }

    #[test]
    fn test_range_boundaries() {
        let p = parser();
        assert!(p.parse(&frame(b"125"), 0).is_ok());
        assert!(p.parse(&frame(b"-40"), 0).is_ok());
        assert_eq!(
            p.parse(&frame(b"126"), 0),
            Err(ParseError::OutOfRange {
                field: "temperature",
                value: 126.0,
                min: -40.0,
                max: 125.0
            })
        );
        assert!(matches!(
            p.parse(&frame(b"-41"), 0),
            Err(ParseError::OutOfRange { .. })
        ));
        assert!(p.parse(&frame(b"20,100"), 0).is_ok());
        assert!(matches!(
            p.parse(&frame(b"20,101"), 0),
            Err(ParseError::OutOfRange {
                field: "humidity",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let p = parser();
        let inputs: [&[u8]; 4] = [b"23.5,41", b"bogus", b"999", b"23.5 Celsius"];
        for input in inputs {
            assert_eq!(p.parse(&frame(input), 7), p.parse(&frame(input), 7));
        }
    }

    #[test]
    fn test_custom_separator_and_ignored_field() {
        let config = FormatConfig {
            separator: ";".to_string(),
            layout: "ignore,temperature,humidity".parse().unwrap(),
            ..FormatConfig::default()
        };
        let p = ReadingParser::new(&config);
        assert_eq!(
            p.parse(&frame(b"S1;21.0;55"), 3).unwrap(),
            Reading::new(3, 21.0, Some(55.0))
        );
        assert!(matches!(
            p.parse(&frame(b"S1;21.0"), 3),
            Err(ParseError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_adc_scaling() {
        let config = FormatConfig {
            layout: "temperature".parse().unwrap(),
            adc: Some(AdcScaling::tmp36(5.0)),
            ..FormatConfig::default()
        };
        let p = ReadingParser::new(&config);

        let reading = p.parse(&frame(b"153"), 0).unwrap();
        assert!((reading.temperature() - 24.78).abs() < 0.01);

        assert!(matches!(
            p.parse(&frame(b"1024"), 0),
            Err(ParseError::UnitConversionFailure(_))
        ));
        assert!(matches!(
            p.parse(&frame(b"153.5"), 0),
            Err(ParseError::UnitConversionFailure(_))
        ));
        assert!(matches!(
            p.parse(&frame(b"-3"), 0),
            Err(ParseError::UnitConversionFailure(_))
        ));
        assert!(matches!(
            p.parse(&frame(b"99999999999"), 0),
            Err(ParseError::UnitConversionFailure(_))
        ));
        assert!(matches!(
            p.parse(&frame(b"abc"), 0),
            Err(ParseError::MalformedFrame(_))
        ));
        // 0 counts is -50 °C on a TMP36, below the plausible range.
        assert!(matches!(
            p.parse(&frame(b"0"), 0),
            Err(ParseError::OutOfRange { .. })
        ));
    }
}
