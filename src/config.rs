//! `--device` directive parsing.
//!
//! Each repeatable `--device` flag carries one directive of the form
//! `name[:arg0[,arg1...]]`, mirroring the platform's historical
//! `parse_args` kernel command-line mini-language.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown device directive: {0}")]
    UnknownDirective(String),
    #[error("directive {directive} expected {expected} argument(s), got {got}")]
    ArgCount {
        directive: String,
        expected: usize,
        got: usize,
    },
    #[error("directive {directive} has a non-numeric argument: {value}")]
    NotANumber { directive: String, value: String },
}

/// A single parsed `--device` directive.
#[derive(Debug, PartialEq, Eq)]
pub enum Directive {
    /// `kbc:iobase,irqkeyb,irqaux`
    Kbc {
        iobase: u16,
        irq_kbd: u8,
        irq_aux: u8,
    },
    /// `kbmodifier:mask`
    KbModifier { mask: u8 },
    /// `panic` — abort on the next unimplemented HostOp instead of logging
    /// and continuing where that would otherwise be tolerated.
    Panic,
}

fn parse_num<T>(directive: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    let trimmed = value.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| v.to_string().parse::<T>().ok())
    } else {
        trimmed.parse::<T>().ok()
    };
    parsed.ok_or_else(|| ConfigError::NotANumber {
        directive: directive.to_string(),
        value: value.to_string(),
    })
}

/// Parse one `--device` directive string.
pub fn parse_directive(raw: &str) -> Result<Directive, ConfigError> {
    let (name, rest) = match raw.split_once(':') {
        Some((n, r)) => (n, Some(r)),
        None => (raw, None),
    };

    match name {
        "kbc" => {
            let rest = rest.unwrap_or_default();
            let parts: Vec<&str> = rest.split(',').filter(|s| !s.is_empty()).collect();
            if parts.len() != 3 {
                return Err(ConfigError::ArgCount {
                    directive: "kbc".to_string(),
                    expected: 3,
                    got: parts.len(),
                });
            }
            Ok(Directive::Kbc {
                iobase: parse_num("kbc", parts[0])?,
                irq_kbd: parse_num("kbc", parts[1])?,
                irq_aux: parse_num("kbc", parts[2])?,
            })
        }
        "kbmodifier" => {
            let rest = rest.unwrap_or_default();
            Ok(Directive::KbModifier {
                mask: parse_num("kbmodifier", rest)?,
            })
        }
        "panic" => Ok(Directive::Panic),
        other => Err(ConfigError::UnknownDirective(other.to_string())),
    }
}

/// Parse every `--device` directive supplied on the command line.
pub fn parse_args(raw: &[String]) -> Result<Vec<Directive>, ConfigError> {
    raw.iter().map(|s| parse_directive(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kbc_directive() {
        let d = parse_directive("kbc:0x60,1,12").unwrap();
        assert_eq!(
            d,
            Directive::Kbc {
                iobase: 0x60,
                irq_kbd: 1,
                irq_aux: 12
            }
        );
    }

    #[test]
    fn rejects_wrong_arg_count() {
        let err = parse_directive("kbc:60,1").unwrap_err();
        assert_eq!(
            err,
            ConfigError::ArgCount {
                directive: "kbc".to_string(),
                expected: 3,
                got: 2
            }
        );
    }

    #[test]
    fn rejects_unknown_directive() {
        assert!(matches!(
            parse_directive("frobnicate:1"),
            Err(ConfigError::UnknownDirective(_))
        ));
    }

    #[test]
    fn parses_panic_directive_with_no_args() {
        assert_eq!(parse_directive("panic").unwrap(), Directive::Panic);
    }
}
