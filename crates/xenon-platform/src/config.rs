//! Hand-rolled `key = value` configuration file parser. The wire format is
//! specified (§6), not negotiable, so this doesn't reach for a TOML/YAML
//! crate: one line per setting, `#` starts a comment, blank lines ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{AvPackType, PowerOnReason};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected 'key = value', got '{text}'")]
    Malformed { line: usize, text: String },
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("invalid value for '{key}': '{value}'")]
    InvalidValue { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UartTransport {
    Socket { ip: String, port: u16 },
    Print,
    Vcom { com_port: String },
}

/// Immutable once constructed; passed by reference to every component.
#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: String,
    pub log_to_file: Option<PathBuf>,
    pub ram_size: u64,
    pub boot_image_path: PathBuf,
    pub fuses_path: PathBuf,
    pub nand_image_path: PathBuf,
    pub hdd_image_path: Option<PathBuf>,
    pub odd_image_path: Option<PathBuf>,
    pub uart: UartTransport,
    pub power_on_reason: PowerOnReason,
    pub av_pack: AvPackType,
    pub override_init_skip: bool,
    pub hw_init_skip_1: u64,
    pub hw_init_skip_2: u64,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut kv = HashMap::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Malformed {
                line: idx + 1,
                text: raw_line.to_string(),
            })?;
            kv.insert(key.trim().to_string(), value.trim().to_string());
        }

        let get = |key: &'static str| -> Result<String, ConfigError> {
            kv.get(key).cloned().ok_or(ConfigError::MissingKey(key))
        };
        let get_opt = |key: &str| kv.get(key).cloned();

        let ram_size = parse_u64(&get("ram_size")?, "ram_size")?;
        let boot_image_path = PathBuf::from(get("boot_image")?);
        let fuses_path = PathBuf::from(get("fuses_path")?);
        let nand_image_path = PathBuf::from(get("nand_image")?);
        let hdd_image_path = get_opt("hdd_image").map(PathBuf::from);
        let odd_image_path = get_opt("odd_image").map(PathBuf::from);

        let uart = match get_opt("uart_transport").as_deref() {
            Some("socket") | None => UartTransport::Socket {
                ip: get_opt("uart_socket_ip").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: get_opt("uart_socket_port")
                    .map(|v| parse_u64(&v, "uart_socket_port").map(|n| n as u16))
                    .transpose()?
                    .unwrap_or(7000),
            },
            Some("print") => UartTransport::Print,
            Some("vcom") => UartTransport::Vcom {
                com_port: get_opt("uart_com_port").unwrap_or_else(|| "COM1".to_string()),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "uart_transport".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let power_on_reason = match get_opt("power_on_reason").as_deref() {
            Some("power_button") | None => PowerOnReason::PowerButton,
            Some("eject_button") => PowerOnReason::EjectButton,
            Some("controller") => PowerOnReason::Controller,
            Some("internal_power_cycle") => PowerOnReason::InternalPowerCycle,
            Some("internal_hw_reset") => PowerOnReason::InternalHwReset,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "power_on_reason".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let av_pack = match get_opt("av_pack").as_deref() {
            Some("hdmi") | None => AvPackType::Hdmi,
            Some("component") => AvPackType::Component,
            Some("vga") => AvPackType::Vga,
            Some("standard") => AvPackType::Standard,
            Some("none") => AvPackType::None,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "av_pack".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let hw_init_skip_1 = get_opt("hw_init_skip_1")
            .map(|v| parse_u64(&v, "hw_init_skip_1"))
            .transpose()?
            .unwrap_or(0);
        let hw_init_skip_2 = get_opt("hw_init_skip_2")
            .map(|v| parse_u64(&v, "hw_init_skip_2"))
            .transpose()?
            .unwrap_or(0);

        Ok(Config {
            log_level: get_opt("log_level").unwrap_or_else(|| "info".to_string()),
            log_to_file: get_opt("log_file").map(PathBuf::from),
            ram_size,
            boot_image_path,
            fuses_path,
            nand_image_path,
            hdd_image_path,
            odd_image_path,
            uart,
            power_on_reason,
            av_pack,
            override_init_skip: hw_init_skip_1 != 0 || hw_init_skip_2 != 0,
            hw_init_skip_1,
            hw_init_skip_2,
        })
    }
}

fn parse_u64(value: &str, key: &str) -> Result<u64, ConfigError> {
    let value = value.trim();
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse::<u64>()
    };
    parsed.map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let text = "\
            # ram and image paths\n\
            ram_size = 0x20000000\n\
            boot_image = /tmp/1bl.bin\n\
            fuses_path = /tmp/fuses.bin\n\
            nand_image = /tmp/nand.bin\n\
            uart_transport = print\n\
        ";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.ram_size, 0x2000_0000);
        assert_eq!(cfg.uart, UartTransport::Print);
    }

    #[test]
    fn missing_required_key_is_reported() {
        let err = Config::parse("ram_size = 0x1000\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("boot_image")));
    }

    #[test]
    fn malformed_line_is_reported_with_its_line_number() {
        let text = "ram_size = 0x1000\nnot-a-kv-pair\n";
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 2, .. }));
    }
}
