//! Ubertooth One capture source
//!
//! Runs `ubertooth-btle -n` (advertising channels only) and turns its text dump
//! into observations. A packet looks like:
//!
//! ```text
//! systime=1700000000 freq=2402 addr=8e89bed6 delta_t=0.402 ms rssi=-62
//! 40 11 ef cd ab 19 99 f0 02 01 06 07 09 54 68 65 72 6d 6f 93 2b 8a
//! Advertising / AA 8e89bed6 (valid)/ 17 bytes
//!     Channel Index: 37
//!     Type:  ADV_IND
//!     AdvA:  f0:99:19:ab:cd:ef (random)
//!     AdvData: 02 01 06 07 09 54 68 65 72 6d 6f
//!     CRC:   93 2b 8a
//! ```

use crate::domain::address::MacAddress;
use crate::domain::models::Advertisement;
use crate::domain::settings::SnifferSettings;
use crate::error::AdapterError;
use crate::infrastructure::bluetooth::protocol::parse_advertising_data;
use crate::infrastructure::bluetooth::sniffer::{SniffSource, SniffStream};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, trace};

#[derive(Default)]
struct PartialPacket {
    rssi: Option<i16>,
    address: Option<MacAddress>,
    payload: Vec<u8>,
}

impl PartialPacket {
    fn finish(self) -> Option<Advertisement> {
        let address = self.address?;
        let mut advertisement =
            parse_advertising_data(&self.payload).apply_to(Advertisement::new(address));
        if let Some(rssi) = self.rssi {
            advertisement = advertisement.with_rssi(rssi);
        }
        Some(advertisement)
    }
}

/// Line-oriented parser for `ubertooth-btle` output.
#[derive(Default)]
pub struct UbertoothParser {
    current: Option<PartialPacket>,
}

impl UbertoothParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns an observation when a packet completes.
    /// Packets without an advertiser address (data channel traffic) are skipped.
    pub fn feed_line(&mut self, line: &str) -> Option<Advertisement> {
        let line = line.trim();

        if line.starts_with("systime=") {
            let finished = self.current.take().and_then(PartialPacket::finish);
            self.current = Some(PartialPacket {
                rssi: header_field(line, "rssi").and_then(|v| v.parse().ok()),
                ..PartialPacket::default()
            });
            return finished;
        }

        let packet = self.current.as_mut()?;
        if let Some(rest) = line.strip_prefix("AdvA:") {
            packet.address = rest
                .split_whitespace()
                .next()
                .and_then(|s| MacAddress::parse(s).ok());
        } else if let Some(rest) = line.strip_prefix("AdvData:") {
            packet.payload = parse_hex_bytes(rest);
        } else if line.starts_with("CRC:") {
            return self.current.take().and_then(PartialPacket::finish);
        } else {
            trace!("ubertooth: {}", line);
        }
        None
    }

    /// Flush the packet in progress at end of input.
    pub fn finish(&mut self) -> Option<Advertisement> {
        self.current.take().and_then(PartialPacket::finish)
    }
}

fn header_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.split_whitespace()
        .find_map(|token| token.strip_prefix(key)?.strip_prefix('='))
}

fn parse_hex_bytes(text: &str) -> Vec<u8> {
    text.split_whitespace()
        .map_while(|token| u8::from_str_radix(token, 16).ok())
        .collect()
}

/// Spawns the capture tool and parses its stdout.
pub struct UbertoothSource {
    command: String,
    args: Vec<String>,
}

impl UbertoothSource {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_settings(settings: &SnifferSettings) -> Self {
        Self::new(settings.command.clone(), settings.args.clone())
    }
}

#[async_trait]
impl SniffSource for UbertoothSource {
    fn name(&self) -> &str {
        &self.command
    }

    async fn open(&self) -> Result<SniffStream, AdapterError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => AdapterError::NotFound(self.command.clone()),
                _ => AdapterError::Hardware(format!("{}: {}", self.command, e)),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Hardware("capture output not available".into()))?;
        info!("Started {} {}", self.command, self.args.join(" "));

        let lines = BufReader::new(stdout).lines();
        let stream = stream::unfold(
            (lines, UbertoothParser::new(), Some(child)),
            |(mut lines, mut parser, mut child)| async move {
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if let Some(advertisement) = parser.feed_line(&line) {
                                return Some((advertisement, (lines, parser, child)));
                            }
                        }
                        Ok(None) | Err(_) => {
                            let last = parser.finish();
                            if let Some(mut process) = child.take() {
                                let status = process.wait().await;
                                debug!("Capture process exited: {:?}", status);
                            }
                            return last.map(|adv| (adv, (lines, parser, child)));
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::NameObservation;

    const DUMP: &str = "\
systime=1700000000 freq=2402 addr=8e89bed6 delta_t=0.402 ms rssi=-62
40 11 ef cd ab 19 99 f0 02 01 06 07 09 54 68 65 72 6d 6f 93 2b 8a
Advertising / AA 8e89bed6 (valid)/ 17 bytes
    Channel Index: 37
    Type:  ADV_IND
    AdvA:  f0:99:19:ab:cd:ef (random)
    AdvData: 02 01 06 06 09 54 68 65 72 6d
        Type 01 (Flags)
    CRC:   93 2b 8a
systime=1700000001 freq=2426 addr=af9a9b3c delta_t=1.100 ms rssi=-80
Data / AA af9a9b3c (valid) / 2 bytes
    CRC:   00 00 00
";

    #[test]
    fn parses_advertising_packet() {
        let mut parser = UbertoothParser::new();
        let found: Vec<Advertisement> =
            DUMP.lines().filter_map(|l| parser.feed_line(l)).collect();
        assert_eq!(found.len(), 1);

        let adv = &found[0];
        assert_eq!(adv.address, MacAddress::parse("F0:99:19:AB:CD:EF").unwrap());
        assert_eq!(adv.rssi, Some(-62));
        assert_eq!(adv.name, NameObservation::Present("Therm".into()));
        assert!(parser.finish().is_none());
    }

    #[test]
    fn packet_without_crc_is_flushed_by_next_header() {
        let mut parser = UbertoothParser::new();
        assert!(parser.feed_line("systime=1 rssi=-70").is_none());
        assert!(parser.feed_line("AdvA:  00:11:22:33:44:55 (public)").is_none());
        let adv = parser.feed_line("systime=2 rssi=-71").unwrap();
        assert_eq!(adv.rssi, Some(-70));
        assert!(parser.finish().is_none());
    }

    #[test]
    fn noise_before_first_header_is_ignored() {
        let mut parser = UbertoothParser::new();
        assert!(parser.feed_line("AdvA:  00:11:22:33:44:55 (public)").is_none());
        assert!(parser.feed_line("CRC: 00 00 00").is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let source = UbertoothSource::new("ubertooth-btle-does-not-exist", vec!["-n".into()]);
        assert!(matches!(source.open().await, Err(AdapterError::NotFound(_))));
    }
}
