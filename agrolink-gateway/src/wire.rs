//! The line protocol spoken to the byte-stream peer.
//!
//! Commands arrive one per line, an opcode letter followed by ASCII
//! decimal fields (message payloads in hex). Outbound records mirror the
//! same shape: `L` for live traffic, `O` for replayed history.

use std::{fmt, time::UNIX_EPOCH};

use agrolink::net::Message;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Replace the filter list of an endpoint. No group numbers means
    /// receive everything.
    SetFilters { socket: usize, pgns: Vec<u32> },
    /// Transmit a message from an endpoint.
    Send {
        socket: usize,
        dest: u8,
        pgn: u32,
        data: Vec<u8>,
    },
    /// Replay journal records with keys in `[low, high)`.
    GetPast { low: u32, high: u32 },
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad command: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

fn field<T: std::str::FromStr>(fields: &mut std::str::SplitWhitespace, what: &str) -> Result<T, ParseError> {
    fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError(what.to_owned()))
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        let line = line.trim();
        let mut fields = line.split_whitespace();

        let op = fields.next().ok_or_else(|| ParseError("empty".into()))?;
        match op {
            "F" => {
                let socket = field(&mut fields, "socket")?;
                let count: usize = field(&mut fields, "count")?;

                let mut pgns = Vec::with_capacity(count);
                for _ in 0..count {
                    pgns.push(field(&mut fields, "pgn")?);
                }

                Ok(Command::SetFilters { socket, pgns })
            }
            "W" => {
                let socket = field(&mut fields, "socket")?;
                let dest = field(&mut fields, "dest")?;
                let pgn = field(&mut fields, "pgn")?;
                let len: usize = field(&mut fields, "len")?;

                let mut data = Vec::with_capacity(len);
                for _ in 0..len {
                    let byte = fields
                        .next()
                        .and_then(|s| u8::from_str_radix(s, 16).ok())
                        .ok_or_else(|| ParseError("data".into()))?;
                    data.push(byte);
                }

                Ok(Command::Send {
                    socket,
                    dest,
                    pgn,
                    data,
                })
            }
            "P" => {
                let low = field(&mut fields, "low")?;
                let high = field(&mut fields, "high")?;

                Ok(Command::GetPast { low, high })
            }
            op => Err(ParseError(format!("opcode {:?}", op))),
        }
    }
}

/// One logged message, as carried in the journal and on the wire.
#[derive(Debug, PartialEq, Eq)]
pub struct Record {
    pub iface: usize,
    pub key: u32,
    pub pgn: u32,
    pub daddr: u8,
    pub data: Vec<u8>,
    pub ts_sec: u64,
    pub ts_usec: u32,
    pub saddr: u8,
}

impl Record {
    pub fn from_message(iface: usize, key: u32, message: &Message) -> Self {
        let since_epoch = message
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            iface,
            key,
            pgn: message.pgn,
            daddr: message.daddr,
            data: message.data().to_vec(),
            ts_sec: since_epoch.as_secs(),
            ts_usec: since_epoch.subsec_micros(),
            saddr: message.saddr,
        }
    }

    /// The record fields without opcode or newline; this is what the
    /// journal stores, so a replay only needs a different opcode.
    pub fn fields(&self) -> String {
        let mut hex = String::with_capacity(self.data.len() * 3);
        for byte in &self.data {
            hex.push_str(&format!("{:02x} ", byte));
        }

        format!(
            "{} {} {:06} {:02x} {} {}{}.{:06} {:02x}",
            self.iface,
            self.key,
            self.pgn,
            self.daddr,
            self.data.len(),
            hex,
            self.ts_sec,
            self.ts_usec,
            self.saddr
        )
    }

    pub fn live_line(&self) -> String {
        format!("L {}\n", self.fields())
    }
}

/// A replayed journal record, re-framed under the history opcode.
pub fn old_line(fields: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(fields.len() + 3);
    line.extend_from_slice(b"O ");
    line.extend_from_slice(fields);
    line.push(b'\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_set_filters() {
        assert_eq!(
            Command::parse("F 0 2 61444 65096\n").unwrap(),
            Command::SetFilters {
                socket: 0,
                pgns: vec![61_444, 65_096],
            }
        );
        assert_eq!(
            Command::parse("F 1 0").unwrap(),
            Command::SetFilters {
                socket: 1,
                pgns: vec![],
            }
        );
    }

    #[test]
    fn parse_send() {
        assert_eq!(
            Command::parse("W 0 255 65254 3 aa bb 0c\n").unwrap(),
            Command::Send {
                socket: 0,
                dest: 255,
                pgn: 65_254,
                data: vec![0xAA, 0xBB, 0x0C],
            }
        );
    }

    #[test]
    fn parse_get_past() {
        assert_eq!(
            Command::parse("P 10 20\n").unwrap(),
            Command::GetPast { low: 10, high: 20 }
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("X 1 2").is_err());
        assert!(Command::parse("W 0 255 65254 3 aa").is_err());
        assert!(Command::parse("F 0 two").is_err());
    }

    #[test]
    fn record_round_trip_shape() {
        let record = Record {
            iface: 1,
            key: 42,
            pgn: 61_444,
            daddr: 0xFF,
            data: vec![0x01, 0x02],
            ts_sec: 1_400_000_000,
            ts_usec: 123,
            saddr: 0x80,
        };

        let line = record.live_line();
        assert!(line.starts_with("L 1 42 061444 ff 2 01 02 1400000000.000123 80"));
        assert!(line.ends_with('\n'));

        let old = old_line(record.fields().as_bytes());
        assert!(old.starts_with(b"O 1 42"));
        assert_eq!(*old.last().unwrap(), b'\n');
    }
}
