//! The framed packet protocol between the engine and the elevated helper.
//!
//! A packet is `[size: i32 le] [command bytes] [0x00] [payload bytes]`
//! where `size` counts everything after itself. Reading is resumable:
//! [`recv_packet`] is a pure function over a byte buffer that consumes
//! nothing until a whole packet is available, so a caller can feed it a
//! growing buffer from any stream without bookkeeping.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::errors::InstallError;
use crate::utils::wire::{Reader, Writer};

pub const CMD_EXECUTE_OPERATION: &str = "execute-operation";
pub const CMD_COPY_FILE: &str = "copy-file";
pub const CMD_RENAME: &str = "rename";
pub const CMD_DELETE: &str = "delete";
pub const CMD_WRITE_SETTINGS_FILE: &str = "write-settings-file";
pub const CMD_SHUTDOWN: &str = "shutdown";

/// Reply commands.
pub const CMD_OK: &str = "ok";
pub const CMD_ERROR: &str = "error";

/// Largest packet either side will accept. Keeps a corrupted size field
/// from looking like a multi-gigabyte read.
pub const MAX_PACKET_SIZE: i32 = 64 * 1024 * 1024;

/// A parsed packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub command: String,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    pub fn ok(payload: Vec<u8>) -> Self {
        Self::new(CMD_OK, payload)
    }

    pub fn error(message: &str) -> Self {
        Self::new(CMD_ERROR, message.as_bytes().to_vec())
    }
}

/// Serialize a packet. Both sides must use the same endianness for the
/// size field; this implementation pins little-endian.
pub fn send_packet(command: &str, payload: &[u8]) -> Vec<u8> {
    let size = command.len() + 1 + payload.len();
    let mut w = Writer::new();
    w.put_i32(size as i32);
    w.put_raw(command.as_bytes());
    w.put_raw(&[0]);
    w.put_raw(payload);
    w.into_bytes()
}

/// Try to parse one packet from the front of `buffer`.
///
/// Returns `(None, 0)` while the buffer holds less than a full packet --
/// nothing is consumed, the caller just reads more bytes and retries.
/// Otherwise returns the packet and the number of bytes it occupied.
pub fn recv_packet(buffer: &[u8]) -> Result<(Option<Packet>, usize)> {
    if buffer.len() < 4 {
        return Ok((None, 0));
    }
    let size = i32::from_le_bytes(buffer[..4].try_into().unwrap());
    if size < 1 || size > MAX_PACKET_SIZE {
        return Err(InstallError::Protocol(format!("invalid packet size {size}")).into());
    }
    let size = size as usize;
    if buffer.len() < 4 + size {
        return Ok((None, 0));
    }
    let body = &buffer[4..4 + size];
    let separator = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| InstallError::Protocol("packet without command separator".into()))?;
    let command = String::from_utf8(body[..separator].to_vec())
        .map_err(|_| InstallError::Protocol("command is not valid utf-8".into()))?;
    let payload = body[separator + 1..].to_vec();
    Ok((Some(Packet { command, payload }), 4 + size))
}

/// Payload helper: a list of strings, used by the file commands.
pub fn encode_strings(strings: &[String]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32(strings.len() as u32);
    for s in strings {
        w.put_str(s);
    }
    w.into_bytes()
}

pub fn decode_strings(payload: &[u8]) -> Result<Vec<String>> {
    let mut r = Reader::new(payload);
    let count = r.get_u32()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(r.get_string()?);
    }
    Ok(out)
}

/// Payload helper for `execute-operation`: kind, positional arguments and
/// the attribute bag.
pub fn encode_operation(
    kind: &str,
    args: &[String],
    attrs: &BTreeMap<String, String>,
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_str(kind);
    w.put_u32(args.len() as u32);
    for arg in args {
        w.put_str(arg);
    }
    w.put_u32(attrs.len() as u32);
    for (k, v) in attrs {
        w.put_str(k);
        w.put_str(v);
    }
    w.into_bytes()
}

pub fn decode_operation(payload: &[u8]) -> Result<(String, Vec<String>, BTreeMap<String, String>)> {
    let mut r = Reader::new(payload);
    let kind = r.get_string()?;
    let argc = r.get_u32()?;
    let mut args = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        args.push(r.get_string()?);
    }
    let attrc = r.get_u32()?;
    let mut attrs = BTreeMap::new();
    for _ in 0..attrc {
        let k = r.get_string()?;
        let v = r.get_string()?;
        attrs.insert(k, v);
    }
    Ok((kind, args, attrs))
}
