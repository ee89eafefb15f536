//! Minimal DNS client for `@rbl`.
//!
//! Only what a blocklist lookup needs: one question, `A` and `TXT` types,
//! UDP, no recursion of our own and a hard read timeout.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Record types we query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordType {
    A = 1,
    Txt = 16,
}

/// Lookup timeout.
pub(crate) const TIMEOUT: Duration = Duration::from_millis(500);

/// Nameserver from `/etc/resolv.conf`, if any.
pub(crate) fn system_nameserver() -> Option<SocketAddr> {
    let conf = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    conf.lines()
        .filter_map(|l| l.trim().strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<std::net::IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, 53))
        .next()
}

fn encode_query(id: u16, name: &str, qtype: RecordType) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(name.len() + 18);
    out.extend_from_slice(&id.to_be_bytes());
    // RD set, one question.
    out.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad DNS label"));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&(qtype as u16).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    Ok(out)
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "truncated DNS message")
}

/// Skip a (possibly compressed) name starting at `pos`.
fn skip_name(msg: &[u8], mut pos: usize) -> io::Result<usize> {
    loop {
        let len = *msg.get(pos).ok_or_else(truncated)?;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => return Ok(pos + 2),
            l => pos += 1 + l as usize,
        }
    }
}

fn read_u16(msg: &[u8], pos: usize) -> io::Result<u16> {
    msg.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(truncated)
}

/// Answer records of the requested type, as raw rdata.
fn decode_answers(msg: &[u8], id: u16, qtype: RecordType) -> io::Result<Vec<Vec<u8>>> {
    if read_u16(msg, 0)? != id {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "DNS id mismatch"));
    }
    let rcode = msg.get(3).ok_or_else(truncated)? & 0x0F;
    // NXDOMAIN and friends mean "not listed".
    if rcode != 0 {
        return Ok(Vec::new());
    }
    let questions = read_u16(msg, 4)?;
    let answers = read_u16(msg, 6)?;
    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(msg, pos)? + 4;
    }
    let mut out = Vec::new();
    for _ in 0..answers {
        pos = skip_name(msg, pos)?;
        let rtype = read_u16(msg, pos)?;
        let rdlen = read_u16(msg, pos + 8)? as usize;
        let start = pos + 10;
        let rdata = msg.get(start..start + rdlen).ok_or_else(truncated)?;
        if rtype == qtype as u16 {
            out.push(rdata.to_vec());
        }
        pos = start + rdlen;
    }
    Ok(out)
}

/// Send one query and wait up to [`TIMEOUT`] for the answer.
pub(crate) fn query(server: SocketAddr, name: &str, qtype: RecordType) -> io::Result<Vec<Vec<u8>>> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    socket.set_read_timeout(Some(TIMEOUT))?;
    socket.connect(server)?;
    let id: u16 = rand::random();
    socket.send(&encode_query(id, name, qtype)?)?;
    let mut buf = [0u8; 1500];
    let n = socket.recv(&mut buf)?;
    decode_answers(&buf[..n], id, qtype)
}

/// Concatenate the character-strings of a TXT rdata.
pub(crate) fn txt_to_string(rdata: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while let Some(&len) = rdata.get(pos) {
        let end = (pos + 1 + len as usize).min(rdata.len());
        out.push_str(&String::from_utf8_lossy(&rdata[pos + 1..end]));
        pos = end;
    }
    out
}
