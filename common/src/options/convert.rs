//! In-place reformatting of bulletin files

use serde::{Deserialize, Serialize};

pub(crate) const SOH: u8 = 0x01;
pub(crate) const ETX: u8 = 0x03;
const CTRL_Z: u8 = 0x1a;
pub(crate) const SOH_HEADER: &[u8] = b"\x01\r\r\n";
pub(crate) const ETX_TRAILER: &[u8] = b"\r\r\n\x03";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvertKind {
    /// wrap in SOH/ETX
    SohEtx,
    /// prefix the WMO socket header
    Wmo,
    SohEtxWmo,
    Dos2Unix,
    Unix2Dos,
    Lf2Crlf,
    Crlf2Lf,
}

impl ConvertKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "sohetx" => Self::SohEtx,
            "wmo" => Self::Wmo,
            "sohetxwmo" => Self::SohEtxWmo,
            "dos2unix" => Self::Dos2Unix,
            "unix2dos" => Self::Unix2Dos,
            "lf2crlf" => Self::Lf2Crlf,
            "crlf2lf" => Self::Crlf2Lf,
            _ => return None,
        };
        Some(kind)
    }
}

/// Wraps `data` in SOH/ETX unless it already starts with SOH.
pub fn soh_etx(data: &[u8]) -> Vec<u8> {
    if data.first() == Some(&SOH) {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() + SOH_HEADER.len() + ETX_TRAILER.len());
    out.extend_from_slice(SOH_HEADER);
    out.extend_from_slice(data);
    out.extend_from_slice(ETX_TRAILER);
    out
}

/// Eight digit length, then the two character format identifier.
pub fn wmo_header(length: usize, format: &[u8; 2]) -> Vec<u8> {
    let mut header = format!("{:08}", length).into_bytes();
    header.extend_from_slice(format);
    header
}

fn with_wmo_header(data: &[u8]) -> Vec<u8> {
    let mut out = wmo_header(data.len(), b"BI");
    out.extend_from_slice(data);
    out
}

fn crlf_to_lf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut idx = 0;
    while idx < data.len() {
        if data[idx] == b'\r' && data.get(idx + 1) == Some(&b'\n') {
            idx += 1;
            continue;
        }
        out.push(data[idx]);
        idx += 1;
    }
    out
}

fn lf_to_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for (idx, byte) in data.iter().enumerate() {
        if *byte == b'\n' && (idx == 0 || data[idx - 1] != b'\r') {
            out.push(b'\r');
        }
        out.push(*byte);
    }
    out
}

pub fn convert(kind: ConvertKind, data: &[u8]) -> Vec<u8> {
    match kind {
        ConvertKind::SohEtx => soh_etx(data),
        ConvertKind::Wmo => with_wmo_header(data),
        ConvertKind::SohEtxWmo => with_wmo_header(&soh_etx(data)),
        ConvertKind::Dos2Unix => {
            let mut out = crlf_to_lf(data);
            if out.last() == Some(&CTRL_Z) {
                out.pop();
            }
            out
        }
        ConvertKind::Crlf2Lf => crlf_to_lf(data),
        ConvertKind::Unix2Dos | ConvertKind::Lf2Crlf => lf_to_crlf(data),
    }
}
