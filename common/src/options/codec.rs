//! Binary format codecs
//!
//! Only `wmo2ascii` is built in; the image and GRIB codecs are provided by whoever embeds the
//! pipeline through [`CodecRegistry::register`].

use serde::{Deserialize, Serialize};

use super::convert::{ETX, SOH};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, enum_map::Enum, Serialize, Deserialize)]
pub enum CodecKind {
    Tiff2Gts,
    Fax2Gts,
    Gts2Tiff,
    Grib2Wmo,
    Wmo2Ascii,
}

impl CodecKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "tiff2gts" => Self::Tiff2Gts,
            "fax2gts" => Self::Fax2Gts,
            "gts2tiff" => Self::Gts2Tiff,
            "grib2wmo" => Self::Grib2Wmo,
            "wmo2ascii" => Self::Wmo2Ascii,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tiff2Gts => "tiff2gts",
            Self::Fax2Gts => "fax2gts",
            Self::Gts2Tiff => "gts2tiff",
            Self::Grib2Wmo => "grib2wmo",
            Self::Wmo2Ascii => "wmo2ascii",
        }
    }
}

/// Rewrites the content of one file; an error drops the file from the batch.
pub trait FormatCodec: Send + Sync {
    fn convert(&self, file_name: &str, data: &[u8]) -> anyhow::Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct CodecRegistry {
    codecs: enum_map::EnumMap<CodecKind, Option<std::sync::Arc<dyn FormatCodec>>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let available: Vec<_> = self
            .codecs
            .iter()
            .filter(|(_, codec)| codec.is_some())
            .map(|(kind, _)| kind.name())
            .collect();
        f.debug_struct("CodecRegistry")
            .field("available", &available)
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            codecs: enum_map::EnumMap::default(),
        };
        registry.register(CodecKind::Wmo2Ascii, std::sync::Arc::new(Wmo2Ascii));
        registry
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: enum_map::EnumMap::default(),
        }
    }

    pub fn register(&mut self, kind: CodecKind, codec: std::sync::Arc<dyn FormatCodec>) {
        self.codecs[kind] = Some(codec);
    }

    pub fn get(&self, kind: CodecKind) -> Option<&std::sync::Arc<dyn FormatCodec>> {
        self.codecs[kind].as_ref()
    }
}

/// Strips WMO socket headers and SOH/ETX framing and normalizes line ends to LF.
#[derive(Debug, Default, Clone, Copy)]
pub struct Wmo2Ascii;

fn strip_framing(bulletin: &[u8]) -> &[u8] {
    let mut body = bulletin;
    if body.first() == Some(&SOH) {
        body = &body[1..];
    }
    if body.last() == Some(&ETX) {
        body = &body[..body.len() - 1];
    }
    body
}

fn normalize_line_ends(data: &[u8], out: &mut Vec<u8>) {
    let mut idx = 0;
    while idx < data.len() {
        if data[idx] == b'\r' {
            let mut end = idx;
            while data.get(end) == Some(&b'\r') {
                end += 1;
            }
            if data.get(end) == Some(&b'\n') {
                idx = end;
                continue;
            }
        }
        out.push(data[idx]);
        idx += 1;
    }
}

impl FormatCodec for Wmo2Ascii {
    fn convert(&self, file_name: &str, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let is_framed = |rest: &[u8]| {
            rest.len() >= 10
                && rest[..8].iter().all(u8::is_ascii_digit)
                && rest[8..10].iter().all(u8::is_ascii_alphabetic)
        };
        let mut out = Vec::with_capacity(data.len());
        if !is_framed(data) {
            normalize_line_ends(strip_framing(data), &mut out);
            return Ok(out);
        }
        let mut rest = data;
        while !rest.is_empty() {
            if !is_framed(rest) {
                anyhow::bail!("{}: garbage after the last WMO bulletin", file_name);
            }
            let length: usize = std::str::from_utf8(&rest[..8])?.parse()?;
            let Some(bulletin) = rest.get(10..10 + length) else {
                anyhow::bail!(
                    "{}: WMO header announces {} bytes, only {} left",
                    file_name,
                    length,
                    rest.len() - 10
                );
            };
            normalize_line_ends(strip_framing(bulletin), &mut out);
            rest = &rest[10 + length..];
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wmo2ascii_strips_headers() {
        let codec = Wmo2Ascii;
        let bulletin = b"\x01\r\r\nSMAA01 EDZW 010000\r\r\nAAXX\r\r\n\x03";
        let mut framed = format!("{:08}AN", bulletin.len()).into_bytes();
        framed.extend_from_slice(bulletin);
        framed.extend_from_slice(&framed.clone());
        let out = codec.convert("f", &framed).unwrap();
        assert_eq!(out, b"\nSMAA01 EDZW 010000\nAAXX\n\nSMAA01 EDZW 010000\nAAXX\n");
        assert!(codec.convert("f", b"00000099BIshort").is_err());
        assert_eq!(codec.convert("f", b"plain\r\ntext").unwrap(), b"plain\ntext");
    }

    #[test]
    fn registry_knows_builtin_only() {
        let registry = CodecRegistry::default();
        assert!(registry.get(CodecKind::Wmo2Ascii).is_some());
        assert!(registry.get(CodecKind::Tiff2Gts).is_none());
        assert!(CodecRegistry::empty().get(CodecKind::Wmo2Ascii).is_none());
        assert_eq!(CodecKind::from_name("grib2wmo"), Some(CodecKind::Grib2Wmo));
    }
}
