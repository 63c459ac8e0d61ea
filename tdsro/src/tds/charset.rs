//! Single byte character sets.
use std::fmt;

use encoding_rs::{
    BIG5, EUC_KR, EncoderResult, Encoding, GBK, SHIFT_JIS, UTF_8, WINDOWS_874, WINDOWS_1250,
    WINDOWS_1251, WINDOWS_1252, WINDOWS_1253, WINDOWS_1254, WINDOWS_1255, WINDOWS_1256,
    WINDOWS_1257, WINDOWS_1258,
};

/// Character set negotiated with the server, used for non-UCS-2 strings.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    name: &'static str,
    encoding: &'static Encoding,
}

impl Charset {
    /// Resolve server charset name, unknown names fall back to windows-1252.
    pub fn from_server_name(name: &str) -> Charset {
        let lower = name.trim().to_ascii_lowercase();
        let encoding = match lower.as_str() {
            "iso_1" | "iso8859_1" | "iso88591" | "cp1252" => WINDOWS_1252,
            "utf8" | "utf-8" => UTF_8,
            "cp936" | "gb2312" => GBK,
            other => Encoding::for_label(other.as_bytes()).unwrap_or(WINDOWS_1252),
        };
        Charset { name: encoding.name(), encoding }
    }

    /// Resolve the code page of a 5 byte collation by its locale id.
    pub fn from_collation(collation: &[u8; 5]) -> Charset {
        let lcid = u32::from_le_bytes([collation[0], collation[1], collation[2] & 0x0F, 0]);
        let encoding = match lcid & 0xFFFF {
            0x0411 => SHIFT_JIS,
            0x0804 | 0x1004 => GBK,
            0x0412 => EUC_KR,
            0x0404 | 0x0C04 | 0x1404 => BIG5,
            0x041E => WINDOWS_874,
            0x0405 | 0x040E | 0x0415 | 0x0418 | 0x041A | 0x041B | 0x0424 => WINDOWS_1250,
            0x0402 | 0x0419 | 0x0422 | 0x0423 | 0x042F | 0x0C1A => WINDOWS_1251,
            0x0408 => WINDOWS_1253,
            0x041F | 0x042C | 0x0443 => WINDOWS_1254,
            0x040D => WINDOWS_1255,
            0x0401 | 0x0420 | 0x0429 => WINDOWS_1256,
            0x0425 | 0x0426 | 0x0427 => WINDOWS_1257,
            0x042A => WINDOWS_1258,
            _ => WINDOWS_1252,
        };
        Charset { name: encoding.name(), encoding }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        let (text, _) = self.encoding.decode_without_bom_handling(bytes);
        text.into_owned()
    }

    /// Encode string, unmappable characters become `?`.
    pub fn encode(&self, string: &str) -> Vec<u8> {
        if self.encoding == UTF_8 {
            return string.as_bytes().to_vec();
        }

        let mut encoder = self.encoding.new_encoder();
        let mut out = Vec::with_capacity(string.len());
        let mut src = string;

        loop {
            let needed = encoder
                .max_buffer_length_from_utf8_without_replacement(src.len())
                .unwrap_or(src.len() * 4);
            out.reserve(needed);

            let (result, read) = encoder.encode_from_utf8_to_vec_without_replacement(src, &mut out, true);
            src = &src[read..];

            match result {
                EncoderResult::InputEmpty => return out,
                EncoderResult::Unmappable(_) => out.push(b'?'),
                EncoderResult::OutputFull => {},
            }
        }
    }
}

impl Default for Charset {
    fn default() -> Self {
        Charset { name: WINDOWS_1252.name(), encoding: WINDOWS_1252 }
    }
}

impl fmt::Debug for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Charset").field(&self.name).finish()
    }
}

/// Decode UTF-16LE, unpaired surrogates become U+FFFD.
pub fn decode_ucs2(bytes: &[u8]) -> String {
    let units = bytes.chunks_exact(2).map(|e| u16::from_le_bytes([e[0], e[1]]));
    char::decode_utf16(units)
        .map(|e| e.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
