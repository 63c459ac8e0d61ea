use bytes::BufMut;

/// Length conversions for wire length prefixes.
pub trait UsizeExt {
    /// Length as a one byte prefix, saturating at `u8::MAX`.
    fn to_u8_sat(self) -> u8;
    /// Length as a two byte prefix, saturating at `u16::MAX`.
    fn to_u16_sat(self) -> u16;
    /// Length as a four byte prefix, saturating at `u32::MAX`.
    fn to_u32_sat(self) -> u32;
}

/// Character count in UCS-2 code units.
pub trait StrExt {
    fn ucs2_len(&self) -> usize;
}

/// TDS string operations in [`BufMut`].
pub trait BufMutExt {
    /// Write string as UTF-16LE, without length prefix.
    fn put_ucs2(&mut self, string: &str);

    /// Write string with one byte character count, then UTF-16LE.
    fn put_b_ucs2(&mut self, string: &str);

    /// Write string with two byte character count, then UTF-16LE.
    fn put_us_ucs2(&mut self, string: &str);

    /// Write bytes with one byte length prefix.
    fn put_b_bytes(&mut self, bytes: &[u8]);
}

/// Helper trait to [`Display`][std::fmt::Display] bytes.
pub trait FmtExt {
    /// Hex [`Display`][std::fmt::Display] bytes.
    fn hex(&self) -> HexFmt<'_>;
}

/// Hex [`Display`][std::fmt::Display] implementation for bytes.
pub struct HexFmt<'a>(pub &'a [u8]);

impl UsizeExt for usize {
    fn to_u8_sat(self) -> u8 {
        self.try_into().unwrap_or(u8::MAX)
    }

    fn to_u16_sat(self) -> u16 {
        self.try_into().unwrap_or(u16::MAX)
    }

    fn to_u32_sat(self) -> u32 {
        self.try_into().unwrap_or(u32::MAX)
    }
}

impl StrExt for str {
    fn ucs2_len(&self) -> usize {
        self.encode_utf16().count()
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_ucs2(&mut self, string: &str) {
        for unit in string.encode_utf16() {
            self.put_u16_le(unit);
        }
    }

    fn put_b_ucs2(&mut self, string: &str) {
        let len = string.ucs2_len().to_u8_sat();
        self.put_u8(len);
        for unit in string.encode_utf16().take(len as usize) {
            self.put_u16_le(unit);
        }
    }

    fn put_us_ucs2(&mut self, string: &str) {
        let len = string.ucs2_len().to_u16_sat();
        self.put_u16_le(len);
        for unit in string.encode_utf16().take(len as usize) {
            self.put_u16_le(unit);
        }
    }

    fn put_b_bytes(&mut self, bytes: &[u8]) {
        let len = bytes.len().to_u8_sat();
        self.put_u8(len);
        self.put_slice(&bytes[..len as usize]);
    }
}

impl FmtExt for [u8] {
    fn hex(&self) -> HexFmt<'_> {
        HexFmt(self)
    }
}

impl std::fmt::Display for HexFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HexFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{self}]")
    }
}
