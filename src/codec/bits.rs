use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitError {
    #[error("bitstream ended early")]
    Eof,
    #[error("exp-golomb code longer than 32 bits")]
    GolombOverflow,
    #[error("{field} = {value} is out of range")]
    OutOfRange { field: &'static str, value: u32 },
}

/// Strips emulation-prevention bytes (`00 00 03` → `00 00`).
pub fn unescape_rbsp(nalu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalu.len());
    let mut zeros = 0usize;
    for &b in nalu {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// MSB-first bit reader with Exp-Golomb support.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_bit(&mut self) -> Result<bool, BitError> {
        let byte = *self.data.get(self.pos / 8).ok_or(BitError::Eof)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    pub fn read_bits(&mut self, n: u32) -> Result<u32, BitError> {
        debug_assert!(n <= 32);
        let mut v: u32 = 0;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()? as u32;
        }
        Ok(v)
    }

    pub fn skip_bits(&mut self, n: usize) -> Result<(), BitError> {
        if self.pos + n > self.data.len() * 8 {
            return Err(BitError::Eof);
        }
        self.pos += n;
        Ok(())
    }

    /// `ue(v)`
    pub fn read_ue(&mut self) -> Result<u32, BitError> {
        let mut leading = 0u32;
        while !self.read_bit()? {
            leading += 1;
            if leading > 31 {
                return Err(BitError::GolombOverflow);
            }
        }
        if leading == 0 {
            return Ok(0);
        }
        let rest = self.read_bits(leading)?;
        Ok(((1u64 << leading) - 1 + rest as u64) as u32)
    }

    /// `se(v)`
    pub fn read_se(&mut self) -> Result<i32, BitError> {
        let k = self.read_ue()? as i64;
        let v = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Ok(v as i32)
    }
}
