use std::io::Read;

/// Length of the rolling key embedded in obfuscated TOC/catalog headers.
pub const KEY_LEN: usize = 257;

/// Every key byte is additionally salted with this constant.
pub const KEY_SALT: u8 = 0x7B;

/// Applies the rolling XOR key to an obfuscated byte stream.
pub struct XorRead<R> {
    inner: R,
    key: [u8; KEY_LEN],
    index: usize,
}

impl<R: Read> XorRead<R> {
    pub fn new(reader: R, key: [u8; KEY_LEN]) -> Self {
        Self {
            inner: reader,
            key,
            index: 0,
        }
    }
}

impl<R: Read> Read for XorRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read_amt = self.inner.read(buf)?;
        for b in &mut buf[..read_amt] {
            *b ^= self.key[self.index % KEY_LEN] ^ KEY_SALT;
            self.index += 1;
        }
        Ok(read_amt)
    }
}

#[cfg(test)]
mod xor_tests {
    use std::io::Read;

    use super::{XorRead, KEY_LEN, KEY_SALT};

    #[test]
    fn key_rolls_over_its_full_length() {
        let mut key = [0u8; KEY_LEN];
        for (i, k) in key.iter_mut().enumerate() {
            *k = (i % 251) as u8;
        }
        let clear: Vec<u8> = (0..KEY_LEN * 2 + 3).map(|i| (i % 199) as u8).collect();
        let obfuscated: Vec<u8> = clear
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % KEY_LEN] ^ KEY_SALT)
            .collect();

        let mut decoded = Vec::new();
        XorRead::new(obfuscated.as_slice(), key)
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, clear);
    }
}
