/*! XOR stream cipher used by some vendor flash containers.

Symmetric: encrypting twice with the same key is the identity.
*/
use crate::{Error, Result};

/// A repeating-key XOR cipher.
#[derive(Debug, Clone)]
pub struct XorCipher {
    key: Vec<u8>,
}

impl XorCipher {
    /// Create a cipher; the key must not be empty.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::invalid("XOR cipher requires a non-empty key"));
        }
        Ok(Self { key: key.to_vec() })
    }

    /// Encrypt a buffer.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, &b)| self.key[i % self.key.len()] ^ b)
            .collect()
    }

    /// Decrypt a buffer (same as [`XorCipher::encrypt`]).
    pub fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        self.encrypt(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric() -> crate::Result<()> {
        let cipher = XorCipher::new(b"secret")?;
        let data: Vec<u8> = (0..100).collect();
        let encrypted = cipher.encrypt(&data);
        assert_ne!(encrypted, data);
        assert_eq!(cipher.decrypt(&encrypted), data);
        Ok(())
    }

    #[test]
    fn empty_key_rejected() {
        assert!(XorCipher::new(b"").is_err());
    }
}
