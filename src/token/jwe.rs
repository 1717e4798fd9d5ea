//! Compact JWE serialization for the single algorithm pair the gateway speaks.
//!
//! ```text
//! BASE64URL(header) . BASE64URL(encrypted CEK) . BASE64URL(IV) . BASE64URL(ciphertext) . BASE64URL(tag)
//! ```
//!
//! The CEK is a fresh 256-bit AES key wrapped with RSA-OAEP using SHA-512
//! (`RSA-OAEP-512`). Content is sealed with AES-256-GCM (`A256GCM`), a 96-bit
//! IV and a 128-bit tag, with the encoded protected header as AAD.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use aws_lc_rs::rsa::{OAEP_SHA512_MGF1SHA512, OaepPrivateDecryptingKey, OaepPublicEncryptingKey};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use super::TokenError;

/// Key management algorithm (`alg`).
pub const KEY_ALGORITHM: &str = "RSA-OAEP-512";
/// Content encryption algorithm (`enc`).
pub const CONTENT_ENCRYPTION: &str = "A256GCM";

const CEK_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// JOSE protected header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JweHeader {
    /// Key management algorithm
    pub alg: String,
    /// Content encryption algorithm
    pub enc: String,
    /// Media type of the complete token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Compression applied before encryption (unsupported)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

impl Default for JweHeader {
    fn default() -> Self {
        Self {
            alg: KEY_ALGORITHM.to_string(),
            enc: CONTENT_ENCRYPTION.to_string(),
            typ: None,
            zip: None,
        }
    }
}

/// A parsed (or freshly sealed) compact JWE.
#[derive(Debug, Clone)]
pub struct CompactJwe {
    protected: String,
    header: JweHeader,
    encrypted_key: Vec<u8>,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

impl CompactJwe {
    /// Seal `plaintext` for the holder of the private half of `recipient`.
    pub fn encrypt(
        plaintext: &[u8],
        recipient: &OaepPublicEncryptingKey,
    ) -> Result<Self, TokenError> {
        let header = JweHeader::default();
        let header_json =
            serde_json::to_vec(&header).map_err(|e| TokenError::Encryption(e.to_string()))?;
        let protected = URL_SAFE_NO_PAD.encode(header_json);

        let cek = Aes256Gcm::generate_key(OsRng);
        let mut wrapped = vec![0u8; recipient.ciphertext_size()];
        let encrypted_key = recipient
            .encrypt(&OAEP_SHA512_MGF1SHA512, cek.as_slice(), &mut wrapped, None)
            .map_err(|e| TokenError::Encryption(format!("key wrap: {e}")))?
            .to_vec();

        let cipher = Aes256Gcm::new(&cek);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: protected.as_bytes(),
                },
            )
            .map_err(|_| TokenError::Encryption("content encryption".to_string()))?;
        let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        Ok(Self {
            protected,
            header,
            encrypted_key,
            iv: nonce.to_vec(),
            ciphertext,
            tag,
        })
    }

    /// Parse the five-part compact form. Performs no cryptography.
    pub fn parse(compact: &str) -> Result<Self, TokenError> {
        let parts: Vec<&str> = compact.trim().split('.').collect();
        let [protected, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
            return Err(TokenError::Malformed(format!(
                "expected 5 dot-separated parts, found {}",
                parts.len()
            )));
        };

        let header_json = decode_part(protected, "header")?;
        let header: JweHeader = serde_json::from_slice(&header_json)
            .map_err(|e| TokenError::Malformed(format!("header is not a JOSE header: {e}")))?;
        if header.alg != KEY_ALGORITHM || header.enc != CONTENT_ENCRYPTION {
            return Err(TokenError::Malformed(format!(
                "unsupported algorithms alg={} enc={}",
                header.alg, header.enc
            )));
        }
        if header.zip.is_some() {
            return Err(TokenError::Malformed("compressed payloads are not supported".to_string()));
        }

        let encrypted_key = decode_part(encrypted_key, "encrypted key")?;
        if encrypted_key.is_empty() {
            return Err(TokenError::Malformed("encrypted key is empty".to_string()));
        }
        let iv = decode_part(iv, "iv")?;
        if iv.len() != IV_LEN {
            return Err(TokenError::Malformed(format!("iv must be {IV_LEN} bytes, got {}", iv.len())));
        }
        let ciphertext = decode_part(ciphertext, "ciphertext")?;
        let tag = decode_part(tag, "tag")?;
        if tag.len() != TAG_LEN {
            return Err(TokenError::Malformed(format!(
                "tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }

        Ok(Self {
            protected: (*protected).to_string(),
            header,
            encrypted_key,
            iv,
            ciphertext,
            tag,
        })
    }

    /// Unwrap the CEK and open the content.
    ///
    /// Every failure here (wrong key, tampered key, IV, ciphertext, tag or
    /// header) surfaces as [`TokenError::DecryptionFailed`].
    pub fn decrypt(&self, key: &OaepPrivateDecryptingKey) -> Result<Vec<u8>, TokenError> {
        let mut unwrapped = vec![0u8; key.min_output_size()];
        let cek = key
            .decrypt(&OAEP_SHA512_MGF1SHA512, &self.encrypted_key, &mut unwrapped, None)
            .map_err(|_| TokenError::DecryptionFailed("key unwrap failed".to_string()))?;
        if cek.len() != CEK_LEN {
            return Err(TokenError::DecryptionFailed(format!(
                "unwrapped key has {} bytes",
                cek.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(cek)
            .map_err(|e| TokenError::DecryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(self.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.tag);

        cipher
            .decrypt(
                Nonce::from_slice(&self.iv),
                Payload {
                    msg: &sealed,
                    aad: self.protected.as_bytes(),
                },
            )
            .map_err(|_| TokenError::DecryptionFailed("content authentication failed".to_string()))
    }

    /// Compact serialization.
    #[must_use]
    pub fn serialize(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.protected,
            URL_SAFE_NO_PAD.encode(&self.encrypted_key),
            URL_SAFE_NO_PAD.encode(&self.iv),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
            URL_SAFE_NO_PAD.encode(&self.tag),
        )
    }

    /// Decoded protected header.
    #[must_use]
    pub fn header(&self) -> &JweHeader {
        &self.header
    }
}

fn decode_part(part: &str, name: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| TokenError::Malformed(format!("{name} is not base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::test_keys;

    fn seal(plaintext: &[u8]) -> CompactJwe {
        let keys = test_keys::primary();
        CompactJwe::encrypt(plaintext, keys.public_key().unwrap()).unwrap()
    }

    fn swap_part(compact: &str, index: usize, replacement: &str) -> String {
        let mut parts: Vec<&str> = compact.split('.').collect();
        parts[index] = replacement;
        parts.join(".")
    }

    #[test]
    fn compact_form_has_five_parts_and_fixed_header() {
        let compact = seal(b"{}").serialize();

        assert_eq!(compact.split('.').count(), 5);
        let parsed = CompactJwe::parse(&compact).unwrap();
        assert_eq!(parsed.header().alg, "RSA-OAEP-512");
        assert_eq!(parsed.header().enc, "A256GCM");
        assert!(!compact.contains('='));
    }

    #[test]
    fn sealed_content_opens_with_matching_key() {
        let compact = seal(b"hello gateway").serialize();
        let keys = test_keys::primary();

        let opened = CompactJwe::parse(&compact)
            .unwrap()
            .decrypt(keys.private_key().unwrap())
            .unwrap();

        assert_eq!(opened, b"hello gateway");
    }

    #[test]
    fn every_seal_uses_fresh_key_and_iv() {
        let a = seal(b"same").serialize();
        let b = seal(b"same").serialize();
        let a: Vec<&str> = a.split('.').collect();
        let b: Vec<&str> = b.split('.').collect();
        assert_ne!(a[1], b[1]);
        assert_ne!(a[2], b[2]);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let compact = seal(b"secret").serialize();
        let other = test_keys::secondary();

        let err = CompactJwe::parse(&compact)
            .unwrap()
            .decrypt(other.private_key().unwrap())
            .unwrap_err();

        assert!(matches!(err, TokenError::DecryptionFailed(_)));
    }

    #[test]
    fn tampered_parts_fail_decryption_not_parsing() {
        let compact = seal(b"{\"sub\":\"user-123\"}").serialize();
        let keys = test_keys::primary();
        let private = keys.private_key().unwrap();

        // Replace the tag with a different, well-formed tag.
        let forged_tag = URL_SAFE_NO_PAD.encode([0u8; TAG_LEN]);
        let forged = swap_part(&compact, 4, &forged_tag);
        let err = CompactJwe::parse(&forged).unwrap().decrypt(private).unwrap_err();
        assert!(matches!(err, TokenError::DecryptionFailed(_)));

        // Flip a ciphertext byte.
        let parts: Vec<&str> = compact.split('.').collect();
        let mut ciphertext = URL_SAFE_NO_PAD.decode(parts[3]).unwrap();
        ciphertext[0] ^= 0x01;
        let forged = swap_part(&compact, 3, &URL_SAFE_NO_PAD.encode(ciphertext));
        let err = CompactJwe::parse(&forged).unwrap().decrypt(private).unwrap_err();
        assert!(matches!(err, TokenError::DecryptionFailed(_)));

        // A different, still supported, header changes the AAD.
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RSA-OAEP-512","enc":"A256GCM","typ":"JWT"}"#);
        let forged = swap_part(&compact, 0, &header);
        let err = CompactJwe::parse(&forged).unwrap().decrypt(private).unwrap_err();
        assert!(matches!(err, TokenError::DecryptionFailed(_)));
    }

    #[test]
    fn structural_problems_are_malformed() {
        let compact = seal(b"x").serialize();

        for bad in [
            String::new(),
            "a.b.c".to_string(),
            format!("{compact}.extra"),
            swap_part(&compact, 0, "!!!"),
            swap_part(&compact, 0, &URL_SAFE_NO_PAD.encode(b"not json")),
            swap_part(&compact, 1, ""),
            swap_part(&compact, 2, &URL_SAFE_NO_PAD.encode([0u8; 8])),
            swap_part(&compact, 4, &URL_SAFE_NO_PAD.encode([0u8; 4])),
        ] {
            let err = CompactJwe::parse(&bad).unwrap_err();
            assert!(matches!(err, TokenError::Malformed(_)), "{bad:?} gave {err:?}");
        }
    }

    #[test]
    fn other_algorithms_are_refused() {
        let compact = seal(b"x").serialize();

        for header in [
            br#"{"alg":"RSA-OAEP-256","enc":"A256GCM"}"#.as_slice(),
            br#"{"alg":"RSA-OAEP-512","enc":"A128GCM"}"#.as_slice(),
            br#"{"alg":"dir","enc":"A256GCM"}"#.as_slice(),
            br#"{"alg":"RSA-OAEP-512","enc":"A256GCM","zip":"DEF"}"#.as_slice(),
        ] {
            let forged = swap_part(&compact, 0, &URL_SAFE_NO_PAD.encode(header));
            let err = CompactJwe::parse(&forged).unwrap_err();
            assert!(matches!(err, TokenError::Malformed(_)));
        }
    }
}
