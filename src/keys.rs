//! RSA key material for token confidentiality.
//!
//! Keys are supplied the way the issuing services export them: base64 of the
//! DER encoding, PKCS#8 for the private half and X.509 `SubjectPublicKeyInfo`
//! for the public half. PEM armour is accepted as well. Whitespace inside the
//! base64 body is ignored so keys can be folded in YAML.
//!
//! Either half may be omitted. A gateway that only validates needs the private
//! key (the public key is then derived from it); an issuer that never decrypts
//! needs only the public key.
//!
//! RSA operations run on `aws-lc-rs`, whose OAEP decryption is constant time.

use std::fmt;

use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::rsa::{
    KeySize, OaepPrivateDecryptingKey, OaepPublicEncryptingKey, PrivateDecryptingKey,
    PublicEncryptingKey,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::info;

use crate::config::JwtConfig;
use crate::{Error, Result};

/// Smallest modulus accepted for RSA-OAEP-512.
pub const MIN_KEY_BITS: usize = 2048;

/// Process-wide key pair, loaded once at startup and shared read-only.
pub struct KeyMaterial {
    private: Option<OaepPrivateDecryptingKey>,
    public: Option<OaepPublicEncryptingKey>,
    private_der: Option<Vec<u8>>,
    public_der: Option<Vec<u8>>,
    bits: usize,
}

impl KeyMaterial {
    /// Load key material from the `jwt` configuration section.
    pub fn from_config(config: &JwtConfig) -> Result<Self> {
        let private = config.resolve_private_key();
        let public = config.resolve_public_key();
        let keys = Self::from_encoded(private.as_deref(), public.as_deref())?;
        info!(
            bits = keys.modulus_bits(),
            can_issue = keys.public.is_some(),
            can_validate = keys.private.is_some(),
            "Loaded token key material"
        );
        Ok(keys)
    }

    /// Decode base64 DER (or PEM) encoded keys.
    ///
    /// When only the private key is given, the public key is derived from it.
    /// When both are given they must belong to the same pair.
    pub fn from_encoded(private: Option<&str>, public: Option<&str>) -> Result<Self> {
        let private_der = private
            .filter(|s| !s.trim().is_empty())
            .map(|s| decode_der(s, "private"))
            .transpose()?;
        let public_der = public
            .filter(|s| !s.trim().is_empty())
            .map(|s| decode_der(s, "public"))
            .transpose()?;

        let private = private_der
            .as_deref()
            .map(|der| {
                PrivateDecryptingKey::from_pkcs8(der)
                    .map_err(|e| Error::Key(format!("invalid PKCS#8 private key: {e}")))
            })
            .transpose()?;

        let public_der = match (&private, public_der) {
            (None, None) => {
                return Err(Error::Key(
                    "no key material configured (jwt.private_key / jwt.public_key)".to_string(),
                ));
            }
            (Some(private), None) => Some(public_der_of(&private.public_key())?),
            (Some(private), Some(given)) => {
                if public_der_of(&private.public_key())? != given {
                    return Err(Error::Key(
                        "public key does not belong to the configured private key".to_string(),
                    ));
                }
                Some(given)
            }
            (None, Some(given)) => Some(given),
        };

        let public = public_der
            .as_deref()
            .map(|der| {
                PublicEncryptingKey::from_der(der)
                    .map_err(|e| Error::Key(format!("invalid X.509 public key: {e}")))
            })
            .transpose()?;

        Self::assemble(private, public, private_der, public_der)
    }

    /// Generate a fresh key pair. Supported sizes are 2048, 3072, 4096 and
    /// 8192 bits.
    pub fn generate(bits: usize) -> Result<Self> {
        let size = match bits {
            2048 => KeySize::Rsa2048,
            3072 => KeySize::Rsa3072,
            4096 => KeySize::Rsa4096,
            8192 => KeySize::Rsa8192,
            _ => {
                return Err(Error::Key(format!(
                    "unsupported key size {bits} (use 2048, 3072, 4096 or 8192)"
                )));
            }
        };
        let private = PrivateDecryptingKey::generate(size)
            .map_err(|e| Error::Key(format!("key generation failed: {e}")))?;
        let private_der = private
            .as_der()
            .map_err(|e| Error::Key(format!("cannot encode private key: {e}")))?
            .as_ref()
            .to_vec();
        let public = private.public_key();
        let public_der = public_der_of(&public)?;

        Self::assemble(Some(private), Some(public), Some(private_der), Some(public_der))
    }

    fn assemble(
        private: Option<PrivateDecryptingKey>,
        public: Option<PublicEncryptingKey>,
        private_der: Option<Vec<u8>>,
        public_der: Option<Vec<u8>>,
    ) -> Result<Self> {
        let bits = public
            .as_ref()
            .map(PublicEncryptingKey::key_size_bits)
            .or_else(|| private.as_ref().map(PrivateDecryptingKey::key_size_bits))
            .unwrap_or(0);
        if bits < MIN_KEY_BITS {
            return Err(Error::Key(format!(
                "RSA modulus of {bits} bits is below the {MIN_KEY_BITS}-bit minimum"
            )));
        }

        let private = private
            .map(OaepPrivateDecryptingKey::new)
            .transpose()
            .map_err(|e| Error::Key(format!("private key unusable for OAEP: {e}")))?;
        let public = public
            .map(OaepPublicEncryptingKey::new)
            .transpose()
            .map_err(|e| Error::Key(format!("public key unusable for OAEP: {e}")))?;

        Ok(Self {
            private,
            public,
            private_der,
            public_der,
            bits,
        })
    }

    /// Private half, used to unwrap content-encryption keys.
    #[must_use]
    pub fn private_key(&self) -> Option<&OaepPrivateDecryptingKey> {
        self.private.as_ref()
    }

    /// Public half, used to wrap content-encryption keys.
    #[must_use]
    pub fn public_key(&self) -> Option<&OaepPublicEncryptingKey> {
        self.public.as_ref()
    }

    /// Modulus size in bits.
    #[must_use]
    pub fn modulus_bits(&self) -> usize {
        self.bits
    }

    /// Base64 PKCS#8 DER of the private key, if held.
    #[must_use]
    pub fn encode_private(&self) -> Option<String> {
        self.private_der.as_ref().map(|der| STANDARD.encode(der))
    }

    /// Base64 X.509 DER of the public key, if held.
    #[must_use]
    pub fn encode_public(&self) -> Option<String> {
        self.public_der.as_ref().map(|der| STANDARD.encode(der))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bits", &self.bits)
            .field("private", &self.private.is_some())
            .field("public", &self.public.is_some())
            .finish()
    }
}

fn public_der_of(key: &PublicEncryptingKey) -> Result<Vec<u8>> {
    key.as_der()
        .map(|der| der.as_ref().to_vec())
        .map_err(|e| Error::Key(format!("cannot encode public key: {e}")))
}

/// Base64 body of a DER key, with or without PEM armour.
fn decode_der(encoded: &str, which: &str) -> Result<Vec<u8>> {
    let compact: String = encoded
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .flat_map(str::chars)
        .filter(|c| !c.is_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map_err(|e| Error::Key(format!("{which} key is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::test_keys;

    fn pem(label: &str, base64: &str) -> String {
        let body: String = base64
            .as_bytes()
            .chunks(64)
            .map(|c| format!("{}\n", String::from_utf8_lossy(c)))
            .collect();
        format!("-----BEGIN {label}-----\n{body}-----END {label}-----\n")
    }

    #[test]
    fn private_key_alone_derives_public_key() {
        let encoded = test_keys::primary().encode_private().unwrap();

        let keys = KeyMaterial::from_encoded(Some(&encoded), None).unwrap();

        assert!(keys.private_key().is_some());
        assert!(keys.public_key().is_some());
        assert_eq!(keys.encode_public(), test_keys::primary().encode_public());
        assert_eq!(keys.modulus_bits(), 2048);
    }

    #[test]
    fn public_key_alone_is_accepted() {
        let encoded = test_keys::primary().encode_public().unwrap();

        let keys = KeyMaterial::from_encoded(None, Some(&encoded)).unwrap();

        assert!(keys.private_key().is_none());
        assert!(keys.public_key().is_some());
        assert_eq!(keys.encode_private(), None);
    }

    #[test]
    fn folded_base64_is_accepted() {
        let encoded = test_keys::primary().encode_public().unwrap();
        let folded: String = encoded
            .as_bytes()
            .chunks(64)
            .map(|c| format!("{}\n", String::from_utf8_lossy(c)))
            .collect();

        assert!(KeyMaterial::from_encoded(None, Some(&folded)).is_ok());
    }

    #[test]
    fn pem_armour_is_accepted() {
        let private = pem("PRIVATE KEY", &test_keys::primary().encode_private().unwrap());
        let public = pem("PUBLIC KEY", &test_keys::primary().encode_public().unwrap());

        let keys = KeyMaterial::from_encoded(Some(&private), Some(&public)).unwrap();

        assert_eq!(keys.encode_public(), test_keys::primary().encode_public());
    }

    #[test]
    fn mismatched_pair_is_rejected() {
        let private = test_keys::primary().encode_private().unwrap();
        let public = test_keys::secondary().encode_public().unwrap();

        let err = KeyMaterial::from_encoded(Some(&private), Some(&public)).unwrap_err();

        assert!(err.to_string().contains("does not belong"));
    }

    #[test]
    fn missing_material_is_rejected() {
        assert!(KeyMaterial::from_encoded(None, None).is_err());
        assert!(KeyMaterial::from_encoded(Some("  "), Some("")).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let err = KeyMaterial::from_encoded(Some("not base64!!"), None).unwrap_err();
        assert!(matches!(err, Error::Key(_)));

        let err = KeyMaterial::from_encoded(None, Some("AAAA")).unwrap_err();
        assert!(matches!(err, Error::Key(_)));
    }

    #[test]
    fn small_or_odd_sizes_are_refused() {
        assert!(KeyMaterial::generate(1024).is_err());
        assert!(KeyMaterial::generate(2000).is_err());
    }

    #[test]
    fn debug_does_not_print_key_material() {
        let keys = test_keys::primary();
        let rendered = format!("{keys:?}");
        assert!(rendered.contains("bits: 2048"));
        assert!(!rendered.contains(&keys.encode_private().unwrap()[..16]));
    }
}
