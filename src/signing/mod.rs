//! ECDSA P-256 signatures over SHA-256, used for config containers and API keys.
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
};

use crate::{Error, Result};

mod api_key;

pub use api_key::ApiKey;

/// Signs and verifies messages.
///
/// Holds either a full key pair, which can sign and verify, or only a public key, which can
/// only verify. Keys are accepted as PEM (`PRIVATE KEY` / `PUBLIC KEY`) or as base64 of the
/// DER encoding (PKCS#8 for private keys, SubjectPublicKeyInfo for public keys).
#[derive(Clone)]
pub struct SignUtil {
    verifying_key: VerifyingKey,
    signing_key: Option<SigningKey>,
}

impl fmt::Debug for SignUtil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignUtil")
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

fn is_pem(key: &str) -> bool {
    key.trim_start().starts_with("-----BEGIN")
}

fn decode_der(key: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(key.trim())
        .map_err(|err| Error::InvalidKey(err.to_string()))
}

impl SignUtil {
    /// Generate a fresh key pair.
    pub fn generate() -> SignUtil {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        SignUtil {
            verifying_key: *signing_key.verifying_key(),
            signing_key: Some(signing_key),
        }
    }

    /// Key pair from a serialized private key.
    pub fn from_private_key(key: &str) -> Result<SignUtil> {
        let signing_key = if is_pem(key) {
            SigningKey::from_pkcs8_pem(key.trim())
        } else {
            SigningKey::from_pkcs8_der(&decode_der(key)?)
        }
        .map_err(|err| Error::InvalidKey(err.to_string()))?;
        Ok(SignUtil {
            verifying_key: *signing_key.verifying_key(),
            signing_key: Some(signing_key),
        })
    }

    /// Verify-only util from a serialized public key.
    pub fn from_public_key(key: &str) -> Result<SignUtil> {
        let verifying_key = if is_pem(key) {
            VerifyingKey::from_public_key_pem(key.trim())
        } else {
            VerifyingKey::from_public_key_der(&decode_der(key)?)
        }
        .map_err(|err| Error::InvalidKey(err.to_string()))?;
        Ok(SignUtil {
            verifying_key,
            signing_key: None,
        })
    }

    /// Whether this util holds a private key.
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Verify-only copy of this util.
    pub fn public_only(&self) -> SignUtil {
        SignUtil {
            verifying_key: self.verifying_key,
            signing_key: None,
        }
    }

    /// Base64 DER (SubjectPublicKeyInfo) of the public key.
    pub fn serialize_public_key(&self) -> Result<String> {
        let document = self
            .verifying_key
            .to_public_key_der()
            .map_err(|err| Error::InvalidKey(err.to_string()))?;
        Ok(STANDARD.encode(document.as_bytes()))
    }

    /// Base64 DER (PKCS#8) of the private key.
    pub fn serialize_private_key(&self) -> Result<String> {
        let signing_key = self.signing_key()?;
        let document = signing_key
            .to_pkcs8_der()
            .map_err(|err| Error::InvalidKey(err.to_string()))?;
        Ok(STANDARD.encode(document.as_bytes()))
    }

    fn signing_key(&self) -> Result<&SigningKey> {
        self.signing_key.as_ref().ok_or_else(|| {
            Error::InvalidKey("can't sign a message without a private key".to_owned())
        })
    }

    /// Sign `message`, returning the base64 DER signature.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let signature: Signature = self.signing_key()?.sign(message);
        Ok(STANDARD.encode(signature.to_der().as_bytes()))
    }

    /// Whether `signature` (base64 DER) is a valid signature of exactly `message`.
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        let Ok(der) = STANDARD.decode(signature.trim()) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(&der) else {
            return false;
        };
        self.verifying_key.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::SignUtil;
    use crate::Error;

    #[test]
    fn signs_and_verifies() {
        let signer = SignUtil::generate();
        let message = b"{\"configVersion\":\"v1\"}";
        let signature = signer.sign(message).unwrap();

        assert!(signer.verify(message, &signature));
        assert!(signer.public_only().verify(message, &signature));
        assert!(!signer.verify(b"{\"configVersion\":\"v2\"}", &signature));
        assert!(!signer.verify(message, "not base64!"));
        assert!(!signer.verify(message, "AAAA"));
        assert!(!SignUtil::generate().verify(message, &signature));
    }

    #[test]
    fn any_byte_change_breaks_signature() {
        let signer = SignUtil::generate();
        let message = b"hello world".to_vec();
        let signature = signer.sign(&message).unwrap();
        for i in 0..message.len() {
            let mut tampered = message.clone();
            tampered[i] ^= 0x01;
            assert!(!signer.verify(&tampered, &signature), "byte {i}");
        }
    }

    #[test]
    fn keys_round_trip_through_serialization() {
        let signer = SignUtil::generate();
        let private = SignUtil::from_private_key(&signer.serialize_private_key().unwrap()).unwrap();
        let public = SignUtil::from_public_key(&signer.serialize_public_key().unwrap()).unwrap();

        let signature = private.sign(b"msg").unwrap();
        assert!(public.verify(b"msg", &signature));
        assert!(signer.verify(b"msg", &signature));
        assert!(!public.can_sign());
    }

    #[test]
    fn public_key_cannot_sign() {
        let public = SignUtil::generate().public_only();
        assert!(matches!(public.sign(b"msg"), Err(Error::InvalidKey(_))));
        assert!(matches!(
            public.serialize_private_key(),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(SignUtil::from_private_key("???").is_err());
        assert!(SignUtil::from_public_key("AAAA").is_err());
        assert!(SignUtil::from_public_key("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----").is_err());
    }
}
