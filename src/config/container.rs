//! Armored container holding a config body and its detached signature.
//!
//! ```text
//! -----BEGIN CM-----
//! Container-Version: v1
//!
//! -----END CM-----
//! -----BEGIN CONFIG-----
//! Signature: <base64 DER ECDSA signature of the body bytes>
//!
//! <base64 body, 64 columns>
//! -----END CONFIG-----
//! ```
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{
    conditions::{ConditionEngine, ValidationMode},
    config::{ConfigError, PrimaryConfig},
    signing::SignUtil,
    Result,
};

/// Container version written by [`encode_container`]. Any `v1.*` is accepted when decoding.
pub const CONTAINER_VERSION: &str = "v1";

const HEAD_BLOCK: &str = "CM";
const CONFIG_BLOCK: &str = "CONFIG";
const CONTAINER_VERSION_HEADER: &str = "Container-Version";
const SIGNATURE_HEADER: &str = "Signature";
const LINE_WIDTH: usize = 64;

struct Block<'a> {
    label: &'a str,
    headers: Vec<(&'a str, &'a str)>,
    body: Vec<u8>,
}

impl Block<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }
}

/// Armored blocks in `text`, in order. Text outside blocks is ignored. Parsing stops at the
/// first block that is unterminated or has an undecodable body.
fn blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let Some(label) = line
            .trim()
            .strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
        else {
            continue;
        };
        let end = format!("-----END {label}-----");

        let mut headers = Vec::new();
        let mut body = String::new();
        let mut in_headers = true;
        let mut closed = false;
        for line in lines.by_ref() {
            let line = line.trim();
            if line == end {
                closed = true;
                break;
            }
            if in_headers {
                if line.is_empty() {
                    in_headers = false;
                    continue;
                }
                if let Some((key, value)) = line.split_once(':') {
                    headers.push((key.trim(), value.trim()));
                    continue;
                }
                in_headers = false;
            }
            body.push_str(line);
        }
        if !closed {
            break;
        }
        let Ok(body) = STANDARD.decode(body) else {
            break;
        };
        blocks.push(Block {
            label,
            headers,
            body,
        });
    }
    blocks
}

pub(crate) fn armor(label: &str, headers: &[(&str, &str)], body: &[u8]) -> String {
    let mut out = format!("-----BEGIN {label}-----\n");
    if !headers.is_empty() {
        for (key, value) in headers {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out.push('\n');
    }
    let encoded = STANDARD.encode(body);
    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        // Base64 output is ASCII.
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn is_supported_version(version: &str) -> bool {
    version == CONTAINER_VERSION || version.starts_with("v1.")
}

/// Extract the config body from a signed container, returning it only once its signature
/// verifies against `verifier`.
pub fn decode_container(data: &[u8], verifier: &SignUtil) -> std::result::Result<Vec<u8>, ConfigError> {
    let text = std::str::from_utf8(data).map_err(|_| ConfigError::NotSigned)?;

    let mut container_version = None;
    let mut config = None;
    for block in blocks(text) {
        match block.label {
            HEAD_BLOCK => {
                let version = block.header(CONTAINER_VERSION_HEADER).unwrap_or_default();
                if !is_supported_version(version) {
                    return Err(ConfigError::UnsupportedContainerVersion(version.to_owned()));
                }
                container_version = Some(version.to_owned());
            }
            CONFIG_BLOCK => {
                let signature = block.header(SIGNATURE_HEADER).map(str::to_owned);
                config = Some((block.body, signature));
            }
            _ => {}
        }
    }

    if container_version.is_none() {
        return Err(ConfigError::NotSigned);
    }
    let (body, signature) = match config {
        Some((body, signature)) if !body.is_empty() => (body, signature),
        _ => return Err(ConfigError::MissingConfigBlock),
    };
    let signature = signature
        .filter(|signature| !signature.is_empty())
        .ok_or(ConfigError::MissingSignature)?;
    if !verifier.verify(&body, &signature) {
        return Err(ConfigError::InvalidSignature);
    }
    Ok(body)
}

/// Sign a config body and wrap it in a container. The body must be a valid config under
/// strict validation; its bytes are signed and stored exactly as given.
pub fn encode_container(config_json: &[u8], signer: &SignUtil) -> Result<String> {
    PrimaryConfig::from_json(config_json, &ConditionEngine::new(ValidationMode::Strict))?;

    let signature = signer.sign(config_json)?;
    let mut out = armor(HEAD_BLOCK, &[(CONTAINER_VERSION_HEADER, CONTAINER_VERSION)], &[]);
    out.push_str(&armor(
        CONFIG_BLOCK,
        &[(SIGNATURE_HEADER, signature.as_str())],
        config_json,
    ));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{armor, decode_container, encode_container};
    use crate::{config::ConfigError, signing::SignUtil, Error};

    const CONFIG: &[u8] = br#"{"configVersion":"v1","appId":"com.example"}"#;

    fn container(version: &str, body: &[u8], signature: Option<&str>) -> String {
        let mut out = armor("CM", &[("Container-Version", version)], &[]);
        match signature {
            Some(signature) => out.push_str(&armor("CONFIG", &[("Signature", signature)], body)),
            None => out.push_str(&armor("CONFIG", &[], body)),
        }
        out
    }

    #[test]
    fn encodes_and_decodes() {
        let signer = SignUtil::generate();
        let encoded = encode_container(CONFIG, &signer).unwrap();
        assert!(encoded.starts_with("-----BEGIN CM-----\nContainer-Version: v1\n\n-----END CM-----\n"));
        assert!(encoded.contains("-----BEGIN CONFIG-----\nSignature: "));

        let body = decode_container(encoded.as_bytes(), &signer.public_only()).unwrap();
        assert_eq!(body, CONFIG);
    }

    #[test]
    fn long_bodies_wrap() {
        let signer = SignUtil::generate();
        let config = format!(
            r#"{{"configVersion":"v1","appId":"{}"}}"#,
            "a".repeat(300)
        );
        let encoded = encode_container(config.as_bytes(), &signer).unwrap();
        assert!(encoded.lines().all(|line| line.len() <= 64 || line.starts_with("Signature: ")));
        assert_eq!(
            decode_container(encoded.as_bytes(), &signer).unwrap(),
            config.as_bytes()
        );
    }

    #[test]
    fn encode_rejects_invalid_configs() {
        let signer = SignUtil::generate();
        assert!(matches!(
            encode_container(b"{}", &signer),
            Err(Error::Config(ConfigError::Invalid(_)))
        ));
        assert!(matches!(
            encode_container(b"not json", &signer),
            Err(Error::Config(ConfigError::Json(_)))
        ));
        assert!(matches!(
            encode_container(CONFIG, &signer.public_only()),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let signer = SignUtil::generate();
        let signature = signer.sign(CONFIG).unwrap();
        let tampered = br#"{"configVersion":"v1","appId":"com.evil"}"#;

        assert!(decode_container(container("v1", CONFIG, Some(&signature)).as_bytes(), &signer).is_ok());
        assert_eq!(
            decode_container(container("v1", tampered, Some(&signature)).as_bytes(), &signer),
            Err(ConfigError::InvalidSignature)
        );
        assert_eq!(
            decode_container(
                container("v1", CONFIG, Some(&signature)).as_bytes(),
                &SignUtil::generate()
            ),
            Err(ConfigError::InvalidSignature)
        );
    }

    #[test]
    fn checks_container_version() {
        let signer = SignUtil::generate();
        let signature = signer.sign(CONFIG).unwrap();
        for version in ["v1", "v1.0", "v1.7"] {
            assert!(
                decode_container(container(version, CONFIG, Some(&signature)).as_bytes(), &signer).is_ok(),
                "{version}"
            );
        }
        for version in ["v2", "v10", ""] {
            assert_eq!(
                decode_container(container(version, CONFIG, Some(&signature)).as_bytes(), &signer),
                Err(ConfigError::UnsupportedContainerVersion(version.to_owned()))
            );
        }
    }

    #[test]
    fn requires_both_blocks_and_signature() {
        let signer = SignUtil::generate();
        let signature = signer.sign(CONFIG).unwrap();

        let config_only = armor("CONFIG", &[("Signature", signature.as_str())], CONFIG);
        assert_eq!(
            decode_container(config_only.as_bytes(), &signer),
            Err(ConfigError::NotSigned)
        );

        let head_only = armor("CM", &[("Container-Version", "v1")], &[]);
        assert_eq!(
            decode_container(head_only.as_bytes(), &signer),
            Err(ConfigError::MissingConfigBlock)
        );

        assert_eq!(
            decode_container(container("v1", CONFIG, None).as_bytes(), &signer),
            Err(ConfigError::MissingSignature)
        );

        assert_eq!(decode_container(b"{}", &signer), Err(ConfigError::NotSigned));
        assert_eq!(decode_container(&[0xff, 0xfe], &signer), Err(ConfigError::NotSigned));
    }
}
