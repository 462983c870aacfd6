use std::{collections::BTreeMap, fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{signing::SignUtil, Error, Result};

const CURRENT_VERSION: u32 = 1;
const PREFIX: &str = "CM";
const SEPARATOR: char = '-';
const PROPERTY_DELIMITER: char = ':';
const BUNDLE_ID_KEY: &str = "b";

/// API key identifying an app to the library.
///
/// Format: `CM<version>-<prop>-<prop>...-<signature>`, where each prop is base64 of
/// `key:value` and the signature covers everything before the last `-`. Only the bundle id
/// prop (`b`) is required. Unknown props are kept, and they are covered by the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    signed_portion: String,
    signature: String,
    version: u32,
    props: BTreeMap<String, String>,
}

fn invalid(reason: &str) -> Error {
    log::debug!(target: "critical_moments", reason; "failed to parse API key");
    Error::InvalidApiKey
}

impl ApiKey {
    /// Parse a key. The signature is not checked; see [`ApiKey::verify`].
    pub fn parse(key: &str) -> Result<ApiKey> {
        let rest = key
            .strip_prefix(PREFIX)
            .ok_or_else(|| invalid("all API keys should start with CM"))?;
        let (version, _) = rest
            .split_once(SEPARATOR)
            .ok_or_else(|| invalid("no version number"))?;
        let version = version
            .parse::<u32>()
            .map_err(|_| invalid("version is not a number"))?;

        let (signed_portion, signature) = key
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| invalid("no signature marker"))?;
        let props_section = signed_portion
            .split_once(SEPARATOR)
            .map(|(_, props)| props)
            .ok_or_else(|| invalid("no properties"))?;

        let mut props = BTreeMap::new();
        for raw in props_section.split(SEPARATOR) {
            let decoded = STANDARD
                .decode(raw)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(|| invalid("property is not base64"))?;
            let (name, value) = decoded
                .split_once(PROPERTY_DELIMITER)
                .ok_or_else(|| invalid("property has no delimiter"))?;
            if name.is_empty() || value.is_empty() {
                return Err(invalid("property has empty key or value"));
            }
            props.insert(name.to_owned(), value.to_owned());
        }
        if props.get(BUNDLE_ID_KEY).map_or(true, String::is_empty) {
            return Err(invalid("API key must have bundle ID property"));
        }

        Ok(ApiKey {
            signed_portion: signed_portion.to_owned(),
            signature: signature.to_owned(),
            version,
            props,
        })
    }

    /// Create and sign a key for `bundle_id`.
    pub fn new_signed(bundle_id: &str, signer: &SignUtil) -> Result<ApiKey> {
        Self::new_signed_with_props(
            BTreeMap::from([(BUNDLE_ID_KEY.to_owned(), bundle_id.to_owned())]),
            signer,
        )
    }

    /// Create and sign a key carrying `props`, which must include the bundle id (`b`). Props
    /// are written in key order.
    pub fn new_signed_with_props(
        props: BTreeMap<String, String>,
        signer: &SignUtil,
    ) -> Result<ApiKey> {
        if props.get(BUNDLE_ID_KEY).map_or(true, String::is_empty) {
            return Err(Error::InvalidApiKey);
        }
        if props.iter().any(|(key, value)| {
            key.is_empty() || value.is_empty() || key.contains(PROPERTY_DELIMITER)
        }) {
            return Err(Error::InvalidApiKey);
        }

        let mut signed_portion = format!("{PREFIX}{CURRENT_VERSION}");
        for (key, value) in &props {
            signed_portion.push(SEPARATOR);
            signed_portion
                .push_str(&STANDARD.encode(format!("{key}{PROPERTY_DELIMITER}{value}")));
        }
        let signature = signer.sign(signed_portion.as_bytes())?;

        Ok(ApiKey {
            signed_portion,
            signature,
            version: CURRENT_VERSION,
            props,
        })
    }

    /// Key format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Bundle id the key was issued for.
    pub fn bundle_id(&self) -> &str {
        self.props.get(BUNDLE_ID_KEY).map_or("", String::as_str)
    }

    /// Value of any prop in the key.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Whether the key's signature is valid for `signer`'s public key.
    pub fn verify(&self, signer: &SignUtil) -> bool {
        signer.verify(self.signed_portion.as_bytes(), &self.signature)
    }

    /// Check the signature and that the key was issued for `bundle_id`.
    pub fn check(&self, bundle_id: &str, signer: &SignUtil) -> Result<()> {
        if !self.verify(signer) {
            return Err(Error::InvalidApiKey);
        }
        if self.bundle_id() != bundle_id {
            return Err(Error::ApiKeyBundleMismatch {
                key_bundle_id: self.bundle_id().to_owned(),
                bundle_id: bundle_id.to_owned(),
            });
        }
        Ok(())
    }
}

impl FromStr for ApiKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ApiKey::parse(s)
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.signed_portion, self.signature)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::ApiKey;
    use crate::{signing::SignUtil, Error};

    #[test]
    fn creates_and_parses_keys() {
        let signer = SignUtil::generate();
        let key = ApiKey::new_signed("io.criticalmoments.demo", &signer).unwrap();
        let serialized = key.to_string();
        assert!(serialized.starts_with("CM1-"));

        let parsed: ApiKey = serialized.parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.version(), 1);
        assert_eq!(parsed.bundle_id(), "io.criticalmoments.demo");
        assert!(parsed.verify(&signer.public_only()));
        parsed
            .check("io.criticalmoments.demo", &signer.public_only())
            .unwrap();
    }

    #[test]
    fn keeps_and_signs_unknown_props() {
        let signer = SignUtil::generate();
        let props = BTreeMap::from([
            ("b".to_owned(), "com.example".to_owned()),
            ("z".to_owned(), "later".to_owned()),
            ("a".to_owned(), "first".to_owned()),
        ]);
        let key = ApiKey::new_signed_with_props(props, &signer).unwrap();
        let parsed = ApiKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed.prop("a"), Some("first"));
        assert_eq!(parsed.prop("z"), Some("later"));
        assert!(parsed.verify(&signer));

        // Dropping a prop invalidates the signature.
        let serialized = key.to_string();
        let parts: Vec<&str> = serialized.split('-').collect();
        let without_a = [parts[0], parts[2], parts[3], parts[4]].join("-");
        assert!(!ApiKey::parse(&without_a).unwrap().verify(&signer));
    }

    #[test]
    fn check_rejects_wrong_signer_and_bundle() {
        let signer = SignUtil::generate();
        let key = ApiKey::new_signed("com.example", &signer).unwrap();

        assert!(matches!(
            key.check("com.example", &SignUtil::generate()),
            Err(Error::InvalidApiKey)
        ));
        assert!(matches!(
            key.check("com.other", &signer),
            Err(Error::ApiKeyBundleMismatch { key_bundle_id, bundle_id })
                if key_bundle_id == "com.example" && bundle_id == "com.other"
        ));
    }

    #[test]
    fn rejects_malformed_keys() {
        let prop = |s: &str| STANDARD.encode(s);
        let cases = [
            String::new(),
            "CM1".to_owned(),
            format!("XX1-{}-sig", prop("b:com.example")),
            format!("CMx-{}-sig", prop("b:com.example")),
            format!("CM-{}-sig", prop("b:com.example")),
            format!("CM1-{}", prop("b:com.example")),
            format!("CM1-{}-sig", prop("a:value")),
            format!("CM1-{}-sig", prop("b:")),
            format!("CM1-{}-sig", prop(":com.example")),
            format!("CM1-{}-sig", prop("bcom.example")),
            "CM1-%%%-sig".to_owned(),
        ];
        for case in cases {
            assert!(
                matches!(ApiKey::parse(&case), Err(Error::InvalidApiKey)),
                "{case}"
            );
        }
    }

    #[test]
    fn creating_requires_bundle_and_private_key() {
        let signer = SignUtil::generate();
        assert!(ApiKey::new_signed("", &signer).is_err());
        assert!(matches!(
            ApiKey::new_signed("com.example", &signer.public_only()),
            Err(Error::InvalidKey(_))
        ));
    }
}
