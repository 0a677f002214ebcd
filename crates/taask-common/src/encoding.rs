//! Serde helpers for byte fields.
//!
//! Keys, signatures and ciphertext travel as base64 strings so records stay
//! readable in JSON and YAML.

/// `#[serde(with = "b64")]` for `Vec<u8>`
pub mod b64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "b64_opt")]` for `Option<Vec<u8>>`
pub mod b64_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|e| STANDARD.decode(e.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Blob {
        #[serde(with = "super::b64")]
        data: Vec<u8>,
        #[serde(with = "super::b64_opt", default)]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn test_bytes_render_as_base64() {
        let blob = Blob {
            data: b"taask".to_vec(),
            extra: None,
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"dGFhc2s=","extra":null}"#);

        let missing: Blob = serde_json::from_str(r#"{"data":"dGFhc2s="}"#).unwrap();
        assert_eq!(missing, blob);
    }
}
