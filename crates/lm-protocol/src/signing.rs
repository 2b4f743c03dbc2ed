//! Label signing payload and publisher key material.
//!
//! Publishers sign the DAG-CBOR encoding of the label with the fields
//! `ver, src, uri, cid, val, neg, cts, exp` — absent fields omitted, in
//! exactly that order, `sig` never included. The signing key is declared
//! as a multibase string: `z` (base58btc) over a two-byte multicodec
//! prefix and a SEC-1 compressed point.

use serde::Serialize;

use crate::Label;

const MULTICODEC_SECP256K1: [u8; 2] = [0xe7, 0x01];
const MULTICODEC_P256: [u8; 2] = [0x80, 0x24];

// ---------------------------------------------------------------------------
// Signing payload
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SigningPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ver: Option<i64>,
    src: &'a str,
    uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<&'a str>,
    val: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    neg: Option<bool>,
    cts: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload encoding: {0}")]
    Encode(#[from] serde_ipld_dagcbor::EncodeError<std::collections::TryReserveError>),
}

/// The exact byte sequence a publisher signs for `label`.
pub fn signing_bytes(label: &Label) -> Result<Vec<u8>, PayloadError> {
    let payload = SigningPayload {
        ver: label.ver,
        src: &label.src,
        uri: &label.uri,
        cid: label.cid.as_deref(),
        val: &label.val,
        neg: label.neg,
        cts: &label.cts,
        exp: label.exp.as_deref(),
    };
    Ok(serde_ipld_dagcbor::to_vec(&payload)?)
}

// ---------------------------------------------------------------------------
// Publisher keys
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("unsupported multibase prefix (expected base58btc 'z')")]
    UnsupportedBase,
    #[error("invalid base58 encoding")]
    Base58,
    #[error("key too short for multicodec prefix")]
    TooShort,
    #[error("unknown key multicodec: {0:#04x} {1:#04x}")]
    UnknownCurve(u8, u8),
    #[error("invalid public key point")]
    InvalidPoint,
}

/// A publisher's declared signing key, resolved from `publicKeyMultibase`.
#[derive(Debug, Clone)]
pub enum LabelerKey {
    Secp256k1(k256::ecdsa::VerifyingKey),
    P256(p256::ecdsa::VerifyingKey),
}

impl LabelerKey {
    pub fn parse_multibase(key: &str) -> Result<Self, KeyError> {
        let encoded = key.strip_prefix('z').ok_or(KeyError::UnsupportedBase)?;
        let bytes = bs58::decode(encoded).into_vec().map_err(|_| KeyError::Base58)?;
        if bytes.len() < 3 {
            return Err(KeyError::TooShort);
        }
        let (prefix, point) = bytes.split_at(2);
        match [prefix[0], prefix[1]] {
            MULTICODEC_SECP256K1 => k256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map(Self::Secp256k1)
                .map_err(|_| KeyError::InvalidPoint),
            MULTICODEC_P256 => p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map(Self::P256)
                .map_err(|_| KeyError::InvalidPoint),
            [a, b] => Err(KeyError::UnknownCurve(a, b)),
        }
    }

    /// Verify a compact ECDSA signature over `msg`.
    ///
    /// High-S signatures are retried in normalized form; some publishers
    /// predate the low-S requirement.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        match self {
            Self::Secp256k1(key) => {
                use k256::ecdsa::signature::Verifier;
                let Ok(parsed) = k256::ecdsa::Signature::from_slice(sig) else {
                    return false;
                };
                key.verify(msg, &parsed).is_ok()
                    || parsed.normalize_s().is_some_and(|n| key.verify(msg, &n).is_ok())
            }
            Self::P256(key) => {
                use p256::ecdsa::signature::Verifier;
                let Ok(parsed) = p256::ecdsa::Signature::from_slice(sig) else {
                    return false;
                };
                key.verify(msg, &parsed).is_ok()
                    || parsed.normalize_s().is_some_and(|n| key.verify(msg, &n).is_ok())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::signature::Signer;

    use super::*;

    fn label() -> Label {
        Label {
            ver: Some(1),
            src: "did:plc:publisher".to_owned(),
            uri: "did:plc:subject".to_owned(),
            cid: None,
            val: "spam".to_owned(),
            neg: None,
            cts: "2024-01-01T00:00:00Z".to_owned(),
            exp: None,
            sig: None,
        }
    }

    fn encode_multibase(prefix: [u8; 2], point: &[u8]) -> String {
        let mut bytes = prefix.to_vec();
        bytes.extend_from_slice(point);
        format!("z{}", bs58::encode(bytes).into_string())
    }

    #[test]
    fn signing_bytes_excludes_absent_fields() {
        let with_cid = Label { cid: Some("bafyfoo".to_owned()), ..label() };
        let without_cid = label();
        let a = signing_bytes(&with_cid).unwrap();
        let b = signing_bytes(&without_cid).unwrap();
        assert_ne!(a, b);
        // "cid" never appears in the encoding when the field is absent
        assert!(!b.windows(3).any(|w| w == b"cid"));
    }

    #[test]
    fn signing_bytes_excludes_sig() {
        let mut signed = label();
        signed.sig = Some(vec![0xAB; 64]);
        assert_eq!(signing_bytes(&signed).unwrap(), signing_bytes(&label()).unwrap());
    }

    #[test]
    fn signing_bytes_emits_fields_in_declared_order() {
        let bytes = signing_bytes(&label()).unwrap();
        let positions: Vec<usize> = ["ver", "src", "uri", "val", "cts"]
            .iter()
            .map(|f| {
                bytes
                    .windows(f.len())
                    .position(|w| w == f.as_bytes())
                    .unwrap_or_else(|| panic!("field {f} missing"))
            })
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn secp256k1_key_round_trips_and_verifies() {
        let secret = k256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap();
        let point = secret.verifying_key().to_encoded_point(true);
        let multibase = encode_multibase(MULTICODEC_SECP256K1, point.as_bytes());

        let key = LabelerKey::parse_multibase(&multibase).unwrap();
        let msg = signing_bytes(&label()).unwrap();
        let sig: k256::ecdsa::Signature = secret.sign(&msg);
        assert!(key.verify(&msg, &sig.to_vec()));
        assert!(!key.verify(b"different message", &sig.to_vec()));
    }

    #[test]
    fn p256_key_round_trips_and_verifies() {
        use p256::ecdsa::signature::Signer;
        let secret = p256::ecdsa::SigningKey::from_slice(&[9u8; 32]).unwrap();
        let point = secret.verifying_key().to_encoded_point(true);
        let multibase = encode_multibase(MULTICODEC_P256, point.as_bytes());

        let key = LabelerKey::parse_multibase(&multibase).unwrap();
        let sig: p256::ecdsa::Signature = secret.sign(b"payload");
        assert!(key.verify(b"payload", &sig.to_vec()));
    }

    #[test]
    fn unknown_curve_prefix_rejected() {
        let multibase = encode_multibase([0xed, 0x01], &[0u8; 32]);
        assert!(matches!(
            LabelerKey::parse_multibase(&multibase),
            Err(KeyError::UnknownCurve(0xed, 0x01))
        ));
    }

    #[test]
    fn non_base58btc_prefix_rejected() {
        assert!(matches!(
            LabelerKey::parse_multibase("uFoo"),
            Err(KeyError::UnsupportedBase)
        ));
    }

    #[test]
    fn tampered_signature_rejected() {
        let secret = k256::ecdsa::SigningKey::from_slice(&[5u8; 32]).unwrap();
        let point = secret.verifying_key().to_encoded_point(true);
        let key = LabelerKey::parse_multibase(&encode_multibase(
            MULTICODEC_SECP256K1,
            point.as_bytes(),
        ))
        .unwrap();
        let msg = b"hello";
        let sig: k256::ecdsa::Signature = secret.sign(msg);
        let mut bad = sig.to_vec();
        bad[10] ^= 0xFF;
        assert!(!key.verify(msg, &bad));
    }
}
