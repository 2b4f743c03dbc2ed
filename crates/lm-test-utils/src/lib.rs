// lm-test-utils: Mock services and signing helpers for integration
// testing the label subscription engine.
//
// Every mock binds 127.0.0.1:0 so each test gets an isolated instance.

use k256::ecdsa::signature::Signer;
use lm_protocol::{Label, signing};

pub mod mock_dataplane;
pub mod mock_directory;
pub mod mock_jetstream;
pub mod mock_labeler;
pub mod mock_pds;

pub use mock_dataplane::MockDataplane;
pub use mock_directory::MockDirectory;
pub use mock_jetstream::MockJetstream;
pub use mock_labeler::{ConnectionScript, MockLabeler};
pub use mock_pds::MockPds;

/// A deterministic secp256k1 labeler key for tests.
pub struct TestSigner {
    key: k256::ecdsa::SigningKey,
}

impl TestSigner {
    /// Derive a signer from a fixed seed byte; equal seeds give equal keys.
    pub fn from_seed(seed: u8) -> Self {
        assert!(seed != 0, "zero seed is not a valid scalar");
        Self { key: k256::ecdsa::SigningKey::from_slice(&[seed; 32]).expect("valid scalar") }
    }

    /// The key in `publicKeyMultibase` form (base58btc, secp256k1 multicodec).
    pub fn public_multibase(&self) -> String {
        let point = self.key.verifying_key().to_encoded_point(true);
        let mut bytes = vec![0xe7, 0x01];
        bytes.extend_from_slice(point.as_bytes());
        format!("z{}", bs58::encode(bytes).into_string())
    }

    /// Sign `label` in place over its canonical signing bytes.
    pub fn sign(&self, label: &mut Label) {
        let payload = signing::signing_bytes(label).expect("encodable label");
        let sig: k256::ecdsa::Signature = self.key.sign(&payload);
        label.sig = Some(sig.to_vec());
    }
}

/// A labeler identity document with the given key and endpoints.
pub fn labeler_did_doc(
    did: &str,
    signing_key_multibase: &str,
    labeler_endpoint: &str,
    pds_endpoint: &str,
) -> serde_json::Value {
    serde_json::json!({
        "id": did,
        "verificationMethod": [{
            "id": format!("{did}#atproto_label"),
            "type": "Multikey",
            "controller": did,
            "publicKeyMultibase": signing_key_multibase,
        }],
        "service": [
            {
                "id": "#atproto_labeler",
                "type": "AtprotoLabeler",
                "serviceEndpoint": labeler_endpoint,
            },
            {
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": pds_endpoint,
            }
        ],
    })
}
