use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::error::LedgerError;
use crate::types::{LedgerCall, SignedCall};

/// Ed25519 settlement signer. The secret key is zeroized on drop by
/// ed25519-dalek.
pub struct Signer {
    signing_key: SigningKey,
    address: String,
}

impl Signer {
    /// Generate a fresh signer from OS entropy.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Create from raw seed bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        if bytes.len() != 32 {
            return Err(LedgerError::InvalidKey(format!(
                "seed must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(bytes);
        let signer = Self::from_seed(&seed);
        seed.zeroize();
        Ok(signer)
    }

    /// Create from a hex-encoded seed, as stored in a signer key file.
    pub fn from_hex(encoded: &str) -> Result<Self, LedgerError> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|e| LedgerError::InvalidKey(format!("invalid hex seed: {}", e)))?;
        let signer = Self::from_bytes(&bytes);
        bytes.zeroize();
        signer
    }

    /// Hex-encoded seed for persisting to a key file.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_for(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `call` at `nonce`.
    pub fn sign_call(&self, call: LedgerCall, nonce: u64) -> Result<SignedCall, LedgerError> {
        let payload = SignedCall::signing_payload(&call, nonce)?;
        let signature = self.signing_key.sign(&payload);
        Ok(SignedCall {
            call,
            nonce,
            signer: self.address.clone(),
            public_key: self.public_key_hex(),
            signature: hex::encode(signature.to_bytes()),
        })
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Ledger address derived from a verifying key.
pub fn address_for(verifying_key: &VerifyingKey) -> String {
    let digest = blake3::hash(verifying_key.as_bytes());
    format!("0x{}", hex::encode(&digest.as_bytes()[..20]))
}

/// Check that `signed` was produced by the key it names.
pub fn verify_signed_call(signed: &SignedCall) -> Result<(), LedgerError> {
    let key_bytes: [u8; 32] = hex::decode(&signed.public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| LedgerError::InvalidSignature("malformed public key".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
    if address_for(&verifying_key) != signed.signer {
        return Err(LedgerError::InvalidSignature(
            "signer address does not match public key".into(),
        ));
    }
    let sig_bytes: [u8; 64] = hex::decode(&signed.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| LedgerError::InvalidSignature("malformed signature".into()))?;
    let payload = SignedCall::signing_payload(&signed.call, signed.nonce)?;
    verifying_key
        .verify(&payload, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| LedgerError::InvalidSignature("signature verification failed".into()))
}
