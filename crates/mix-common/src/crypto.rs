use crate::chain::TransactionLayer;
use crate::config::Network;
use crate::errors::MixError;
use crate::types::{OutPoint, Transaction, COIN};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey as PublicKey};
use sha2::{Digest, Sha256};

/// Amount a masternode identity input must lock.
pub const MASTERNODE_COLLATERAL: i64 = 1000 * COIN;

const SIGHASH_TAG: &[u8] = b"mixpool-sighash";
const DERIVE_TAG: &[u8] = b"mixpool-derive";

/// Length of a signature script: public key followed by the signature.
pub const SCRIPT_SIG_LEN: usize = 32 + 64;

pub struct Crypto {
    public_key: PublicKey,
    signing_key: SigningKey,
}

impl Crypto {
    pub fn from_secret_key(secret_key: &[u8; 32]) -> Result<Self, MixError> {
        let signing_key = SigningKey::from_bytes(secret_key);
        let public_key = signing_key.verifying_key();
        Ok(Crypto {
            public_key,
            signing_key,
        })
    }

    /// Parses a 32 byte secret key given as 64 hex characters.
    pub fn from_hex(secret: &str) -> Result<Self, MixError> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| MixError::ConfigError(format!("invalid secret key: {e}")))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            MixError::ConfigError("secret key must be 32 bytes (64 hex characters)".to_string())
        })?;
        Self::from_secret_key(&seed)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// The `index`th child key. Children are reproducible from the parent
    /// secret and unlinkable without it.
    pub fn derive(&self, index: u32) -> Crypto {
        let mut hasher = Sha256::new();
        hasher.update(DERIVE_TAG);
        hasher.update(self.signing_key.to_bytes());
        hasher.update(index.to_le_bytes());
        let seed: [u8; 32] = hasher.finalize().into();
        let signing_key = SigningKey::from_bytes(&seed);
        Crypto {
            public_key: signing_key.verifying_key(),
            signing_key,
        }
    }

    pub fn script_pubkey(&self) -> Vec<u8> {
        p2pkh_script(&self.public_key)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Signs `message` under the network's domain-separation prefix.
    pub fn sign_message(&self, network: Network, message: &str) -> Vec<u8> {
        let digest = message_digest(network, message);
        self.sign(&digest).to_bytes().to_vec()
    }

    /// Produces the signature script for input `index` of `tx`.
    pub fn sign_input(&self, tx: &Transaction, index: usize) -> Result<Vec<u8>, MixError> {
        let sighash = input_sighash(tx, index)?;
        let signature = self.sign(&sighash);
        let mut script = Vec::with_capacity(SCRIPT_SIG_LEN);
        script.extend_from_slice(self.public_key.as_bytes());
        script.extend_from_slice(&signature.to_bytes());
        Ok(script)
    }

    pub fn pubkey_from_bytes(bytes: &[u8]) -> Result<PublicKey, MixError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            MixError::SerializationError("Failed to deserialize public key".to_string())
        })?;
        PublicKey::from_bytes(&bytes).map_err(|_| {
            MixError::SerializationError("Failed to deserialize public key".to_string())
        })
    }

    pub fn verify(
        message: &[u8],
        signature: &Signature,
        public_key: &PublicKey,
    ) -> Result<(), MixError> {
        public_key
            .verify(message, signature)
            .map_err(|_| MixError::InvalidSignature)
    }

    pub fn verify_message(
        network: Network,
        public_key: &PublicKey,
        signature: &[u8],
        message: &str,
    ) -> Result<(), MixError> {
        let signature = Signature::from_slice(signature).map_err(|_| MixError::InvalidSignature)?;
        Self::verify(&message_digest(network, message), &signature, public_key)
    }
}

/// Pay-to-pubkey-hash script for an identity key.
pub fn p2pkh_script(public_key: &PublicKey) -> Vec<u8> {
    let hash = Sha256::digest(public_key.as_bytes());
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&hash[..20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn message_digest(network: Network, message: &str) -> [u8; 32] {
    let magic = network.message_magic();
    let mut hasher = Sha256::new();
    hasher.update((magic.len() as u32).to_le_bytes());
    hasher.update(magic.as_bytes());
    hasher.update((message.len() as u32).to_le_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// Digest an input signature commits to: every output plus the signed input
/// alone, so each participant can sign without the others' signatures.
pub fn input_sighash(tx: &Transaction, index: usize) -> Result<[u8; 32], MixError> {
    let input = tx.inputs.get(index).ok_or_else(|| {
        MixError::ProtocolViolation("input index out of range".to_string(), index.to_string())
    })?;
    let mut hasher = Sha256::new();
    hasher.update(SIGHASH_TAG);
    hasher.update(tx.version.to_le_bytes());
    hasher.update(tx.lock_time.to_le_bytes());
    hasher.update((tx.outputs.len() as u32).to_le_bytes());
    for output in &tx.outputs {
        hasher.update(output.value.to_le_bytes());
        hasher.update((output.script_pubkey.len() as u32).to_le_bytes());
        hasher.update(&output.script_pubkey);
    }
    hasher.update(input.prevout.txid);
    hasher.update(input.prevout.vout.to_le_bytes());
    hasher.update(input.sequence.to_le_bytes());
    Ok(hasher.finalize().into())
}

/// Checks `script_sig` as the signature of input `index` of `tx` spending an
/// output locked by `prev_script`.
pub fn verify_input_signature(
    tx: &Transaction,
    index: usize,
    script_sig: &[u8],
    prev_script: &[u8],
) -> Result<(), MixError> {
    if script_sig.len() != SCRIPT_SIG_LEN {
        return Err(MixError::InvalidSignature);
    }
    let (key_bytes, sig_bytes) = script_sig.split_at(32);
    let public_key = Crypto::pubkey_from_bytes(key_bytes)?;
    if p2pkh_script(&public_key) != prev_script {
        return Err(MixError::InvalidSignature);
    }
    let signature = Signature::from_slice(sig_bytes).map_err(|_| MixError::InvalidSignature)?;
    let sighash = input_sighash(tx, index)?;
    Crypto::verify(&sighash, &signature, &public_key)
}

/// True when `identity` spends a transaction output paying exactly the
/// masternode collateral to `public_key`.
pub fn is_associated_with_identity(
    layer: &dyn TransactionLayer,
    identity: &OutPoint,
    public_key: &PublicKey,
) -> bool {
    let payee = p2pkh_script(public_key);
    match layer.get_transaction(&identity.txid) {
        Some(tx) => tx
            .outputs
            .iter()
            .any(|out| out.value == MASTERNODE_COLLATERAL && out.script_pubkey == payee),
        None => false,
    }
}
