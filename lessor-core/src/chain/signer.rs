use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{
    BroadcastReceipt, CODE_SEQUENCE_MISMATCH, ChainClient, SignedTx, TxBody, TxMessage,
};
use crate::error::{LessorError, Result};
use crate::types::ProviderAddress;

/// Signing capability backed by a key the daemon controls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyManager: Send + Sync {
    fn address(&self) -> ProviderAddress;

    fn public_key(&self) -> Vec<u8>;

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Ed25519 key loaded from a hex-encoded 32 byte seed.
pub struct Ed25519KeyManager {
    key: SigningKey,
    address: ProviderAddress,
}

impl fmt::Debug for Ed25519KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyManager")
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Ed25519KeyManager {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let seed = Zeroizing::new(seed);
        let key = SigningKey::from_bytes(&seed);
        let address = derive_address(key.verifying_key().as_bytes());
        Self { key, address }
    }

    pub fn from_hex_seed(raw: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(raw.trim())
                .map_err(|err| LessorError::Validation(format!("invalid key seed hex: {err}")))?,
        );
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            LessorError::Validation(format!(
                "key seed must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_seed(seed))
    }

    pub async fn from_seed_file(path: &Path) -> Result<Self> {
        let raw = Zeroizing::new(tokio::fs::read_to_string(path).await.map_err(|err| {
            LessorError::Fatal(format!("cannot read signing key {}: {err}", path.display()))
        })?);
        Self::from_hex_seed(&raw)
    }
}

#[async_trait]
impl KeyManager for Ed25519KeyManager {
    fn address(&self) -> ProviderAddress {
        self.address.clone()
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().as_bytes().to_vec()
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(payload).to_bytes().to_vec())
    }
}

/// Account address: `lsr1` followed by the first 20 bytes of the public key's
/// SHA-256, hex encoded.
pub fn derive_address(public_key: &[u8]) -> ProviderAddress {
    let digest = Sha256::digest(public_key);
    ProviderAddress(format!("lsr1{}", hex::encode(&digest[..20])))
}

/// Builds, sequences, signs and broadcasts transactions for one account.
///
/// The cached account sequence is dropped whenever a broadcast outcome is
/// uncertain (transport failure) or the chain reports a mismatch, and is
/// re-queried before the next transaction.
pub struct TxSigner {
    keys: Arc<dyn KeyManager>,
    chain: Arc<dyn ChainClient>,
    chain_id: String,
    timeout: Duration,
    next_sequence: Mutex<Option<u64>>,
}

impl fmt::Debug for TxSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self
            .next_sequence
            .try_lock()
            .map(|guard| *guard)
            .unwrap_or_default();
        f.debug_struct("TxSigner")
            .field("address", &self.keys.address())
            .field("chain_id", &self.chain_id)
            .field("timeout", &self.timeout)
            .field("next_sequence", &cached)
            .finish()
    }
}

impl TxSigner {
    pub fn new(
        keys: Arc<dyn KeyManager>,
        chain: Arc<dyn ChainClient>,
        chain_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            keys,
            chain,
            chain_id: chain_id.into(),
            timeout,
            next_sequence: Mutex::new(None),
        }
    }

    pub fn address(&self) -> ProviderAddress {
        self.keys.address()
    }

    /// Sign a transaction carrying `messages` with the next account sequence.
    pub async fn sign(&self, messages: Vec<TxMessage>, memo: &str) -> Result<SignedTx> {
        let sequence = self.reserve_sequence().await?;
        let body = TxBody {
            chain_id: self.chain_id.clone(),
            signer: self.keys.address(),
            sequence,
            messages,
            memo: memo.to_string(),
        };
        let bytes = body.sign_bytes()?;
        let signature = tokio::time::timeout(self.timeout, self.keys.sign(&bytes))
            .await
            .map_err(|_| LessorError::timed_out("signing"))??;

        Ok(SignedTx {
            body,
            public_key: STANDARD.encode(self.keys.public_key()),
            signature: STANDARD.encode(signature),
        })
    }

    /// Broadcast a signed transaction under the configured deadline.
    ///
    /// A sequence mismatch comes back as a transient error so callers retry
    /// with a freshly signed transaction; other non-zero codes are returned
    /// in the receipt for the caller to interpret.
    pub async fn broadcast(&self, tx: &SignedTx) -> Result<BroadcastReceipt> {
        let outcome = tokio::time::timeout(self.timeout, self.chain.broadcast(tx)).await;
        let receipt = match outcome {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(err)) => {
                self.reset_sequence().await;
                return Err(err);
            }
            Err(_) => {
                self.reset_sequence().await;
                return Err(LessorError::timed_out("broadcast"));
            }
        };

        if receipt.code == CODE_SEQUENCE_MISMATCH {
            warn!(
                target: "lessor::chain",
                sequence = tx.body.sequence,
                log = %receipt.log,
                "account sequence mismatch; refreshing"
            );
            self.reset_sequence().await;
            return Err(LessorError::Transient(format!(
                "sequence mismatch for {}: {}",
                tx.body.signer, receipt.log
            )));
        }
        Ok(receipt)
    }

    pub async fn sign_and_broadcast(
        &self,
        messages: Vec<TxMessage>,
        memo: &str,
    ) -> Result<BroadcastReceipt> {
        let tx = self.sign(messages, memo).await?;
        self.broadcast(&tx).await
    }

    async fn reserve_sequence(&self) -> Result<u64> {
        let mut guard = self.next_sequence.lock().await;
        let sequence = match *guard {
            Some(sequence) => sequence,
            None => {
                let address = self.keys.address();
                let fetched =
                    tokio::time::timeout(self.timeout, self.chain.account_sequence(&address))
                        .await
                        .map_err(|_| LessorError::timed_out("account sequence query"))??;
                debug!(target: "lessor::chain", %address, sequence = fetched, "account sequence loaded");
                fetched
            }
        };
        *guard = Some(sequence + 1);
        Ok(sequence)
    }

    async fn reset_sequence(&self) {
        *self.next_sequence.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    #[tokio::test]
    async fn signatures_verify_against_the_public_key() {
        let keys = Ed25519KeyManager::from_hex_seed(SEED).expect("seed");
        let payload = b"bid:o-1";
        let signature = keys.sign(payload).await.expect("sign");

        let public: [u8; 32] = keys.public_key().try_into().expect("32 bytes");
        let verifying = VerifyingKey::from_bytes(&public).expect("key");
        let signature = Signature::from_slice(&signature).expect("sig");
        assert!(verifying.verify(payload, &signature).is_ok());
        assert!(keys.address().0.starts_with("lsr1"));
        assert_eq!(keys.address().0.len(), 4 + 40);
    }

    #[test]
    fn short_seed_is_rejected() {
        let err = Ed25519KeyManager::from_hex_seed("abcd").expect_err("short");
        assert!(matches!(err, LessorError::Validation(_)));
    }

    #[tokio::test]
    async fn mocked_key_manager_is_used_for_tx_signatures() {
        let mut keys = MockKeyManager::new();
        keys.expect_address()
            .returning(|| ProviderAddress("lsr1mock".into()));
        keys.expect_public_key().returning(|| vec![1, 2, 3]);
        keys.expect_sign()
            .times(1)
            .returning(|_| Ok(vec![9, 9]));

        let chain = Arc::new(crate::testing::ScriptedChain::default());
        chain.set_sequence(41).await;
        let signer = TxSigner::new(Arc::new(keys), chain, "lessor-test", Duration::from_secs(1));

        let tx = signer.sign(Vec::new(), "").await.expect("sign");
        assert_eq!(tx.body.sequence, 41);
        assert_eq!(tx.signature, STANDARD.encode([9u8, 9]));
    }
}
