//! Signer attribution via ECDSA public key recovery.
//!
//! A compact signature together with its sighash determines a small set
//! of candidate public keys; matching them against the known cosigner
//! set identifies who produced the signature without any out-of-band
//! labelling.

use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1};

/// Resolves which of `candidates` produced `signature` over `sighash`.
/// Returns `None` when recovery fails for every recovery id or when no
/// recovered key is among the candidates.
pub trait PubkeyRecovery: Send + Sync {
    fn recover(
        &self,
        sighash: &[u8; 32],
        signature: &ecdsa::Signature,
        candidates: &[PublicKey],
    ) -> Option<PublicKey>;
}

/// Recovery backed by libsecp256k1. Plain DER signatures carry no
/// recovery id, so all four are tried against the candidate set.
pub struct SecpRecovery {
    secp: Secp256k1<bitcoin::secp256k1::All>,
}

impl SecpRecovery {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Default for SecpRecovery {
    fn default() -> Self {
        Self::new()
    }
}

impl PubkeyRecovery for SecpRecovery {
    fn recover(
        &self,
        sighash: &[u8; 32],
        signature: &ecdsa::Signature,
        candidates: &[PublicKey],
    ) -> Option<PublicKey> {
        let message = Message::from_digest(*sighash);
        let compact = signature.serialize_compact();
        for id in 0..=3 {
            let Ok(rec_id) = RecoveryId::from_i32(id) else {
                continue;
            };
            let Ok(rec_sig) = RecoverableSignature::from_compact(&compact, rec_id) else {
                continue;
            };
            if let Ok(recovered) = self.secp.recover_ecdsa(&message, &rec_sig) {
                if candidates.contains(&recovered) {
                    return Some(recovered);
                }
            }
        }
        None
    }
}
