//! Threshold multisig signature pool
//!
//! Collects per-cosigner signature batches for an unsigned P2SH
//! multisig spend, attributes each batch to a cosigner by public key
//! recovery, and assembles the final unlocking scripts once the
//! threshold is reached.

pub mod recovery;

use std::sync::Mutex;

use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::opcodes::OP_0;
use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1};
use bitcoin::{ScriptBuf, Transaction};

use crate::account::transaction::{encode_signature, is_signed, legacy_sighash};
use crate::error::AccountError;

pub use recovery::{PubkeyRecovery, SecpRecovery};

/// Gathers signatures for one m-of-n P2SH multisig spend.
///
/// The pool holds the unsigned transaction and the ordered cosigner
/// public key set; submitted batches are attributed by recovering the
/// signer from the first input's signature. Cosigner order is fixed by
/// `pubs` and determines both the redeem script layout and the
/// signature order in the final scripts.
pub struct SignaturePool {
    tx: Transaction,
    threshold: usize,
    pubs: Vec<PublicKey>,
    redeem_script: ScriptBuf,
    recovery: Box<dyn PubkeyRecovery>,
    secp: Secp256k1<All>,
    // One slot per cosigner; a filled slot carries one signature per input.
    slots: Mutex<Vec<Option<Vec<ecdsa::Signature>>>>,
}

impl SignaturePool {
    /// Create a pool over an unsigned transaction.
    ///
    /// # Panics
    ///
    /// Panics when `tx` already carries signatures, when `threshold`
    /// is zero, or when fewer than `threshold` cosigners are given.
    pub fn new(
        tx: Transaction,
        threshold: usize,
        pubs: Vec<PublicKey>,
        recovery: Box<dyn PubkeyRecovery>,
    ) -> Self {
        assert!(!is_signed(&tx), "pool requires an unsigned transaction");
        assert!(threshold > 0, "threshold must be positive");
        assert!(
            pubs.len() >= threshold,
            "need at least {} cosigners, got {}",
            threshold,
            pubs.len()
        );

        let redeem_script = multisig_redeem_script(threshold, &pubs);
        log::debug!(
            "pool over {}-of-{} redeem script {}",
            threshold,
            pubs.len(),
            hex::encode(redeem_script.as_bytes())
        );
        let slot_count = pubs.len();
        Self {
            tx,
            threshold,
            pubs,
            redeem_script,
            recovery,
            secp: Secp256k1::new(),
            slots: Mutex::new(vec![None; slot_count]),
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Option<Vec<ecdsa::Signature>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn redeem_script(&self) -> &ScriptBuf {
        &self.redeem_script
    }

    /// Per-input sighashes each cosigner must sign, in input order.
    pub fn unsigned_hashes(&self) -> Result<Vec<[u8; 32]>, AccountError> {
        let mut hashes = Vec::with_capacity(self.tx.input.len());
        for index in 0..self.tx.input.len() {
            hashes.push(legacy_sighash(&self.tx, index, &self.redeem_script)?);
        }
        Ok(hashes)
    }

    /// Submit one cosigner's batch: one DER signature per input, in
    /// input order. Returns `false` without touching pool state when the
    /// batch length is wrong, any signature fails to decode, or the
    /// signer cannot be attributed to a known cosigner. A cosigner
    /// resubmitting replaces their earlier batch.
    pub fn add_signature(&self, batch: &[Vec<u8>]) -> Result<bool, AccountError> {
        // Attribution needs a first input to recover against.
        if batch.is_empty() || batch.len() != self.tx.input.len() {
            log::warn!(
                "rejected batch of {} signatures for {} inputs",
                batch.len(),
                self.tx.input.len()
            );
            return Ok(false);
        }

        let mut decoded = Vec::with_capacity(batch.len());
        for bytes in batch {
            match ecdsa::Signature::from_der(bytes) {
                Ok(signature) => decoded.push(signature),
                Err(_) => {
                    log::warn!(
                        "rejected batch with undecodable signature: {}",
                        hex::encode(bytes)
                    );
                    return Ok(false);
                }
            }
        }

        let hashes = self.unsigned_hashes()?;
        let Some(signer) = self
            .recovery
            .recover(&hashes[0], &decoded[0], &self.pubs)
        else {
            log::warn!("rejected batch from unknown signer");
            return Ok(false);
        };
        // Attribution only proves the first input; the rest are checked
        // during assembly.
        let position = match self.pubs.iter().position(|p| *p == signer) {
            Some(position) => position,
            None => return Ok(false),
        };

        let mut slots = self.lock_slots();
        slots[position] = Some(decoded);
        log::debug!("accepted signature batch from cosigner {}", position);
        Ok(true)
    }

    /// Number of cosigners that have submitted a batch.
    pub fn signature_count(&self) -> usize {
        self.lock_slots().iter().filter(|s| s.is_some()).count()
    }

    /// Indexes of cosigners whose batch is present, ascending.
    pub fn signer_indexes(&self) -> Vec<usize> {
        self.lock_slots()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    pub fn satisfied(&self) -> bool {
        self.signature_count() >= self.threshold
    }

    /// Assemble the final transaction from every collected batch, in
    /// ascending cosigner order. Every used signature is verified
    /// against its sighash first; returns `None` when any check fails.
    ///
    /// # Panics
    ///
    /// Panics when called before [`SignaturePool::satisfied`] is true.
    pub fn sign(&self) -> Result<Option<Transaction>, AccountError> {
        assert!(self.satisfied(), "pool below threshold");

        let hashes = self.unsigned_hashes()?;
        let slots = self.lock_slots();
        let chosen: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();

        for &cosigner in &chosen {
            let batch = slots[cosigner].as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
            for (hash, signature) in hashes.iter().zip(batch) {
                let message = Message::from_digest(*hash);
                if self
                    .secp
                    .verify_ecdsa(&message, signature, &self.pubs[cosigner])
                    .is_err()
                {
                    log::warn!("cosigner {} signature failed verification", cosigner);
                    return Ok(None);
                }
            }
        }

        let redeem_bytes = PushBytesBuf::try_from(self.redeem_script.to_bytes())
            .map_err(|e| AccountError::Bitcoin(e.to_string()))?;

        let mut tx = self.tx.clone();
        for (index, input) in tx.input.iter_mut().enumerate() {
            // Leading OP_0 absorbs the off-by-one in OP_CHECKMULTISIG.
            let mut builder = Builder::new().push_opcode(OP_0);
            for &cosigner in &chosen {
                if let Some(batch) = slots[cosigner].as_ref() {
                    builder = builder.push_slice(encode_signature(&batch[index])?);
                }
            }
            input.script_sig = builder.push_slice(&redeem_bytes).into_script();
        }
        Ok(Some(tx))
    }
}

/// Standard `m <pubkeys> n OP_CHECKMULTISIG` redeem script with keys in
/// the given cosigner order.
pub fn multisig_redeem_script(threshold: usize, pubs: &[PublicKey]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(threshold as i64);
    for pub_key in pubs {
        builder = builder.push_slice(pub_key.serialize());
    }
    builder
        .push_int(pubs.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}
