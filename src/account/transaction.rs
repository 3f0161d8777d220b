//! Legacy transaction construction and signature plumbing
//!
//! Builds unsigned P2PKH spends from the account's unspent outputs and
//! carries the small script helpers shared with the multisig pool:
//! script_sig assembly, signed-state detection, and input signature
//! verification.

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::error::AccountError;
use crate::storage::Utxo;

// Worst-case legacy sizes: 148 bytes per P2PKH input, 34 per output,
// 10 bytes of framing.
const INPUT_SIZE: usize = 148;
const OUTPUT_SIZE: usize = 34;
const OVERHEAD_SIZE: usize = 10;

/// Fee for a legacy transaction shape at `fee_per_kb`, rounded up to the
/// next kilobyte.
pub fn estimate_fee(inputs: usize, outputs: usize, fee_per_kb: u64) -> u64 {
    let size = (OVERHEAD_SIZE + inputs * INPUT_SIZE + outputs * OUTPUT_SIZE) as u64;
    fee_per_kb * size.div_ceil(1000)
}

/// Build an unsigned transaction paying `recipients`, selecting inputs
/// first-fit from `utxos` (confirmed outputs first) and directing change
/// to `change_address`. Change below `dust_limit` is folded into the fee.
pub fn build_unsigned(
    utxos: &[Utxo],
    recipients: &[(Address, u64)],
    change_address: &Address,
    fee_per_kb: u64,
    dust_limit: u64,
) -> Result<(Transaction, Vec<OutPoint>), AccountError> {
    if recipients.is_empty() {
        return Err(AccountError::InvalidInput("no recipients".to_string()));
    }
    if recipients.iter().any(|(_, amount)| *amount == 0) {
        return Err(AccountError::InvalidInput(
            "zero-value recipient".to_string(),
        ));
    }

    let total_out: u64 = recipients.iter().map(|(_, amount)| amount).sum();

    // Confirmed outputs first, largest first within each group, so
    // unconfirmed coins are only touched when unavoidable.
    let mut candidates: Vec<&Utxo> = utxos.iter().collect();
    candidates.sort_by_key(|u| (!u.confirmed, std::cmp::Reverse(u.value)));

    let mut selected: Vec<&Utxo> = Vec::new();
    let mut total_in: u64 = 0;
    let mut fee = 0;
    for utxo in candidates {
        selected.push(utxo);
        total_in += utxo.value;
        fee = estimate_fee(selected.len(), recipients.len() + 1, fee_per_kb);
        if total_in >= total_out + fee {
            break;
        }
    }

    if total_in < total_out + fee {
        return Err(AccountError::InsufficientFunds(format!(
            "available {} sats, needed {} sats (including {} sats fee)",
            total_in,
            total_out + fee,
            fee
        )));
    }

    let mut output: Vec<TxOut> = recipients
        .iter()
        .map(|(address, amount)| TxOut {
            value: Amount::from_sat(*amount),
            script_pubkey: address.script_pubkey(),
        })
        .collect();

    let change = total_in - total_out - fee;
    if change >= dust_limit {
        output.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_address.script_pubkey(),
        });
    }

    let input: Vec<TxIn> = selected
        .iter()
        .map(|utxo| TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        })
        .collect();
    let selected_outpoints = selected.iter().map(|u| u.outpoint).collect();

    log::debug!(
        "built unsigned tx: {} inputs, {} outputs, fee {} sats, change {} sats",
        input.len(),
        output.len(),
        fee,
        change
    );

    Ok((
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input,
            output,
        },
        selected_outpoints,
    ))
}

/// Canonical SIGHASH_ALL signing hash for one input, with `script_code`
/// being the spent script_pubkey (P2PKH) or the redeem script (P2SH).
pub fn legacy_sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
) -> Result<[u8; 32], AccountError> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(input_index, script_code, EcdsaSighashType::All.to_u32())
        .map_err(|e| AccountError::Bitcoin(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

/// DER-encode a signature and append the SIGHASH_ALL flag, as pushed in
/// unlocking scripts.
pub fn encode_signature(signature: &ecdsa::Signature) -> Result<PushBytesBuf, AccountError> {
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);
    PushBytesBuf::try_from(bytes).map_err(|e| AccountError::Bitcoin(e.to_string()))
}

/// Single-key unlocking script: `<sig+hashtype> <pubkey>`.
pub fn p2pkh_script_sig(
    signature: &ecdsa::Signature,
    pub_key: &PublicKey,
) -> Result<ScriptBuf, AccountError> {
    Ok(Builder::new()
        .push_slice(encode_signature(signature)?)
        .push_slice(pub_key.serialize())
        .into_script())
}

/// True once any input carries an unlocking script or witness.
pub fn is_signed(tx: &Transaction) -> bool {
    tx.input
        .iter()
        .any(|input| !input.script_sig.is_empty() || !input.witness.is_empty())
}

/// Verify every input's P2PKH signature against the script_pubkey it
/// spends. The script_sig is parsed back out of the transaction so that
/// what is checked is exactly what would be broadcast.
pub fn verify_p2pkh_signatures(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    spent_scripts: &[ScriptBuf],
) -> Result<(), AccountError> {
    if spent_scripts.len() != tx.input.len() {
        return Err(AccountError::Consistency(format!(
            "{} spent scripts for {} inputs",
            spent_scripts.len(),
            tx.input.len()
        )));
    }

    for (index, input) in tx.input.iter().enumerate() {
        let (signature, pub_key) = parse_p2pkh_script_sig(&input.script_sig)?;
        let sighash = legacy_sighash(tx, index, &spent_scripts[index])?;
        let message = Message::from_digest(sighash);
        secp.verify_ecdsa(&message, &signature, &pub_key)
            .map_err(|e| AccountError::Verification(format!("input {}: {}", index, e)))?;
    }
    Ok(())
}

fn parse_p2pkh_script_sig(
    script_sig: &Script,
) -> Result<(ecdsa::Signature, PublicKey), AccountError> {
    let mut pushes = Vec::with_capacity(2);
    for instruction in script_sig.instructions() {
        match instruction.map_err(|e| AccountError::Bitcoin(e.to_string()))? {
            Instruction::PushBytes(bytes) => pushes.push(bytes.as_bytes().to_vec()),
            Instruction::Op(_) => {
                return Err(AccountError::Verification(
                    "unexpected opcode in script_sig".to_string(),
                ))
            }
        }
    }
    if pushes.len() != 2 {
        return Err(AccountError::Verification(
            "script_sig is not signature + pubkey".to_string(),
        ));
    }
    let sig_bytes = &pushes[0];
    if sig_bytes.is_empty() {
        return Err(AccountError::Verification("empty signature".to_string()));
    }
    // Strip the trailing sighash flag before DER decoding.
    let signature = ecdsa::Signature::from_der(&sig_bytes[..sig_bytes.len() - 1])
        .map_err(|e| AccountError::Verification(e.to_string()))?;
    let pub_key =
        PublicKey::from_slice(&pushes[1]).map_err(|e| AccountError::Verification(e.to_string()))?;
    Ok((signature, pub_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::keys::KeyChain;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::rand;
    use bitcoin::{Network, Txid};
    use std::str::FromStr;

    fn utxo(n: u8, value: u64, confirmed: bool) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            value,
            address: format!("addr-{}", n),
            chain: KeyChain::External,
            index: n as u32,
            confirmed,
        }
    }

    fn any_address() -> Address {
        let secp = Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());
        Address::p2pkh(bitcoin::PublicKey::new(pk).pubkey_hash(), Network::Bitcoin)
    }

    #[test]
    fn test_build_selects_confirmed_first() {
        let utxos = vec![
            utxo(1, 100_000, false),
            utxo(2, 100_000, true),
            utxo(3, 2_000, true),
        ];
        let change = any_address();
        let (tx, selected) =
            build_unsigned(&utxos, &[(any_address(), 50_000)], &change, 10_000, 546).unwrap();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(selected[0], utxos[1].outpoint);
        // recipient + change
        assert_eq!(tx.output.len(), 2);
        let fee = estimate_fee(1, 2, 10_000);
        assert_eq!(tx.output[1].value.to_sat(), 100_000 - 50_000 - fee);
    }

    #[test]
    fn test_build_insufficient_funds() {
        let utxos = vec![utxo(1, 10_000, true)];
        let change = any_address();
        let result = build_unsigned(&utxos, &[(any_address(), 50_000)], &change, 10_000, 546);
        assert!(matches!(result, Err(AccountError::InsufficientFunds(_))));
    }

    #[test]
    fn test_build_rejects_bad_recipients() {
        let utxos = vec![utxo(1, 100_000, true)];
        let change = any_address();
        assert!(matches!(
            build_unsigned(&utxos, &[], &change, 10_000, 546),
            Err(AccountError::InvalidInput(_))
        ));
        assert!(matches!(
            build_unsigned(&utxos, &[(any_address(), 0)], &change, 10_000, 546),
            Err(AccountError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dust_change_is_folded_into_fee() {
        // 60_000 in, 49_800 out, 10_000 fee leaves 200 sats of change:
        // below dust, so only the recipient output remains.
        let utxos = vec![utxo(1, 60_000, true)];
        let change = any_address();
        let (tx, _) =
            build_unsigned(&utxos, &[(any_address(), 49_800)], &change, 10_000, 546).unwrap();
        assert_eq!(tx.output.len(), 1);
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let spent_script = Address::p2pkh(
            bitcoin::PublicKey::new(pk).pubkey_hash(),
            Network::Bitcoin,
        )
        .script_pubkey();

        let utxos = vec![utxo(1, 100_000, true)];
        let change = any_address();
        let (mut tx, _) =
            build_unsigned(&utxos, &[(any_address(), 50_000)], &change, 10_000, 546).unwrap();

        let sighash = legacy_sighash(&tx, 0, &spent_script).unwrap();
        let signature = secp.sign_ecdsa(&Message::from_digest(sighash), &sk);
        tx.input[0].script_sig = p2pkh_script_sig(&signature, &pk).unwrap();

        assert!(is_signed(&tx));
        verify_p2pkh_signatures(&secp, &tx, &[spent_script]).unwrap();

        // A different key's script must fail verification.
        let (_, other_pk) = secp.generate_keypair(&mut rand::thread_rng());
        tx.input[0].script_sig = p2pkh_script_sig(&signature, &other_pk).unwrap();
        let spent = Address::p2pkh(
            bitcoin::PublicKey::new(other_pk).pubkey_hash(),
            Network::Bitcoin,
        )
        .script_pubkey();
        assert!(verify_p2pkh_signatures(&secp, &tx, &[spent]).is_err());
    }

    #[test]
    fn test_fee_rounds_up_per_kb() {
        assert_eq!(estimate_fee(1, 2, 10_000), 10_000);
        // 7 inputs push the size past one kilobyte.
        assert!(estimate_fee(7, 2, 10_000) >= 20_000);
    }

    #[test]
    fn test_address_parse_helper() {
        // Sanity check that the address type used throughout round-trips.
        let addr = any_address();
        let parsed = Address::from_str(&addr.to_string())
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap();
        assert_eq!(parsed, addr);
    }
}
