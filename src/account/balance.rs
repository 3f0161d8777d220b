//! Unconfirmed balance resolution
//!
//! The spendable balance of an account is the confirmed balance owned by
//! storage plus a delta recomputed from the full unconfirmed transaction
//! set. The resolver detects double spends: a transaction that spends an
//! output already claimed by a later-sorted transaction, or that descends
//! from an invalidated transaction, contributes nothing and is reported in
//! [`Resolution::invalid`].

use std::collections::{HashMap, HashSet};

use bitcoin::{OutPoint, Script, Txid};

use crate::storage::TxRecord;

/// Outcome of one resolution pass.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Net unconfirmed contribution to the account balance, in satoshi.
    pub delta: i64,
    /// Hashes of transactions invalidated as conflicts/double spends.
    pub invalid: HashSet<Txid>,
}

/// Resolve the unconfirmed set. `records` must be in ascending natural
/// order; the scan runs in reverse so that the latest transaction claims
/// a contested output and every earlier conflicting one is invalidated.
/// `owned` decides whether an output script pays this account.
///
/// Pure function of its inputs; no stored state is read or written.
pub fn resolve_unconfirmed(records: &[TxRecord], owned: &dyn Fn(&Script) -> bool) -> Resolution {
    let mut invalid: HashSet<Txid> = HashSet::new();
    let mut spent: HashSet<OutPoint> = HashSet::new();
    let mut unspent_owned: HashMap<OutPoint, u64> = HashMap::new();
    let mut delta: i64 = 0;

    for record in records.iter().rev() {
        let txid = record.txid();
        let spends: HashSet<OutPoint> = record
            .tx
            .input
            .iter()
            .map(|i| i.previous_output)
            .collect();
        let prev_hashes: HashSet<Txid> = spends.iter().map(|o| o.txid).collect();

        let conflicting = !spends.is_disjoint(&spent) || !prev_hashes.is_disjoint(&invalid);
        if record.is_unconfirmed() && conflicting {
            // Double spend: this transaction counts for nothing and its
            // own spends are not recorded.
            invalid.insert(txid);
            continue;
        }

        spent.extend(spends);
        for (vout, out) in record.tx.output.iter().enumerate() {
            if owned(&out.script_pubkey) {
                let value = out.value.to_sat();
                unspent_owned.insert(OutPoint::new(txid, vout as u32), value);
                delta += value as i64;
            }
        }
    }

    // Reconcile: receipts consumed within the same unconfirmed batch net
    // out to zero.
    for (outpoint, value) in &unspent_owned {
        if spent.contains(outpoint) {
            delta -= *value as i64;
        }
    }

    Resolution { delta, invalid }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
    };
    use chrono::{TimeZone, Utc};

    fn owned_script(tag: u8) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![0x76, 0xa9, tag])
    }

    fn foreign_script() -> ScriptBuf {
        ScriptBuf::from_bytes(vec![0x51])
    }

    fn tx(ins: Vec<OutPoint>, outs: Vec<(ScriptBuf, u64)>) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: ins
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: outs
                .into_iter()
                .map(|(script_pubkey, value)| TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey,
                })
                .collect(),
        }
    }

    fn record(tx: Transaction, order: i64) -> TxRecord {
        TxRecord {
            tx,
            height: None,
            seen_at: Utc.timestamp_opt(1_700_000_000 + order, 0).unwrap(),
        }
    }

    fn external_outpoint(n: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([n; 32]), 0)
    }

    #[test]
    fn test_simple_receive_counts() {
        let receive = tx(
            vec![external_outpoint(1)],
            vec![(owned_script(1), 50_000), (foreign_script(), 10_000)],
        );
        let records = vec![record(receive, 0)];

        let resolution = resolve_unconfirmed(&records, &|s| s.as_bytes()[0] == 0x76);
        assert_eq!(resolution.delta, 50_000);
        assert!(resolution.invalid.is_empty());
    }

    #[test]
    fn test_double_spend_is_invalidated() {
        // Two unconfirmed transactions spending the same prior output.
        // The sort-later one wins; the earlier one is invalid and its
        // outputs never count.
        let contested = external_outpoint(7);
        let loser = tx(vec![contested], vec![(owned_script(1), 80_000)]);
        let winner = tx(vec![contested], vec![(owned_script(2), 30_000)]);
        let loser_txid = loser.compute_txid();

        let records = vec![record(loser, 0), record(winner, 1)];
        let resolution = resolve_unconfirmed(&records, &|s| s.as_bytes()[0] == 0x76);

        assert_eq!(resolution.delta, 30_000);
        assert_eq!(resolution.invalid.len(), 1);
        assert!(resolution.invalid.contains(&loser_txid));
    }

    #[test]
    fn test_descendant_of_invalid_is_invalid() {
        let contested = external_outpoint(9);
        let loser = tx(vec![contested], vec![(owned_script(1), 80_000)]);
        let loser_txid = loser.compute_txid();
        // Spends the loser's output, so it descends from an invalid tx.
        let child = tx(
            vec![OutPoint::new(loser_txid, 0)],
            vec![(owned_script(2), 70_000)],
        );
        let child_txid = child.compute_txid();
        let winner = tx(vec![contested], vec![(foreign_script(), 30_000)]);

        // Reverse scan order: winner claims the outpoint, loser becomes
        // invalid, and the child (sorting before its parent) is caught
        // by the invalid-parent rule.
        let records = vec![record(child, 0), record(loser, 1), record(winner, 2)];
        let resolution = resolve_unconfirmed(&records, &|s| s.as_bytes()[0] == 0x76);

        assert_eq!(resolution.delta, 0);
        assert!(resolution.invalid.contains(&loser_txid));
        assert!(resolution.invalid.contains(&child_txid));
    }

    #[test]
    fn test_receive_then_respend_nets_zero() {
        // Unconfirmed receive of 40k at O, followed by an unconfirmed
        // spend of O to a foreign address. The receive's contribution
        // reconciles away.
        let receive = tx(vec![external_outpoint(3)], vec![(owned_script(1), 40_000)]);
        let receive_txid = receive.compute_txid();
        let spend = tx(
            vec![OutPoint::new(receive_txid, 0)],
            vec![(foreign_script(), 39_000)],
        );

        let records = vec![record(receive, 0), record(spend, 1)];
        let resolution = resolve_unconfirmed(&records, &|s| s.as_bytes()[0] == 0x76);

        assert_eq!(resolution.delta, 0);
        assert!(resolution.invalid.is_empty());
    }

    #[test]
    fn test_respend_with_owned_change_keeps_change() {
        let receive = tx(vec![external_outpoint(4)], vec![(owned_script(1), 40_000)]);
        let receive_txid = receive.compute_txid();
        let spend = tx(
            vec![OutPoint::new(receive_txid, 0)],
            vec![(foreign_script(), 25_000), (owned_script(2), 14_000)],
        );

        let records = vec![record(receive, 0), record(spend, 1)];
        let resolution = resolve_unconfirmed(&records, &|s| s.as_bytes()[0] == 0x76);

        // 40k received, 40k re-spent, 14k change retained.
        assert_eq!(resolution.delta, 14_000);
    }

    #[test]
    fn test_confirmed_record_is_never_invalidated() {
        let contested = external_outpoint(5);
        let confirmed = tx(vec![contested], vec![(owned_script(1), 20_000)]);
        let mut confirmed_record = record(confirmed, 1);
        confirmed_record.height = Some(100);
        let unconfirmed = tx(vec![contested], vec![(owned_script(2), 15_000)]);

        // The unconfirmed one sorts earlier, so the confirmed record is
        // processed (and claims the outpoint) first.
        let records = vec![record(unconfirmed, 0), confirmed_record];
        let resolution = resolve_unconfirmed(&records, &|s| s.as_bytes()[0] == 0x76);

        assert_eq!(resolution.delta, 20_000);
        assert_eq!(resolution.invalid.len(), 1);
    }
}
