//! Per-invocation execution context.
//!
//! Read-only data shared by every opcode of one invocation: the transaction
//! view, the concatenated unlock-then-lock script bytes and the optional
//! authorization public key supplied by the host. The authorization
//! signature itself travels out-of-band in a dedicated `OP_RETURN` output.

use bitcoin::hashes::Hash;

use crate::script::next_instruction;
use crate::script::opcodes::{OP_PUSHDATA4, OP_RETURN};
use crate::tx::TxView;

/// Read-only context for one script invocation.
pub struct ExecutionContext<'tx> {
    tx: &'tx TxView,
    full_script: Vec<u8>,
    auth_pubkey: Option<Vec<u8>>,
}

impl<'tx> ExecutionContext<'tx> {
    pub fn new(
        tx: &'tx TxView,
        unlock_script: &[u8],
        lock_script: &[u8],
        auth_pubkey: Option<&[u8]>,
    ) -> Self {
        let mut full_script = Vec::with_capacity(unlock_script.len() + lock_script.len());
        full_script.extend_from_slice(unlock_script);
        full_script.extend_from_slice(lock_script);

        Self {
            tx,
            full_script,
            auth_pubkey: auth_pubkey.filter(|key| !key.is_empty()).map(<[u8]>::to_vec),
        }
    }

    pub fn tx(&self) -> &'tx TxView {
        self.tx
    }

    pub fn auth_pubkey(&self) -> Option<&[u8]> {
        self.auth_pubkey.as_deref()
    }

    /// Scans the outputs for a sig-OP_RETURN script and returns its payload.
    pub fn auth_signature(&self) -> Option<Vec<u8>> {
        self.tx
            .outputs()
            .iter()
            .find_map(|output| sig_op_return_payload(output.script_pubkey.as_bytes()))
    }

    /// Derives the byte sequence signed by the authorization key:
    /// `prev_txid || prev_vout_le32 || unlock || lock` followed by
    /// `value_le64 || script` for every output that is not a sig-OP_RETURN
    /// carrier.
    pub fn auth_message(&self) -> Vec<u8> {
        let input = self
            .tx
            .input(0)
            .expect("invocation transactions have at least one input");

        let mut message = Vec::new();
        message.extend_from_slice(&input.previous_output.txid.to_byte_array());
        message.extend_from_slice(&input.previous_output.vout.to_le_bytes());
        message.extend_from_slice(&self.full_script);

        for output in self.tx.outputs() {
            let script = output.script_pubkey.as_bytes();
            if sig_op_return_payload(script).is_some() {
                continue;
            }
            message.extend_from_slice(&output.value.to_sat().to_le_bytes());
            message.extend_from_slice(script);
        }
        message
    }
}

/// Extracts the payload of a sig-OP_RETURN locking script:
/// `OP_RETURN 0x03 's' 'i' 'g' <push>`.
pub fn sig_op_return_payload(script: &[u8]) -> Option<Vec<u8>> {
    if script.len() < 5 || script[0] != OP_RETURN {
        return None;
    }
    if script[1] != 0x03 || &script[2..5] != b"sig" {
        return None;
    }

    let mut cursor = 5usize;
    let instruction = next_instruction(script, &mut cursor).ok()?;
    if instruction.opcode > OP_PUSHDATA4 {
        return None;
    }
    instruction.push.map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptBuilder;
    use bitcoin::absolute::LockTime;
    use bitcoin::consensus;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

    fn sig_output_script(payload: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_RETURN];
        script.extend_from_slice(&ScriptBuilder::new().push_slice(b"sig").into_bytes());
        script.extend_from_slice(&ScriptBuilder::new().push_slice(payload).into_bytes());
        script
    }

    fn view_with_outputs(outputs: Vec<TxOut>) -> TxView {
        let tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: bitcoin::Txid::from_byte_array([9u8; 32]),
                    vout: 1,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs,
        };
        TxView::parse(&consensus::serialize(&tx)).unwrap()
    }

    #[test]
    fn sig_op_return_payload_extraction() {
        let script = sig_output_script(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            sig_op_return_payload(&script),
            Some(vec![0xde, 0xad, 0xbe, 0xef])
        );

        assert_eq!(sig_op_return_payload(&[OP_RETURN]), None);
        let wrong_marker = {
            let mut s = vec![OP_RETURN];
            s.extend_from_slice(&ScriptBuilder::new().push_slice(b"sip").into_bytes());
            s.extend_from_slice(&ScriptBuilder::new().push_slice(&[1]).into_bytes());
            s
        };
        assert_eq!(sig_op_return_payload(&wrong_marker), None);
    }

    #[test]
    fn auth_message_skips_sig_outputs() {
        let pay_script = vec![0x51];
        let view = view_with_outputs(vec![
            TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: ScriptBuf::from_bytes(pay_script.clone()),
            },
            TxOut {
                value: Amount::from_sat(0),
                script_pubkey: ScriptBuf::from_bytes(sig_output_script(&[0xaa; 70])),
            },
        ]);

        let context = ExecutionContext::new(&view, &[0x51], &[0x52], None);
        let message = context.auth_message();

        let mut expected = Vec::new();
        expected.extend_from_slice(&[9u8; 32]);
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&[0x51, 0x52]);
        expected.extend_from_slice(&1000u64.to_le_bytes());
        expected.extend_from_slice(&pay_script);
        assert_eq!(message, expected);
    }

    #[test]
    fn auth_signature_found_in_any_output() {
        let view = view_with_outputs(vec![
            TxOut {
                value: Amount::from_sat(5),
                script_pubkey: ScriptBuf::new(),
            },
            TxOut {
                value: Amount::from_sat(0),
                script_pubkey: ScriptBuf::from_bytes(sig_output_script(&[0x01, 0x02])),
            },
        ]);
        let context = ExecutionContext::new(&view, &[], &[], None);
        assert_eq!(context.auth_signature(), Some(vec![0x01, 0x02]));
    }

    #[test]
    fn empty_auth_pubkey_counts_as_absent() {
        let view = view_with_outputs(vec![]);
        let context = ExecutionContext::new(&view, &[], &[], Some(&[]));
        assert!(context.auth_pubkey().is_none());
    }
}
