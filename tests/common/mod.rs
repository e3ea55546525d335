//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use atomicals_consensus::{
    verify_script_avm_with_limits, AtomicalRef, FinalizedState, ScriptFailure, StateLimits,
    VerifyRequest, ATOMICAL_REF_SIZE,
};
use bitcoin::absolute::LockTime;
use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use ciborium::value::Value;

pub fn atomref(fill: u8) -> AtomicalRef {
    AtomicalRef::from_slice(&[fill; ATOMICAL_REF_SIZE]).unwrap()
}

pub fn cbor(value: &Value) -> Vec<u8> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer).unwrap();
    buffer
}

pub fn decode_cbor(bytes: &[u8]) -> Value {
    ciborium::de::from_reader(bytes).unwrap()
}

/// Looks up a text key in a CBOR map value.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let Value::Map(entries) = value else {
        return None;
    };
    entries.iter().find_map(|(k, v)| match k {
        Value::Text(text) if text == key => Some(v),
        _ => None,
    })
}

pub fn map_len(value: &Value) -> usize {
    match value {
        Value::Map(entries) => entries.len(),
        _ => panic!("expected a CBOR map"),
    }
}

pub fn ft_doc(entries: &[(AtomicalRef, u64)]) -> Vec<u8> {
    let map = entries
        .iter()
        .map(|(atomref, amount)| {
            (
                Value::Text(atomref.to_hex()),
                Value::Integer((*amount).into()),
            )
        })
        .collect();
    cbor(&Value::Map(map))
}

pub fn nft_doc(entries: &[AtomicalRef]) -> Vec<u8> {
    let map = entries
        .iter()
        .map(|atomref| (Value::Text(atomref.to_hex()), Value::Bool(true)))
        .collect();
    cbor(&Value::Map(map))
}

pub fn external_doc(height: u64, headers: &[(u32, String)]) -> Vec<u8> {
    let header_map = headers
        .iter()
        .map(|(h, hex)| (Value::Text(h.to_string()), Value::Text(hex.clone())))
        .collect();
    cbor(&Value::Map(vec![
        (Value::Text("height".into()), Value::Integer(height.into())),
        (Value::Text("headers".into()), Value::Map(header_map)),
    ]))
}

/// Owns every input buffer of one invocation and runs the verifier over it.
pub struct Fixture {
    pub tx: Transaction,
    pub auth_pubkey: Option<Vec<u8>>,
    pub ft_state: Vec<u8>,
    pub ft_state_incoming: Vec<u8>,
    pub nft_state: Vec<u8>,
    pub nft_state_incoming: Vec<u8>,
    pub contract_state: Vec<u8>,
    pub contract_external_state: Vec<u8>,
    pub prev_state_hash: [u8; 32],
    pub flags: u32,
    pub limits: StateLimits,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            tx: transaction_with_outputs(vec![(1000, Vec::new())]),
            auth_pubkey: None,
            ft_state: Vec::new(),
            ft_state_incoming: Vec::new(),
            nft_state: Vec::new(),
            nft_state_incoming: Vec::new(),
            contract_state: Vec::new(),
            contract_external_state: external_doc(0, &[]),
            prev_state_hash: [0u8; 32],
            flags: 0,
            limits: StateLimits::default(),
        }
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outputs(outputs: Vec<(u64, Vec<u8>)>) -> Self {
        Self {
            tx: transaction_with_outputs(outputs),
            ..Self::default()
        }
    }

    pub fn run(&self, unlock: &[u8], lock: &[u8]) -> Result<FinalizedState, ScriptFailure> {
        let tx_to = consensus::serialize(&self.tx);
        let request = VerifyRequest {
            lock_script: lock,
            unlock_script: unlock,
            tx_to: &tx_to,
            auth_pubkey: self.auth_pubkey.as_deref(),
            ft_state: &self.ft_state,
            ft_state_incoming: &self.ft_state_incoming,
            nft_state: &self.nft_state,
            nft_state_incoming: &self.nft_state_incoming,
            contract_state: &self.contract_state,
            contract_external_state: &self.contract_external_state,
            prev_state_hash: self.prev_state_hash,
            flags: self.flags,
        };
        verify_script_avm_with_limits(&request, self.limits)
    }
}

pub fn transaction_with_outputs(outputs: Vec<(u64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: bitcoin::Txid::from_byte_array([0x42; 32]),
                vout: 1,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .into_iter()
            .map(|(value, script)| TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(script),
            })
            .collect(),
    }
}
