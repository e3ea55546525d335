//! Per-contract state staging.
//!
//! A [`StateContext`] holds the decoded snapshot of one contract's persisted
//! state for the duration of a single invocation: the key/value store with
//! its update and delete journals, fungible and non-fungible token tables
//! with their incoming pools and withdrawal maps, and the immutable external
//! block-header table. Opcode handlers are the only mutators; the entry
//! point canonicalizes and re-validates the result before returning it.
//!
//! All maps are ordered by raw key bytes, which fixes the canonical
//! digestion order and therefore the state hash.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitcoin::block::Header;
use bitcoin::consensus;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::{DisplayHex, FromHex};
use ciborium::value::Value;

use crate::script::ScriptError;
use crate::Error;

/// Byte length of an atomical reference.
pub const ATOMICAL_REF_SIZE: usize = 36;
/// Largest block height accepted in the external state document.
pub const MAX_BLOCK_INFO_HEIGHT: u32 = 10_000_000;

/// 288-bit identifier of a fungible-token class or a unique non-fungible
/// token, in stack byte order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AtomicalRef([u8; ATOMICAL_REF_SIZE]);

impl AtomicalRef {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; ATOMICAL_REF_SIZE] = bytes.try_into().ok()?;
        Some(AtomicalRef(array))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != ATOMICAL_REF_SIZE * 2 || !is_lower_hex(hex) {
            return None;
        }
        let bytes = Vec::<u8>::from_hex(hex).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ATOMICAL_REF_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.as_slice().to_lower_hex_string()
    }
}

impl fmt::Display for AtomicalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Host-configured byte budgets for the returned state documents.
///
/// The limits are configuration rather than consensus; byte counts are taken
/// over raw key and value bytes with integer values counted as eight bytes.
#[derive(Debug, Copy, Clone)]
pub struct StateLimits {
    pub max_state_final_bytes: u32,
    pub max_state_update_bytes: u32,
    pub max_balances_bytes: u32,
    pub max_balances_update_bytes: u32,
}

impl Default for StateLimits {
    fn default() -> Self {
        Self {
            max_state_final_bytes: 1_048_576,
            max_state_update_bytes: 262_144,
            max_balances_bytes: 262_144,
            max_balances_update_bytes: 65_536,
        }
    }
}

/// One external block header keyed by height.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub header: Header,
    pub raw: [u8; 80],
    pub height: u32,
}

#[derive(Debug, Clone, Default)]
struct ExternalState {
    current_height: u32,
    headers: BTreeMap<u32, BlockInfo>,
}

type KvMap = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>;
type KvDeleteMap = BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>;

/// The raw CBOR state documents supplied by the host.
#[derive(Debug, Copy, Clone)]
pub struct StateDocuments<'a> {
    pub ft_state: &'a [u8],
    pub ft_state_incoming: &'a [u8],
    pub nft_state: &'a [u8],
    pub nft_state_incoming: &'a [u8],
    pub contract_state: &'a [u8],
    pub contract_external_state: &'a [u8],
}

/// Everything the entry point returns on success: the CBOR documents plus
/// the chained state hash.
#[derive(Debug, Clone)]
pub struct FinalizedState {
    pub state_hash: [u8; 32],
    pub state_final: Vec<u8>,
    pub state_updates: Vec<u8>,
    pub state_deletes: Vec<u8>,
    pub ft_balances: Vec<u8>,
    pub ft_balances_updates: Vec<u8>,
    pub nft_balances: Vec<u8>,
    pub nft_balances_updates: Vec<u8>,
    pub ft_withdraws: Vec<u8>,
    pub nft_withdraws: Vec<u8>,
    pub ft_balances_added: Vec<u8>,
    pub nft_puts: Vec<u8>,
}

/// Staging area for one contract invocation.
#[derive(Debug, Clone, Default)]
pub struct StateContext {
    kv_live: KvMap,
    kv_updates: KvMap,
    kv_deletes: KvDeleteMap,

    ft_live: BTreeMap<AtomicalRef, u64>,
    ft_updates: BTreeMap<AtomicalRef, u64>,
    ft_incoming: BTreeMap<AtomicalRef, u64>,

    nft_live: BTreeSet<AtomicalRef>,
    nft_updates: BTreeMap<AtomicalRef, bool>,
    nft_incoming: BTreeSet<AtomicalRef>,

    ft_added_once: BTreeSet<AtomicalRef>,
    nft_put_once: BTreeSet<AtomicalRef>,

    ft_withdraws: BTreeMap<AtomicalRef, BTreeMap<u32, u64>>,
    nft_withdraws: BTreeMap<AtomicalRef, u32>,

    external: ExternalState,
    limits: StateLimits,
}

impl StateContext {
    /// A context with no prior state and no external headers. Used by unit
    /// tests and by callers that evaluate pure scripts.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Decodes and validates the host's CBOR snapshots.
    pub fn from_documents(docs: StateDocuments<'_>, limits: StateLimits) -> Result<Self, Error> {
        let ft_live = decode_ft_map(docs.ft_state, false)?;
        let ft_incoming = decode_ft_map(docs.ft_state_incoming, false)?;
        let nft_live = decode_nft_map(docs.nft_state, false)?;
        let nft_incoming = decode_nft_map(docs.nft_state_incoming, false)?;
        let kv_live = decode_kv_map(docs.contract_state)?;
        let external = decode_external_state(docs.contract_external_state)?;

        let state = Self {
            kv_live,
            ft_live,
            ft_incoming,
            nft_live,
            nft_incoming,
            external,
            limits,
            ..Self::default()
        };
        state.validate_sizes()?;
        Ok(state)
    }

    //
    // Key/value store
    //

    pub fn kv_get(&self, keyspace: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        self.kv_live
            .get(&canon_bytes(keyspace))
            .and_then(|inner| inner.get(&canon_bytes(key)))
            .cloned()
    }

    pub fn kv_exists(&self, keyspace: &[u8], key: &[u8]) -> bool {
        self.kv_live
            .get(&canon_bytes(keyspace))
            .map(|inner| inner.contains_key(&canon_bytes(key)))
            .unwrap_or(false)
    }

    /// Writes to the live state and the update journal, clearing any delete
    /// marker for the key.
    pub fn kv_put(&mut self, keyspace: &[u8], key: &[u8], value: &[u8]) {
        let keyspace = canon_bytes(keyspace);
        let key = canon_bytes(key);
        let value = canon_bytes(value);

        self.kv_live
            .entry(keyspace.clone())
            .or_default()
            .insert(key.clone(), value.clone());
        self.kv_updates
            .entry(keyspace.clone())
            .or_default()
            .insert(key.clone(), value);
        if let Some(deleted) = self.kv_deletes.get_mut(&keyspace) {
            deleted.remove(&key);
        }
    }

    /// Removes from the live state and the update journal and records the
    /// delete marker.
    pub fn kv_delete(&mut self, keyspace: &[u8], key: &[u8]) {
        let keyspace = canon_bytes(keyspace);
        let key = canon_bytes(key);

        if let Some(inner) = self.kv_live.get_mut(&keyspace) {
            inner.remove(&key);
        }
        if let Some(inner) = self.kv_updates.get_mut(&keyspace) {
            inner.remove(&key);
        }
        self.kv_deletes.entry(keyspace).or_default().insert(key);
    }

    //
    // Fungible tokens
    //

    pub fn ft_balance(&self, atomref: &AtomicalRef) -> u64 {
        self.ft_live.get(atomref).copied().unwrap_or(0)
    }

    pub fn ft_balance_incoming(&self, atomref: &AtomicalRef) -> u64 {
        self.ft_incoming.get(atomref).copied().unwrap_or(0)
    }

    /// Moves the full incoming amount for `atomref` into the live balance.
    /// Allowed at most once per atomref per invocation.
    pub fn ft_balance_add(&mut self, atomref: &AtomicalRef) -> bool {
        let Some(&amount) = self.ft_incoming.get(atomref) else {
            return false;
        };
        if amount == 0 || self.ft_added_once.contains(atomref) {
            return false;
        }
        self.ft_added_once.insert(*atomref);
        let balance = self.ft_live.entry(*atomref).or_insert(0);
        *balance = balance.saturating_add(amount);
        self.ft_updates.insert(*atomref, *balance);
        true
    }

    /// Deducts `amount` from the live balance and records the realized
    /// withdrawal to `output_index`. Zero balances are pruned immediately.
    pub fn ft_withdraw(&mut self, atomref: &AtomicalRef, output_index: u32, amount: u64) -> bool {
        if amount == 0 {
            return false;
        }
        let Some(&balance) = self.ft_live.get(atomref) else {
            return false;
        };
        if amount > balance {
            return false;
        }

        let updated = balance - amount;
        if updated == 0 {
            self.ft_live.remove(atomref);
        } else {
            self.ft_live.insert(*atomref, updated);
        }
        self.ft_updates.insert(*atomref, updated);

        let outputs = self.ft_withdraws.entry(*atomref).or_default();
        let entry = outputs.entry(output_index).or_insert(0);
        *entry = entry.saturating_add(amount);
        true
    }

    pub fn ft_count(&self) -> u32 {
        self.ft_live.len() as u32
    }

    pub fn ft_count_incoming(&self) -> u32 {
        self.ft_incoming.len() as u32
    }

    pub fn ft_item(&self, index: usize) -> Option<AtomicalRef> {
        self.ft_live.keys().nth(index).copied()
    }

    pub fn ft_item_incoming(&self, index: usize) -> Option<AtomicalRef> {
        self.ft_incoming.keys().nth(index).copied()
    }

    //
    // Non-fungible tokens
    //

    pub fn nft_exists(&self, atomref: &AtomicalRef) -> bool {
        self.nft_live.contains(atomref)
    }

    pub fn nft_exists_incoming(&self, atomref: &AtomicalRef) -> bool {
        self.nft_incoming.contains(atomref)
    }

    /// Takes `atomref` from the incoming pool into the live table. Allowed
    /// at most once per atomref per invocation.
    pub fn nft_put(&mut self, atomref: &AtomicalRef) -> bool {
        if !self.nft_incoming.contains(atomref) || self.nft_put_once.contains(atomref) {
            return false;
        }
        self.nft_put_once.insert(*atomref);
        self.nft_live.insert(*atomref);
        self.nft_updates.insert(*atomref, true);
        true
    }

    pub fn nft_withdraw(&mut self, atomref: &AtomicalRef, output_index: u32) -> bool {
        if !self.nft_live.remove(atomref) {
            return false;
        }
        self.nft_updates.insert(*atomref, false);
        self.nft_withdraws.insert(*atomref, output_index);
        true
    }

    pub fn nft_count(&self) -> u32 {
        self.nft_live.len() as u32
    }

    pub fn nft_count_incoming(&self) -> u32 {
        self.nft_incoming.len() as u32
    }

    pub fn nft_item(&self, index: usize) -> Option<AtomicalRef> {
        self.nft_live.iter().nth(index).copied()
    }

    pub fn nft_item_incoming(&self, index: usize) -> Option<AtomicalRef> {
        self.nft_incoming.iter().nth(index).copied()
    }

    //
    // Withdraw results
    //

    pub fn ft_withdraw_map(&self) -> &BTreeMap<AtomicalRef, BTreeMap<u32, u64>> {
        &self.ft_withdraws
    }

    pub fn nft_withdraw_map(&self) -> &BTreeMap<AtomicalRef, u32> {
        &self.nft_withdraws
    }

    //
    // External block headers
    //

    /// Looks up the header table. Height zero aliases the current height.
    pub fn block_info(&self, height: u32) -> Result<&BlockInfo, ScriptError> {
        let height = if height == 0 {
            self.external.current_height
        } else {
            height
        };
        self.external
            .headers
            .get(&height)
            .ok_or(ScriptError::InvalidBlockInfoHeight)
    }

    //
    // Finalization
    //

    /// Prunes empty keyspaces and degenerate balance entries.
    pub fn canonicalize(&mut self) {
        self.kv_live.retain(|_, inner| !inner.is_empty());
        self.kv_updates.retain(|_, inner| !inner.is_empty());
        self.kv_deletes.retain(|_, inner| !inner.is_empty());
        self.ft_live.retain(|_, amount| *amount != 0);
    }

    /// Enforces the host's final-state byte budgets.
    pub fn validate_sizes(&self) -> Result<(), Error> {
        if kv_map_bytes(&self.kv_live) > self.limits.max_state_final_bytes as u64 {
            return Err(Error::ERR_STATE_SIZE_ERROR);
        }
        if kv_map_bytes(&self.kv_updates) > self.limits.max_state_update_bytes as u64 {
            return Err(Error::ERR_STATE_UPDATES_SIZE_ERROR);
        }
        if kv_delete_bytes(&self.kv_deletes) > self.limits.max_state_update_bytes as u64 {
            return Err(Error::ERR_STATE_DELETES_SIZE_ERROR);
        }
        if ft_map_bytes(&self.ft_live) > self.limits.max_balances_bytes as u64 {
            return Err(Error::ERR_STATE_FT_BALANCES_SIZE_ERROR);
        }
        if ft_map_bytes(&self.ft_updates) > self.limits.max_balances_update_bytes as u64 {
            return Err(Error::ERR_STATE_FT_BALANCES_UPDATES_SIZE_ERROR);
        }
        if nft_set_bytes(self.nft_live.len()) > self.limits.max_balances_bytes as u64 {
            return Err(Error::ERR_STATE_NFT_BALANCES_SIZE_ERROR);
        }
        if nft_set_bytes(self.nft_updates.len()) > self.limits.max_balances_update_bytes as u64 {
            return Err(Error::ERR_STATE_NFT_BALANCES_UPDATES_SIZE_ERROR);
        }
        Ok(())
    }

    /// Canonicalizes, re-validates, serializes every output document and
    /// chains the state hash onto `prev_state_hash`.
    pub fn finalize(mut self, prev_state_hash: &[u8; 32]) -> Result<FinalizedState, Error> {
        self.canonicalize();
        self.validate_sizes()?;

        let state_hash = self.state_hash(prev_state_hash);

        Ok(FinalizedState {
            state_hash,
            state_final: to_cbor(&kv_map_value(&self.kv_live)),
            state_updates: to_cbor(&kv_map_value(&self.kv_updates)),
            state_deletes: to_cbor(&kv_delete_value(&self.kv_deletes)),
            ft_balances: to_cbor(&ft_map_value(&self.ft_live)),
            ft_balances_updates: to_cbor(&ft_map_value(&self.ft_updates)),
            nft_balances: to_cbor(&nft_set_value(&self.nft_live)),
            nft_balances_updates: to_cbor(&nft_bool_map_value(&self.nft_updates)),
            ft_withdraws: to_cbor(&ft_withdraw_value(&self.ft_withdraws)),
            nft_withdraws: to_cbor(&nft_withdraw_value(&self.nft_withdraws)),
            ft_balances_added: to_cbor(&atomref_set_value(&self.ft_added_once)),
            nft_puts: to_cbor(&atomref_set_value(&self.nft_put_once)),
        })
    }

    /// Deterministic rollup of all inputs and outputs chained to the prior
    /// state hash. The concatenation order is fixed; changing it breaks the
    /// chain.
    pub fn state_hash(&self, prev_state_hash: &[u8; 32]) -> [u8; 32] {
        let mut preimage = prev_state_hash.to_vec();
        preimage.extend_from_slice(&digest_atomref_keys(self.nft_incoming.iter()));
        preimage.extend_from_slice(&digest_atomref_keys(self.ft_incoming.keys()));
        preimage.extend_from_slice(&digest_kv_map(&self.kv_live));
        preimage.extend_from_slice(&digest_kv_map(&self.kv_updates));
        preimage.extend_from_slice(&digest_kv_deletes(&self.kv_deletes));
        preimage.extend_from_slice(&digest_atomref_keys(self.nft_live.iter()));
        preimage.extend_from_slice(&digest_atomref_keys(self.ft_live.keys()));
        preimage.extend_from_slice(&digest_atomref_keys(self.nft_updates.keys()));
        preimage.extend_from_slice(&digest_atomref_keys(self.ft_updates.keys()));
        preimage.extend_from_slice(&digest_nft_withdraws(&self.nft_withdraws));
        preimage.extend_from_slice(&digest_ft_withdraws(&self.ft_withdraws));
        sha256::Hash::hash(&preimage).to_byte_array()
    }

    #[cfg(test)]
    pub(crate) fn insert_ft_incoming(&mut self, atomref: AtomicalRef, amount: u64) {
        self.ft_incoming.insert(atomref, amount);
    }

    #[cfg(test)]
    pub(crate) fn insert_nft_incoming(&mut self, atomref: AtomicalRef) {
        self.nft_incoming.insert(atomref);
    }
}

/// Empty byte strings are stored and digested as the single byte 0x00.
fn canon_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.is_empty() {
        vec![0x00]
    } else {
        bytes.to_vec()
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.len() >= 2
        && s.len() % 2 == 0
        && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

//
// Byte accounting
//

fn kv_map_bytes(map: &KvMap) -> u64 {
    let mut total = 0u64;
    for (keyspace, inner) in map {
        total += keyspace.len() as u64;
        for (key, value) in inner {
            total += key.len() as u64 + value.len() as u64;
        }
    }
    total
}

fn kv_delete_bytes(map: &KvDeleteMap) -> u64 {
    let mut total = 0u64;
    for (keyspace, inner) in map {
        total += keyspace.len() as u64;
        total += inner.iter().map(|key| key.len() as u64).sum::<u64>();
    }
    total
}

fn ft_map_bytes(map: &BTreeMap<AtomicalRef, u64>) -> u64 {
    // Integer values count as eight bytes.
    map.len() as u64 * (ATOMICAL_REF_SIZE as u64 + 8)
}

fn nft_set_bytes(entries: usize) -> u64 {
    entries as u64 * ATOMICAL_REF_SIZE as u64
}

//
// Canonical digestion
//

fn sha256_of(preimage: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

fn digest_kv_map(map: &KvMap) -> [u8; 32] {
    let mut preimage = Vec::new();
    for (keyspace, inner) in map {
        preimage.extend_from_slice(keyspace);
        for (key, value) in inner {
            preimage.extend_from_slice(key);
            preimage.extend_from_slice(value);
        }
    }
    sha256_of(&preimage)
}

fn digest_kv_deletes(map: &KvDeleteMap) -> [u8; 32] {
    let mut preimage = Vec::new();
    for (keyspace, inner) in map {
        preimage.extend_from_slice(keyspace);
        for key in inner {
            preimage.extend_from_slice(key);
        }
    }
    sha256_of(&preimage)
}

fn digest_atomref_keys<'a>(keys: impl Iterator<Item = &'a AtomicalRef>) -> [u8; 32] {
    let mut preimage = Vec::new();
    for key in keys {
        preimage.extend_from_slice(key.as_bytes());
    }
    sha256_of(&preimage)
}

fn digest_nft_withdraws(map: &BTreeMap<AtomicalRef, u32>) -> [u8; 32] {
    let mut preimage = Vec::new();
    for (atomref, output_index) in map {
        preimage.extend_from_slice(atomref.as_bytes());
        preimage.extend_from_slice(&output_index.to_le_bytes());
    }
    sha256_of(&preimage)
}

fn digest_ft_withdraws(map: &BTreeMap<AtomicalRef, BTreeMap<u32, u64>>) -> [u8; 32] {
    let mut preimage = Vec::new();
    for (atomref, outputs) in map {
        preimage.extend_from_slice(atomref.as_bytes());
        for (output_index, amount) in outputs {
            preimage.extend_from_slice(&u64::from(*output_index).to_le_bytes());
            preimage.extend_from_slice(&amount.to_le_bytes());
        }
    }
    sha256_of(&preimage)
}

//
// CBOR boundary
//

fn to_cbor(value: &Value) -> Vec<u8> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer).expect("writing to a Vec cannot fail");
    buffer
}

fn from_cbor(bytes: &[u8]) -> Result<Value, Error> {
    if bytes.is_empty() {
        return Ok(Value::Map(Vec::new()));
    }
    ciborium::de::from_reader(bytes).map_err(|_| Error::ERR_STATE_DESERIALIZE)
}

fn as_map(value: Value) -> Result<Vec<(Value, Value)>, Error> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(Error::ERR_STATE_DESERIALIZE),
    }
}

fn key_as_hex_string(key: &Value) -> Result<&str, Error> {
    let Value::Text(text) = key else {
        return Err(Error::ERR_STATE_DESERIALIZE);
    };
    if !is_lower_hex(text) {
        return Err(Error::ERR_STATE_DESERIALIZE);
    }
    Ok(text)
}

fn value_as_u64(value: &Value) -> Result<u64, Error> {
    let Value::Integer(integer) = value else {
        return Err(Error::ERR_STATE_DESERIALIZE);
    };
    u64::try_from(i128::from(*integer)).map_err(|_| Error::ERR_STATE_DESERIALIZE)
}

fn decode_ft_map(bytes: &[u8], allow_zero: bool) -> Result<BTreeMap<AtomicalRef, u64>, Error> {
    let mut map = BTreeMap::new();
    for (key, value) in as_map(from_cbor(bytes)?)? {
        let hex = key_as_hex_string(&key)?;
        let atomref = AtomicalRef::from_hex(hex).ok_or(Error::ERR_STATE_DESERIALIZE)?;
        let amount = value_as_u64(&value)?;
        if amount == 0 && !allow_zero {
            return Err(Error::ERR_STATE_DESERIALIZE);
        }
        map.insert(atomref, amount);
    }
    Ok(map)
}

fn decode_nft_map(bytes: &[u8], allow_false: bool) -> Result<BTreeSet<AtomicalRef>, Error> {
    let mut set = BTreeSet::new();
    for (key, value) in as_map(from_cbor(bytes)?)? {
        let hex = key_as_hex_string(&key)?;
        let atomref = AtomicalRef::from_hex(hex).ok_or(Error::ERR_STATE_DESERIALIZE)?;
        let Value::Bool(present) = value else {
            return Err(Error::ERR_STATE_DESERIALIZE);
        };
        if !present && !allow_false {
            return Err(Error::ERR_STATE_DESERIALIZE);
        }
        if present {
            set.insert(atomref);
        }
    }
    Ok(set)
}

fn decode_kv_map(bytes: &[u8]) -> Result<KvMap, Error> {
    let mut map = KvMap::new();
    for (keyspace, inner) in as_map(from_cbor(bytes)?)? {
        let keyspace = Vec::<u8>::from_hex(key_as_hex_string(&keyspace)?)
            .map_err(|_| Error::ERR_STATE_DESERIALIZE)?;
        let entries = as_map(inner)?;
        if entries.is_empty() {
            return Err(Error::ERR_STATE_DESERIALIZE);
        }
        let mut decoded = BTreeMap::new();
        for (key, value) in entries {
            let key = Vec::<u8>::from_hex(key_as_hex_string(&key)?)
                .map_err(|_| Error::ERR_STATE_DESERIALIZE)?;
            let value = Vec::<u8>::from_hex(key_as_hex_string(&value)?)
                .map_err(|_| Error::ERR_STATE_DESERIALIZE)?;
            decoded.insert(key, value);
        }
        map.insert(keyspace, decoded);
    }
    Ok(map)
}

fn decode_external_state(bytes: &[u8]) -> Result<ExternalState, Error> {
    let entries = as_map(from_cbor(bytes)?)?;
    let mut current_height: Option<u32> = None;
    let mut headers = BTreeMap::new();

    for (key, value) in entries {
        let Value::Text(ref name) = key else {
            return Err(Error::ERR_STATE_DESERIALIZE);
        };
        match name.as_str() {
            "height" => {
                let height = value_as_u64(&value)?;
                if height > u64::from(MAX_BLOCK_INFO_HEIGHT) {
                    return Err(Error::ERR_STATE_DESERIALIZE);
                }
                current_height = Some(height as u32);
            }
            "headers" => {
                for (height_key, header_value) in as_map(value)? {
                    let Value::Text(ref height_text) = height_key else {
                        return Err(Error::ERR_STATE_DESERIALIZE);
                    };
                    let height: u32 = height_text
                        .parse()
                        .map_err(|_| Error::ERR_STATE_DESERIALIZE)?;
                    let Value::Text(ref header_hex) = header_value else {
                        return Err(Error::ERR_STATE_DESERIALIZE);
                    };
                    let raw_bytes = Vec::<u8>::from_hex(header_hex)
                        .map_err(|_| Error::ERR_STATE_DESERIALIZE)?;
                    let raw: [u8; 80] = raw_bytes
                        .try_into()
                        .map_err(|_| Error::ERR_STATE_DESERIALIZE)?;
                    let header: Header = consensus::deserialize(&raw)
                        .map_err(|_| Error::ERR_STATE_DESERIALIZE)?;
                    headers.insert(height, BlockInfo { header, raw, height });
                }
            }
            _ => return Err(Error::ERR_STATE_DESERIALIZE),
        }
    }

    let current_height = current_height.ok_or(Error::ERR_STATE_DESERIALIZE)?;
    Ok(ExternalState {
        current_height,
        headers,
    })
}

//
// CBOR output documents
//

fn kv_map_value(map: &KvMap) -> Value {
    let entries = map
        .iter()
        .map(|(keyspace, inner)| {
            let inner_entries = inner
                .iter()
                .map(|(key, value)| {
                    (
                        Value::Text(key.to_lower_hex_string()),
                        Value::Text(value.to_lower_hex_string()),
                    )
                })
                .collect();
            (
                Value::Text(keyspace.to_lower_hex_string()),
                Value::Map(inner_entries),
            )
        })
        .collect();
    Value::Map(entries)
}

fn kv_delete_value(map: &KvDeleteMap) -> Value {
    let entries = map
        .iter()
        .map(|(keyspace, inner)| {
            let inner_entries = inner
                .iter()
                .map(|key| (Value::Text(key.to_lower_hex_string()), Value::Bool(true)))
                .collect();
            (
                Value::Text(keyspace.to_lower_hex_string()),
                Value::Map(inner_entries),
            )
        })
        .collect();
    Value::Map(entries)
}

fn ft_map_value(map: &BTreeMap<AtomicalRef, u64>) -> Value {
    let entries = map
        .iter()
        .map(|(atomref, amount)| {
            (
                Value::Text(atomref.to_hex()),
                Value::Integer((*amount).into()),
            )
        })
        .collect();
    Value::Map(entries)
}

fn nft_set_value(set: &BTreeSet<AtomicalRef>) -> Value {
    let entries = set
        .iter()
        .map(|atomref| (Value::Text(atomref.to_hex()), Value::Bool(true)))
        .collect();
    Value::Map(entries)
}

fn nft_bool_map_value(map: &BTreeMap<AtomicalRef, bool>) -> Value {
    let entries = map
        .iter()
        .map(|(atomref, present)| (Value::Text(atomref.to_hex()), Value::Bool(*present)))
        .collect();
    Value::Map(entries)
}

fn atomref_set_value(set: &BTreeSet<AtomicalRef>) -> Value {
    let entries = set
        .iter()
        .map(|atomref| (Value::Text(atomref.to_hex()), Value::Bool(true)))
        .collect();
    Value::Map(entries)
}

fn ft_withdraw_value(map: &BTreeMap<AtomicalRef, BTreeMap<u32, u64>>) -> Value {
    let entries = map
        .iter()
        .map(|(atomref, outputs)| {
            let inner = outputs
                .iter()
                .map(|(output_index, amount)| {
                    (
                        Value::Text(output_index.to_string()),
                        Value::Integer((*amount).into()),
                    )
                })
                .collect();
            (Value::Text(atomref.to_hex()), Value::Map(inner))
        })
        .collect();
    Value::Map(entries)
}

fn nft_withdraw_value(map: &BTreeMap<AtomicalRef, u32>) -> Value {
    let entries = map
        .iter()
        .map(|(atomref, output_index)| {
            (
                Value::Text(atomref.to_hex()),
                Value::Integer((*output_index).into()),
            )
        })
        .collect();
    Value::Map(entries)
}

/// Decodes an 80-byte block header.
pub fn decode_header(raw: &[u8]) -> Result<Header, ScriptError> {
    consensus::deserialize(raw).map_err(|_| ScriptError::InvalidBlockHeaderSize)
}

/// Difficulty derived from the compact target, rounded to the nearest
/// integer. The genesis target 0x1d00ffff maps to one.
pub fn header_difficulty(bits: u32) -> u64 {
    let mut shift = (bits >> 24) & 0xff;
    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 {
        return 0;
    }
    let mut difficulty = f64::from(0x0000_ffff_u32) / f64::from(mantissa);
    while shift < 29 {
        difficulty *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        difficulty /= 256.0;
        shift -= 1;
    }
    difficulty.round() as u64
}
