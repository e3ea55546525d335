//! End-to-end scenarios exercising the token and key/value opcodes through
//! the public verification entry point.

mod common;

use atomicals_consensus::{opcodes::*, Error, ScriptBuilder, ScriptError, StateLimits};
use bitcoin::consensus;
use bitcoin::hashes::Hash;
use ciborium::value::Value;
use common::*;

#[test]
fn kv_roundtrip_updates_live_state_and_journal() {
    let fixture = Fixture::new();
    let unlock = ScriptBuilder::new()
        .push_slice(b"ks")
        .push_slice(b"k")
        .push_slice(b"v")
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_KV_PUT)
        .push_slice(b"ks")
        .push_slice(b"k")
        .push_opcode(OP_KV_GET)
        .push_slice(b"v")
        .push_opcode(OP_EQUAL)
        .into_bytes();

    let outcome = fixture.run(&unlock, &lock).expect("kv roundtrip verifies");

    let state_final = decode_cbor(&outcome.state_final);
    let keyspace = map_get(&state_final, "6b73").expect("keyspace present");
    assert_eq!(
        map_get(keyspace, "6b"),
        Some(&Value::Text("76".to_string()))
    );

    let updates = decode_cbor(&outcome.state_updates);
    let keyspace = map_get(&updates, "6b73").expect("update journal records the write");
    assert_eq!(
        map_get(keyspace, "6b"),
        Some(&Value::Text("76".to_string()))
    );

    let deletes = decode_cbor(&outcome.state_deletes);
    assert_eq!(map_len(&deletes), 0);
}

#[test]
fn kv_delete_then_get_fails_and_records_marker() {
    let mut fixture = Fixture::new();
    fixture.contract_state = cbor(&Value::Map(vec![(
        Value::Text("6b73".into()),
        Value::Map(vec![(Value::Text("6b".into()), Value::Text("76".into()))]),
    )]));

    let unlock = ScriptBuilder::new()
        .push_slice(b"ks")
        .push_slice(b"k")
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_KV_DELETE)
        .push_slice(b"ks")
        .push_slice(b"k")
        .push_opcode(OP_KV_GET)
        .into_bytes();

    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::StateKeyNotFound);

    // Delete without the failing read: the marker lands in the deletes doc.
    let lock = ScriptBuilder::new()
        .push_opcode(OP_KV_DELETE)
        .push_num(1)
        .into_bytes();
    let outcome = fixture.run(&unlock, &lock).expect("delete verifies");
    let deletes = decode_cbor(&outcome.state_deletes);
    let keyspace = map_get(&deletes, "6b73").expect("delete marker recorded");
    assert_eq!(map_get(keyspace, "6b"), Some(&Value::Bool(true)));
    assert_eq!(map_len(&decode_cbor(&outcome.state_final)), 0);
}

#[test]
fn kv_exists_reflects_live_state() {
    let fixture = Fixture::new();
    let unlock = ScriptBuilder::new()
        .push_slice(b"ks")
        .push_slice(b"missing")
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_KV_EXISTS)
        .push_opcode(OP_NOT)
        .into_bytes();
    fixture.run(&unlock, &lock).expect("missing key is false");
}

#[test]
fn kv_put_rejects_oversized_keys() {
    let fixture = Fixture::new();
    let big_key = vec![0xabu8; 1025];
    let unlock = ScriptBuilder::new()
        .push_slice(b"ks")
        .push_slice(&big_key)
        .push_slice(b"v")
        .into_bytes();
    let lock = ScriptBuilder::new().push_opcode(OP_KV_PUT).into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::StateKeySize);
}

#[test]
fn ft_intake_then_partial_withdraw() {
    let token = atomref(0xaa);
    let mut fixture = Fixture::with_outputs(vec![(60, Vec::new())]);
    fixture.ft_state_incoming = ft_doc(&[(token, 100)]);

    let unlock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_FT_BALANCE_ADD)
        .push_num(40)
        .push_num(0)
        .push_slice(token.as_bytes())
        .push_opcode(OP_FT_WITHDRAW)
        .push_opcode(OP_1)
        .into_bytes();

    let outcome = fixture.run(&unlock, &lock).expect("intake and withdraw");

    let balances = decode_cbor(&outcome.ft_balances);
    assert_eq!(
        map_get(&balances, &token.to_hex()),
        Some(&Value::Integer(60u64.into()))
    );

    let withdraws = decode_cbor(&outcome.ft_withdraws);
    let per_output = map_get(&withdraws, &token.to_hex()).expect("withdraw recorded");
    assert_eq!(map_get(per_output, "0"), Some(&Value::Integer(40u64.into())));

    let added = decode_cbor(&outcome.ft_balances_added);
    assert_eq!(map_get(&added, &token.to_hex()), Some(&Value::Bool(true)));

    let updates = decode_cbor(&outcome.ft_balances_updates);
    assert_eq!(
        map_get(&updates, &token.to_hex()),
        Some(&Value::Integer(60u64.into()))
    );
}

#[test]
fn ft_balance_add_is_once_per_invocation() {
    let token = atomref(0xaa);
    let mut fixture = Fixture::new();
    fixture.ft_state_incoming = ft_doc(&[(token, 100)]);

    let unlock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .push_slice(token.as_bytes())
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_FT_BALANCE_ADD)
        .push_opcode(OP_FT_BALANCE_ADD)
        .push_opcode(OP_1)
        .into_bytes();

    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::FtBalanceAddInvalid);
}

#[test]
fn ft_withdraw_beyond_output_value_fails() {
    let token = atomref(0xaa);
    let mut fixture = Fixture::with_outputs(vec![(30, Vec::new())]);
    fixture.ft_state_incoming = ft_doc(&[(token, 100)]);

    let unlock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_FT_BALANCE_ADD)
        .push_num(40)
        .push_num(0)
        .push_slice(token.as_bytes())
        .push_opcode(OP_FT_WITHDRAW)
        .push_opcode(OP_1)
        .into_bytes();

    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::WithdrawFtAmount);
}

#[test]
fn ft_withdraw_beyond_balance_fails() {
    let token = atomref(0xaa);
    let mut fixture = Fixture::with_outputs(vec![(1000, Vec::new())]);
    fixture.ft_state = ft_doc(&[(token, 10)]);

    let unlock = ScriptBuilder::new()
        .push_num(40)
        .push_num(0)
        .push_slice(token.as_bytes())
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_FT_WITHDRAW)
        .push_opcode(OP_1)
        .into_bytes();

    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::WithdrawFt);
}

#[test]
fn short_atomref_is_rejected() {
    let fixture = Fixture::new();
    let unlock = ScriptBuilder::new().push_slice(&[0xaa; 35]).into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_FT_BALANCE_ADD)
        .push_opcode(OP_1)
        .into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidAtomicalRefSize);
}

#[test]
fn nft_put_then_immediate_withdraw() {
    let token = atomref(0xbb);
    let mut fixture = Fixture::with_outputs(vec![(0, Vec::new())]);
    fixture.nft_state_incoming = nft_doc(&[token]);

    let unlock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_NFT_PUT)
        .push_num(0)
        .push_slice(token.as_bytes())
        .push_opcode(OP_NFT_WITHDRAW)
        .push_opcode(OP_1)
        .into_bytes();

    let outcome = fixture.run(&unlock, &lock).expect("put then withdraw");

    assert_eq!(map_len(&decode_cbor(&outcome.nft_balances)), 0);
    let withdraws = decode_cbor(&outcome.nft_withdraws);
    assert_eq!(
        map_get(&withdraws, &token.to_hex()),
        Some(&Value::Integer(0u64.into()))
    );
    let puts = decode_cbor(&outcome.nft_puts);
    assert_eq!(map_get(&puts, &token.to_hex()), Some(&Value::Bool(true)));
    let updates = decode_cbor(&outcome.nft_balances_updates);
    assert_eq!(map_get(&updates, &token.to_hex()), Some(&Value::Bool(false)));
}

#[test]
fn nft_put_requires_incoming_entry() {
    let token = atomref(0xbb);
    let fixture = Fixture::new();
    let unlock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_NFT_PUT)
        .push_opcode(OP_1)
        .into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::NftPutInvalid);
}

#[test]
fn nft_withdraw_output_index_is_validated() {
    let token = atomref(0xbb);
    let mut fixture = Fixture::with_outputs(vec![(0, Vec::new())]);
    fixture.nft_state = nft_doc(&[token]);

    let unlock = ScriptBuilder::new()
        .push_num(5)
        .push_slice(token.as_bytes())
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_NFT_WITHDRAW)
        .push_opcode(OP_1)
        .into_bytes();

    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::WithdrawNftOutputIndex);
}

#[test]
fn counts_and_items_enumerate_sorted_tables() {
    let low = atomref(0x01);
    let high = atomref(0x02);
    let mut fixture = Fixture::new();
    fixture.ft_state = ft_doc(&[(high, 5), (low, 7)]);
    fixture.ft_state_incoming = ft_doc(&[(low, 1)]);

    // Live count is 2, incoming count is 1, item 0 of the live table is the
    // numerically smaller atomref.
    let lock = ScriptBuilder::new()
        .push_num(0)
        .push_opcode(OP_FT_COUNT)
        .push_num(2)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_num(1)
        .push_opcode(OP_FT_COUNT)
        .push_num(1)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_num(0)
        .push_num(0)
        .push_opcode(OP_FT_ITEM)
        .push_slice(low.as_bytes())
        .push_opcode(OP_EQUAL)
        .into_bytes();

    fixture.run(&[], &lock).expect("counts and items line up");
}

#[test]
fn ft_item_out_of_range_fails() {
    let fixture = Fixture::new();
    let lock = ScriptBuilder::new()
        .push_num(0)
        .push_num(0)
        .push_opcode(OP_FT_ITEM)
        .into_bytes();
    let failure = fixture.run(&[], &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidFtItemIndex);
}

#[test]
fn count_type_operand_is_range_checked() {
    let fixture = Fixture::new();
    let lock = ScriptBuilder::new()
        .push_num(2)
        .push_opcode(OP_FT_COUNT)
        .into_bytes();
    let failure = fixture.run(&[], &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::FtCountType);

    let lock = ScriptBuilder::new()
        .push_num(2)
        .push_opcode(OP_NFT_COUNT)
        .into_bytes();
    let failure = fixture.run(&[], &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::NftCountType);
}

#[test]
fn token_lookup_validates_the_bottom_operand_first() {
    let fixture = Fixture::new();

    // Both operands invalid: the atomref size error wins over the type
    // error for the balance and existence lookups.
    let unlock = ScriptBuilder::new()
        .push_slice(&[0xaa; 35])
        .push_num(9)
        .into_bytes();
    let lock = ScriptBuilder::new().push_opcode(OP_FT_BALANCE).into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidAtomicalRefSize);

    let unlock = ScriptBuilder::new()
        .push_slice(&[0xbb; 35])
        .push_num(9)
        .into_bytes();
    let lock = ScriptBuilder::new().push_opcode(OP_NFT_EXISTS).into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidAtomicalRefSize);

    // The same holds for the item index against the item type.
    let unlock = ScriptBuilder::new().push_num(-1).push_num(9).into_bytes();
    let lock = ScriptBuilder::new().push_opcode(OP_FT_ITEM).into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidFtItemIndex);

    let unlock = ScriptBuilder::new().push_num(-1).push_num(9).into_bytes();
    let lock = ScriptBuilder::new().push_opcode(OP_NFT_ITEM).into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidNftItemIndex);

    // With a valid bottom operand the type range error surfaces.
    let token = atomref(0xcc);
    let unlock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .push_num(9)
        .into_bytes();
    let lock = ScriptBuilder::new().push_opcode(OP_FT_BALANCE).into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::FtBalanceType);
}

#[test]
fn ft_balance_reads_live_and_incoming_tables() {
    let token = atomref(0xcc);
    let mut fixture = Fixture::new();
    fixture.ft_state = ft_doc(&[(token, 11)]);
    fixture.ft_state_incoming = ft_doc(&[(token, 22)]);

    let lock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .push_num(0)
        .push_opcode(OP_FT_BALANCE)
        .push_num(11)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_slice(token.as_bytes())
        .push_num(1)
        .push_opcode(OP_FT_BALANCE)
        .push_num(22)
        .push_opcode(OP_NUMEQUAL)
        .into_bytes();

    fixture.run(&[], &lock).expect("balances match snapshots");
}

#[test]
fn nft_exists_distinguishes_tables() {
    let token = atomref(0xdd);
    let mut fixture = Fixture::new();
    fixture.nft_state_incoming = nft_doc(&[token]);

    let lock = ScriptBuilder::new()
        .push_slice(token.as_bytes())
        .push_num(0)
        .push_opcode(OP_NFT_EXISTS)
        .push_opcode(OP_NOT)
        .push_opcode(OP_VERIFY)
        .push_slice(token.as_bytes())
        .push_num(1)
        .push_opcode(OP_NFT_EXISTS)
        .into_bytes();

    fixture.run(&[], &lock).expect("incoming only");
}

#[test]
fn final_state_size_limit_is_enforced() {
    let mut fixture = Fixture::new();
    fixture.limits = StateLimits {
        max_state_final_bytes: 4,
        ..StateLimits::default()
    };

    let unlock = ScriptBuilder::new()
        .push_slice(b"keyspace")
        .push_slice(b"key")
        .push_slice(b"value")
        .into_bytes();
    let lock = ScriptBuilder::new()
        .push_opcode(OP_KV_PUT)
        .push_num(1)
        .into_bytes();

    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.error, Error::ERR_STATE_SIZE_ERROR);
    assert_eq!(failure.script_error, ScriptError::Ok);
}

#[test]
fn state_hash_changes_with_any_document() {
    let token = atomref(0xaa);
    let base = Fixture::new();
    let unlock = ScriptBuilder::new().push_num(1).into_bytes();
    let baseline = base.run(&unlock, &[]).unwrap().state_hash;

    let mut with_incoming = Fixture::new();
    with_incoming.ft_state_incoming = ft_doc(&[(token, 1)]);
    let changed = with_incoming.run(&unlock, &[]).unwrap().state_hash;
    assert_ne!(baseline, changed, "incoming pool is part of the digest");
}

#[test]
fn getblockinfo_reads_header_fields() {
    // Height 100 header with distinctive fields.
    let header = bitcoin::block::Header {
        version: bitcoin::block::Version::from_consensus(7),
        prev_blockhash: bitcoin::BlockHash::from_byte_array([0x11; 32]),
        merkle_root: bitcoin::TxMerkleNode::from_byte_array([0x22; 32]),
        time: 1_700_000_000,
        bits: bitcoin::CompactTarget::from_consensus(0x1d00ffff),
        nonce: 999,
    };
    let header_hex = consensus::serialize(&header)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();

    let mut fixture = Fixture::new();
    fixture.contract_external_state = external_doc(100, &[(100, header_hex.clone())]);

    let lock = ScriptBuilder::new()
        // Field 0: version.
        .push_num(100)
        .push_num(0)
        .push_opcode(OP_GETBLOCKINFO)
        .push_num(7)
        .push_opcode(OP_NUMEQUALVERIFY)
        // Field 3: time.
        .push_num(100)
        .push_num(3)
        .push_opcode(OP_GETBLOCKINFO)
        .push_num(1_700_000_000)
        .push_opcode(OP_NUMEQUALVERIFY)
        // Field 5: nonce.
        .push_num(100)
        .push_num(5)
        .push_opcode(OP_GETBLOCKINFO)
        .push_num(999)
        .push_opcode(OP_NUMEQUALVERIFY)
        // Field 6: difficulty of the genesis target is one.
        .push_num(100)
        .push_num(6)
        .push_opcode(OP_GETBLOCKINFO)
        .push_num(1)
        .push_opcode(OP_NUMEQUALVERIFY)
        // Field 8 with height zero aliases the current height.
        .push_num(0)
        .push_num(8)
        .push_opcode(OP_GETBLOCKINFO)
        .push_num(100)
        .push_opcode(OP_NUMEQUAL)
        .into_bytes();

    fixture.run(&[], &lock).expect("header fields decode");
}

#[test]
fn getblockinfo_missing_height_fails() {
    let fixture = Fixture::new();
    let lock = ScriptBuilder::new()
        .push_num(12345)
        .push_num(0)
        .push_opcode(OP_GETBLOCKINFO)
        .into_bytes();
    let failure = fixture.run(&[], &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidBlockInfoHeight);
}

#[test]
fn decodeblockinfo_parses_a_pushed_header() {
    let header = bitcoin::block::Header {
        version: bitcoin::block::Version::from_consensus(3),
        prev_blockhash: bitcoin::BlockHash::from_byte_array([0x33; 32]),
        merkle_root: bitcoin::TxMerkleNode::from_byte_array([0x44; 32]),
        time: 12345,
        bits: bitcoin::CompactTarget::from_consensus(0x1c00ffff),
        nonce: 7,
    };
    let raw = consensus::serialize(&header);
    assert_eq!(raw.len(), 80);

    let fixture = Fixture::new();
    let unlock = ScriptBuilder::new().push_slice(&raw).into_bytes();
    let lock = ScriptBuilder::new()
        .push_num(0)
        .push_opcode(OP_DECODEBLOCKINFO)
        .push_num(3)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_slice(&raw)
        .push_num(1)
        .push_opcode(OP_DECODEBLOCKINFO)
        .push_slice(&[0x33; 32])
        .push_opcode(OP_EQUALVERIFY)
        .push_slice(&raw)
        .push_num(6)
        .push_opcode(OP_DECODEBLOCKINFO)
        .push_num(256)
        .push_opcode(OP_NUMEQUAL)
        .into_bytes();

    fixture.run(&unlock, &lock).expect("header decodes");
}

#[test]
fn decodeblockinfo_rejects_wrong_header_size() {
    let fixture = Fixture::new();
    let unlock = ScriptBuilder::new().push_slice(&[0u8; 79]).into_bytes();
    let lock = ScriptBuilder::new()
        .push_num(0)
        .push_opcode(OP_DECODEBLOCKINFO)
        .into_bytes();
    let failure = fixture.run(&unlock, &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidBlockHeaderSize);
}

#[test]
fn introspection_reads_the_transaction_view() {
    let fixture = Fixture::with_outputs(vec![(1000, vec![0x51]), (2000, Vec::new())]);

    let lock = ScriptBuilder::new()
        .push_opcode(OP_TXVERSION)
        .push_num(2)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_opcode(OP_TXINPUTCOUNT)
        .push_num(1)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_opcode(OP_TXOUTPUTCOUNT)
        .push_num(2)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_opcode(OP_TXLOCKTIME)
        .push_num(0)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_num(0)
        .push_opcode(OP_OUTPOINTTXHASH)
        .push_slice(&[0x42; 32])
        .push_opcode(OP_EQUALVERIFY)
        .push_num(0)
        .push_opcode(OP_OUTPOINTINDEX)
        .push_num(1)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_num(1)
        .push_opcode(OP_OUTPUTVALUE)
        .push_num(2000)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_num(0)
        .push_opcode(OP_OUTPUTBYTECODE)
        .push_slice(&[0x51])
        .push_opcode(OP_EQUAL)
        .into_bytes();

    fixture.run(&[], &lock).expect("introspection matches the tx");
}

#[test]
fn introspection_index_bounds_are_typed() {
    let fixture = Fixture::new();
    let lock = ScriptBuilder::new()
        .push_num(9)
        .push_opcode(OP_OUTPOINTTXHASH)
        .into_bytes();
    let failure = fixture.run(&[], &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidTxInputIndex);

    let lock = ScriptBuilder::new()
        .push_num(9)
        .push_opcode(OP_OUTPUTVALUE)
        .into_bytes();
    let failure = fixture.run(&[], &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidTxOutputIndex);
}

#[test]
fn hash_fn_selects_documented_algorithms() {
    let fixture = Fixture::new();

    // Known digests of the empty string.
    let sha3_256_empty =
        hex_bytes("a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a");
    let sha512_256_empty =
        hex_bytes("c672b8d1ef56ed28ab87c3622c5114069bdd3ad7b8f9737498d0c01ecef0967a");

    let lock = ScriptBuilder::new()
        .push_slice(&[])
        .push_num(0)
        .push_opcode(OP_HASH_FN)
        .push_slice(&sha3_256_empty)
        .push_opcode(OP_EQUALVERIFY)
        .push_slice(&[])
        .push_num(2)
        .push_opcode(OP_HASH_FN)
        .push_slice(&sha512_256_empty)
        .push_opcode(OP_EQUALVERIFY)
        // SHA-512 output is 64 bytes.
        .push_slice(&[])
        .push_num(1)
        .push_opcode(OP_HASH_FN)
        .push_opcode(OP_SIZE)
        .push_num(64)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_opcode(OP_DROP)
        // Eaglesong output is 32 bytes.
        .push_slice(b"x")
        .push_num(3)
        .push_opcode(OP_HASH_FN)
        .push_opcode(OP_SIZE)
        .push_num(32)
        .push_opcode(OP_NUMEQUALVERIFY)
        .push_opcode(OP_DROP)
        .push_num(1)
        .into_bytes();

    fixture.run(&[], &lock).expect("hash algorithms dispatch");
}

#[test]
fn hash_fn_rejects_unknown_algorithms() {
    let fixture = Fixture::new();
    let lock = ScriptBuilder::new()
        .push_slice(b"data")
        .push_num(4)
        .push_opcode(OP_HASH_FN)
        .into_bytes();
    let failure = fixture.run(&[], &lock).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidHashFunc);
}

#[test]
fn checklocktimeverify_compares_against_the_transaction() {
    use atomicals_consensus::VERIFY_CHECKLOCKTIMEVERIFY;

    let mut fixture = Fixture::new();
    fixture.flags = VERIFY_CHECKLOCKTIMEVERIFY;
    fixture.tx.lock_time = bitcoin::absolute::LockTime::from_consensus(500);
    fixture.tx.input[0].sequence = bitcoin::Sequence(0xffff_fffe);

    let satisfied = ScriptBuilder::new()
        .push_num(400)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .push_opcode(OP_DROP)
        .push_num(1)
        .into_bytes();
    fixture.run(&[], &satisfied).expect("400 <= 500 satisfies");

    let unsatisfied = ScriptBuilder::new()
        .push_num(600)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .into_bytes();
    let failure = fixture.run(&[], &unsatisfied).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::UnsatisfiedLocktime);

    let negative = ScriptBuilder::new()
        .push_num(-1)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .into_bytes();
    let failure = fixture.run(&[], &negative).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::NegativeLocktime);

    // A five byte operand parses; its failure is the comparison against the
    // 32-bit transaction locktime, not the operand width.
    let five_bytes = ScriptBuilder::new()
        .push_slice(&[0x00, 0x00, 0x00, 0x00, 0x01])
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .into_bytes();
    let failure = fixture.run(&[], &five_bytes).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::UnsatisfiedLocktime);

    // A sixth byte exceeds the locktime operand size.
    let six_bytes = ScriptBuilder::new()
        .push_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x01])
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .into_bytes();
    let failure = fixture.run(&[], &six_bytes).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::InvalidNumberRange);

    // Without the flag the opcode is a NOP.
    let mut nop_fixture = Fixture::new();
    nop_fixture.tx = fixture.tx.clone();
    let failure_free = ScriptBuilder::new()
        .push_num(600)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .into_bytes();
    nop_fixture.run(&[], &failure_free).expect("nop without flag");
}

#[test]
fn checksequenceverify_compares_masked_sequences() {
    use atomicals_consensus::VERIFY_CHECKSEQUENCEVERIFY;

    let mut fixture = Fixture::new();
    fixture.flags = VERIFY_CHECKSEQUENCEVERIFY;
    fixture.tx.input[0].sequence = bitcoin::Sequence(5);

    let satisfied = ScriptBuilder::new()
        .push_num(3)
        .push_opcode(OP_CHECKSEQUENCEVERIFY)
        .push_opcode(OP_DROP)
        .push_num(1)
        .into_bytes();
    fixture.run(&[], &satisfied).expect("3 <= 5 satisfies");

    let unsatisfied = ScriptBuilder::new()
        .push_num(10)
        .push_opcode(OP_CHECKSEQUENCEVERIFY)
        .into_bytes();
    let failure = fixture.run(&[], &unsatisfied).unwrap_err();
    assert_eq!(failure.script_error, ScriptError::UnsatisfiedLocktime);

    // An operand with the disable flag set turns the check into a NOP.
    let disabled = ScriptBuilder::new()
        .push_num(i64::from(u32::MAX))
        .push_opcode(OP_CHECKSEQUENCEVERIFY)
        .push_opcode(OP_DROP)
        .push_num(1)
        .into_bytes();
    fixture.run(&[], &disabled).expect("disable flag bypasses");
}

fn hex_bytes(hex: &str) -> Vec<u8> {
    use bitcoin::hex::FromHex;
    Vec::<u8>::from_hex(hex).unwrap()
}
