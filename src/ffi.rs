//! C ABI entry points.
//!
//! Mirrors the `atomicalsconsensus.h` surface: one verification call that
//! receives every input as a pointer/length pair and writes the error codes,
//! the state hash and the eleven CBOR result documents into caller-owned
//! buffers. Output buffers must be large enough for the configured state
//! limits; each is written together with its length slot.

use core::{ptr, slice};

use crate::types::{c_int, c_uchar, c_uint};
use crate::{verify_script_avm, Error, ScriptError, VerifyRequest, CONSENSUS_API_VERSION};

unsafe fn opt_slice<'a>(data: *const c_uchar, len: c_uint) -> &'a [u8] {
    if data.is_null() || len == 0 {
        &[]
    } else {
        slice::from_raw_parts(data, len as usize)
    }
}

unsafe fn write_bytes(src: &[u8], dest: *mut c_uchar, dest_len: *mut c_uint) {
    if !dest.is_null() {
        ptr::copy_nonoverlapping(src.as_ptr(), dest, src.len());
    }
    if !dest_len.is_null() {
        *dest_len = src.len() as c_uint;
    }
}

unsafe fn set_u32(dest: *mut c_uint, value: u32) {
    if !dest.is_null() {
        *dest = value;
    }
}

unsafe fn set_error(dest: *mut Error, error: Error) {
    if !dest.is_null() {
        *dest = error;
    }
}

/// Validates one AVM contract invocation.
///
/// Returns 1 when the scripts verify and the state documents were written,
/// 0 otherwise. `err` receives the host-level error, `script_error` and
/// `script_error_op_num` the interpreter error and the zero-based ordinal of
/// the failing instruction within its script run.
///
/// # Safety
///
/// Every pointer must either be null or valid for the advertised length;
/// `prev_state_hash` and `state_hash` must be null or point to 32 bytes; the
/// output document buffers must be large enough for the default state
/// limits. All buffers are owned by the caller for the duration of the call.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn atomicalsconsensus_verify_script_avm(
    lock_script: *const c_uchar,
    lock_script_len: c_uint,
    unlock_script: *const c_uchar,
    unlock_script_len: c_uint,
    tx_to: *const c_uchar,
    tx_to_len: c_uint,
    auth_pubkey: *const c_uchar,
    auth_pubkey_len: c_uint,
    ft_state_cbor: *const c_uchar,
    ft_state_cbor_len: c_uint,
    ft_state_incoming_cbor: *const c_uchar,
    ft_state_incoming_cbor_len: c_uint,
    nft_state_cbor: *const c_uchar,
    nft_state_cbor_len: c_uint,
    nft_state_incoming_cbor: *const c_uchar,
    nft_state_incoming_cbor_len: c_uint,
    contract_external_state_cbor: *const c_uchar,
    contract_external_state_cbor_len: c_uint,
    contract_state_cbor: *const c_uchar,
    contract_state_cbor_len: c_uint,
    prev_state_hash: *const c_uchar,
    err: *mut Error,
    script_error: *mut c_uint,
    script_error_op_num: *mut c_uint,
    state_hash: *mut c_uchar,
    state_final: *mut c_uchar,
    state_final_len: *mut c_uint,
    state_updates: *mut c_uchar,
    state_updates_len: *mut c_uint,
    state_deletes: *mut c_uchar,
    state_deletes_len: *mut c_uint,
    ft_balances_result: *mut c_uchar,
    ft_balances_result_len: *mut c_uint,
    ft_balances_updates_result: *mut c_uchar,
    ft_balances_updates_result_len: *mut c_uint,
    nft_balances_result: *mut c_uchar,
    nft_balances_result_len: *mut c_uint,
    nft_balances_updates_result: *mut c_uchar,
    nft_balances_updates_result_len: *mut c_uint,
    ft_withdraws: *mut c_uchar,
    ft_withdraws_len: *mut c_uint,
    nft_withdraws: *mut c_uchar,
    nft_withdraws_len: *mut c_uint,
    ft_balances_added: *mut c_uchar,
    ft_balances_added_len: *mut c_uint,
    nft_puts: *mut c_uchar,
    nft_puts_len: *mut c_uint,
) -> c_int {
    set_error(err, Error::ERR_OK);
    set_u32(script_error, ScriptError::Ok as u32);
    set_u32(script_error_op_num, 0);

    let mut prev_hash = [0u8; 32];
    if !prev_state_hash.is_null() {
        prev_hash.copy_from_slice(slice::from_raw_parts(prev_state_hash, 32));
    }

    let auth_pubkey_bytes = opt_slice(auth_pubkey, auth_pubkey_len);
    let request = VerifyRequest {
        lock_script: opt_slice(lock_script, lock_script_len),
        unlock_script: opt_slice(unlock_script, unlock_script_len),
        tx_to: opt_slice(tx_to, tx_to_len),
        auth_pubkey: if auth_pubkey_bytes.is_empty() {
            None
        } else {
            Some(auth_pubkey_bytes)
        },
        ft_state: opt_slice(ft_state_cbor, ft_state_cbor_len),
        ft_state_incoming: opt_slice(ft_state_incoming_cbor, ft_state_incoming_cbor_len),
        nft_state: opt_slice(nft_state_cbor, nft_state_cbor_len),
        nft_state_incoming: opt_slice(nft_state_incoming_cbor, nft_state_incoming_cbor_len),
        contract_state: opt_slice(contract_state_cbor, contract_state_cbor_len),
        contract_external_state: opt_slice(
            contract_external_state_cbor,
            contract_external_state_cbor_len,
        ),
        prev_state_hash: prev_hash,
        flags: 0,
    };

    match verify_script_avm(&request) {
        Ok(outcome) => {
            if !state_hash.is_null() {
                ptr::copy_nonoverlapping(outcome.state_hash.as_ptr(), state_hash, 32);
            }
            write_bytes(&outcome.state_final, state_final, state_final_len);
            write_bytes(&outcome.state_updates, state_updates, state_updates_len);
            write_bytes(&outcome.state_deletes, state_deletes, state_deletes_len);
            write_bytes(
                &outcome.ft_balances,
                ft_balances_result,
                ft_balances_result_len,
            );
            write_bytes(
                &outcome.ft_balances_updates,
                ft_balances_updates_result,
                ft_balances_updates_result_len,
            );
            write_bytes(
                &outcome.nft_balances,
                nft_balances_result,
                nft_balances_result_len,
            );
            write_bytes(
                &outcome.nft_balances_updates,
                nft_balances_updates_result,
                nft_balances_updates_result_len,
            );
            write_bytes(&outcome.ft_withdraws, ft_withdraws, ft_withdraws_len);
            write_bytes(&outcome.nft_withdraws, nft_withdraws, nft_withdraws_len);
            write_bytes(
                &outcome.ft_balances_added,
                ft_balances_added,
                ft_balances_added_len,
            );
            write_bytes(&outcome.nft_puts, nft_puts, nft_puts_len);
            1
        }
        Err(failure) => {
            set_error(err, failure.error);
            set_u32(script_error, failure.script_error as u32);
            set_u32(script_error_op_num, failure.script_error_op_num);
            0
        }
    }
}

/// Returns the API version this library implements.
#[no_mangle]
pub extern "C" fn atomicalsconsensus_version() -> c_uint {
    CONSENSUS_API_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptBuilder;
    use bitcoin::absolute::LockTime;
    use bitcoin::consensus;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
    use ciborium::value::Value;

    fn external_doc() -> Vec<u8> {
        let value = Value::Map(vec![
            (Value::Text("height".into()), Value::Integer(0u64.into())),
            (Value::Text("headers".into()), Value::Map(Vec::new())),
        ]);
        let mut buffer = Vec::new();
        ciborium::ser::into_writer(&value, &mut buffer).unwrap();
        buffer
    }

    fn tx_bytes() -> Vec<u8> {
        let tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        consensus::serialize(&tx)
    }

    #[test]
    fn round_trips_through_the_c_abi() {
        let unlock = ScriptBuilder::new().push_num(1).into_bytes();
        let lock: Vec<u8> = Vec::new();
        let tx_to = tx_bytes();
        let external = external_doc();
        let prev = [0u8; 32];

        let mut err = Error::ERR_OK;
        let mut script_err = 0u32;
        let mut script_err_op = 0u32;
        let mut state_hash = [0u8; 32];
        let mut docs = vec![vec![0u8; 4096]; 11];
        let mut lens = [0 as c_uint; 11];

        let result = unsafe {
            let doc_ptrs: Vec<*mut c_uchar> =
                docs.iter_mut().map(|buf| buf.as_mut_ptr()).collect();
            let len_ptrs: Vec<*mut c_uint> =
                lens.iter_mut().map(|len| len as *mut c_uint).collect();
            atomicalsconsensus_verify_script_avm(
                lock.as_ptr(),
                lock.len() as c_uint,
                unlock.as_ptr(),
                unlock.len() as c_uint,
                tx_to.as_ptr(),
                tx_to.len() as c_uint,
                ptr::null(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                0,
                external.as_ptr(),
                external.len() as c_uint,
                ptr::null(),
                0,
                prev.as_ptr(),
                &mut err,
                &mut script_err,
                &mut script_err_op,
                state_hash.as_mut_ptr(),
                doc_ptrs[0],
                len_ptrs[0],
                doc_ptrs[1],
                len_ptrs[1],
                doc_ptrs[2],
                len_ptrs[2],
                doc_ptrs[3],
                len_ptrs[3],
                doc_ptrs[4],
                len_ptrs[4],
                doc_ptrs[5],
                len_ptrs[5],
                doc_ptrs[6],
                len_ptrs[6],
                doc_ptrs[7],
                len_ptrs[7],
                doc_ptrs[8],
                len_ptrs[8],
                doc_ptrs[9],
                len_ptrs[9],
                doc_ptrs[10],
                len_ptrs[10],
            )
        };

        assert_eq!(result, 1);
        assert_eq!(err, Error::ERR_OK);
        assert_eq!(script_err, ScriptError::Ok as u32);
        assert_ne!(state_hash, [0u8; 32]);
        // Every result document is a CBOR map, at minimum the empty map.
        for (buffer, len) in docs.iter().zip(lens.iter()) {
            assert!(*len >= 1);
            assert_eq!(buffer[0], 0xa0, "empty documents encode as an empty map");
        }
    }

    #[test]
    fn failure_reports_script_error_through_the_abi() {
        let unlock = ScriptBuilder::new().push_num(0).into_bytes();
        let tx_to = tx_bytes();
        let external = external_doc();
        let prev = [0u8; 32];

        let mut err = Error::ERR_OK;
        let mut script_err = 0u32;
        let mut script_err_op = 0u32;

        let result = unsafe {
            atomicalsconsensus_verify_script_avm(
                ptr::null(),
                0,
                unlock.as_ptr(),
                unlock.len() as c_uint,
                tx_to.as_ptr(),
                tx_to.len() as c_uint,
                ptr::null(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                0,
                external.as_ptr(),
                external.len() as c_uint,
                ptr::null(),
                0,
                prev.as_ptr(),
                &mut err,
                &mut script_err,
                &mut script_err_op,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };

        assert_eq!(result, 0);
        assert_eq!(err, Error::ERR_OK);
        assert_eq!(script_err, ScriptError::EvalFalse as u32);
    }

    #[test]
    fn version_matches_api_constant() {
        assert_eq!(atomicalsconsensus_version(), CONSENSUS_API_VERSION);
    }
}
