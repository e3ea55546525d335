//! Pure-Rust implementation of the `libatomicalsconsensus` API surface.
//!
//! The crate validates a single Atomicals Virtual Machine contract
//! invocation: it executes an unlocking and a locking script as one program
//! over a shared stack, applies the token and key/value opcodes to a staged
//! copy of the contract state, and on success returns the updated state
//! documents together with a digest chaining them to the prior state hash.
//!
//! One invocation is sequential, deterministic and reentrant; no state
//! outlives the call.

mod bigint;
mod context;
mod script;
mod script_num;
mod state;
mod tx;

pub mod ffi;
pub mod types;

use core::fmt;

pub use crate::context::ExecutionContext;
pub use crate::script::{
    opcodes, EvalFailure, ScriptBuilder, ScriptError, ScriptFlags, MAX_OPS_PER_SCRIPT,
    MAX_SCRIPT_ELEMENT_SIZE, MAX_SCRIPT_SIZE, MAX_STACK_SIZE, MAX_STATE_KEY_SIZE,
};
pub use crate::script_num::ScriptNum;
pub use crate::state::{
    AtomicalRef, FinalizedState, StateContext, StateDocuments, StateLimits, ATOMICAL_REF_SIZE,
};
pub use crate::tx::TxView;

use crate::types::c_uint;

/// Do not enable any verification flags.
pub const VERIFY_NONE: c_uint = 0;
/// Enable OP_CHECKLOCKTIMEVERIFY.
pub const VERIFY_CHECKLOCKTIMEVERIFY: c_uint = 1 << 0;
/// Enable OP_CHECKSEQUENCEVERIFY.
pub const VERIFY_CHECKSEQUENCEVERIFY: c_uint = 1 << 1;
/// Reject use of the upgradable NOP opcodes.
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: c_uint = 1 << 2;

/// Version of the `libatomicalsconsensus` API this crate mimics.
pub const CONSENSUS_API_VERSION: u32 = 1;

/// Returns the API version.
pub fn version() -> u32 {
    CONSENSUS_API_VERSION
}

/// Errors returned on the host boundary.
///
/// The variants up to `ERR_STATE_NFT_BALANCES_UPDATES_SIZE_ERROR` mirror the
/// identifiers exposed by `libatomicalsconsensus`; the two deserialization
/// variants are appended so malformed input surfaces as a typed error.
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub enum Error {
    /// No host-level error; consult the script error instead.
    ERR_OK = 0,
    /// The transaction has no input to verify.
    ERR_TX_INDEX,
    /// `tx_to` was not the canonical serialization of the transaction.
    ERR_TX_SIZE_MISMATCH,
    /// Verification `flags` are invalid.
    ERR_INVALID_FLAGS,
    /// A recorded FT withdrawal does not match the transaction outputs.
    ERR_INVALID_FT_WITHDRAW,
    /// A recorded NFT withdrawal does not match the transaction outputs.
    ERR_INVALID_NFT_WITHDRAW,
    /// The final contract state exceeds its byte budget.
    ERR_STATE_SIZE_ERROR,
    /// The update journal exceeds its byte budget.
    ERR_STATE_UPDATES_SIZE_ERROR,
    /// The delete journal exceeds its byte budget.
    ERR_STATE_DELETES_SIZE_ERROR,
    /// The FT balance table exceeds its byte budget.
    ERR_STATE_FT_BALANCES_SIZE_ERROR,
    /// The FT balance update table exceeds its byte budget.
    ERR_STATE_FT_BALANCES_UPDATES_SIZE_ERROR,
    /// The NFT balance table exceeds its byte budget.
    ERR_STATE_NFT_BALANCES_SIZE_ERROR,
    /// The NFT balance update table exceeds its byte budget.
    ERR_STATE_NFT_BALANCES_UPDATES_SIZE_ERROR,
    /// An error deserializing `tx_to`.
    ERR_TX_DESERIALIZE,
    /// An error deserializing or validating a CBOR state document.
    ERR_STATE_DESERIALIZE,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;

        let description = match *self {
            ERR_OK => "no host-level error",
            ERR_TX_INDEX => "the transaction has no input to verify",
            ERR_TX_SIZE_MISMATCH => "txTo was not the canonical transaction serialization",
            ERR_INVALID_FLAGS => "script verification flags are invalid",
            ERR_INVALID_FT_WITHDRAW => "an ft withdrawal does not match the outputs",
            ERR_INVALID_NFT_WITHDRAW => "an nft withdrawal does not match the outputs",
            ERR_STATE_SIZE_ERROR => "final contract state exceeds its size limit",
            ERR_STATE_UPDATES_SIZE_ERROR => "state update journal exceeds its size limit",
            ERR_STATE_DELETES_SIZE_ERROR => "state delete journal exceeds its size limit",
            ERR_STATE_FT_BALANCES_SIZE_ERROR => "ft balances exceed their size limit",
            ERR_STATE_FT_BALANCES_UPDATES_SIZE_ERROR => {
                "ft balance updates exceed their size limit"
            }
            ERR_STATE_NFT_BALANCES_SIZE_ERROR => "nft balances exceed their size limit",
            ERR_STATE_NFT_BALANCES_UPDATES_SIZE_ERROR => {
                "nft balance updates exceed their size limit"
            }
            ERR_TX_DESERIALIZE => "an error deserializing txTo",
            ERR_STATE_DESERIALIZE => "an error deserializing a state document",
        };

        f.write_str(description)
    }
}

impl std::error::Error for Error {}

/// Detailed failure information for one invocation.
///
/// Host-level failures carry an [`Error`] with `script_error` set to
/// [`ScriptError::Ok`]; interpreter stops carry [`Error::ERR_OK`] with the
/// script error and the zero-based ordinal of the failing instruction within
/// its script run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    pub error: Error,
    pub script_error: ScriptError,
    pub script_error_op_num: u32,
}

impl ScriptFailure {
    fn host(error: Error) -> Self {
        Self {
            error,
            script_error: ScriptError::Ok,
            script_error_op_num: 0,
        }
    }

    fn script(failure: EvalFailure) -> Self {
        Self {
            error: Error::ERR_OK,
            script_error: failure.error,
            script_error_op_num: failure.op_num,
        }
    }
}

/// All inputs of one contract invocation. Byte buffers are borrowed for the
/// duration of the call.
#[derive(Debug, Copy, Clone)]
pub struct VerifyRequest<'a> {
    pub lock_script: &'a [u8],
    pub unlock_script: &'a [u8],
    /// Wire-encoded spending transaction.
    pub tx_to: &'a [u8],
    /// Optional raw compressed or uncompressed authorization public key.
    pub auth_pubkey: Option<&'a [u8]>,
    /// CBOR state snapshots.
    pub ft_state: &'a [u8],
    pub ft_state_incoming: &'a [u8],
    pub nft_state: &'a [u8],
    pub nft_state_incoming: &'a [u8],
    pub contract_state: &'a [u8],
    pub contract_external_state: &'a [u8],
    pub prev_state_hash: [u8; 32],
    /// Script verification flags; zero on the consensus boundary.
    pub flags: u32,
}

/// Validates a single contract invocation with the default state limits.
pub fn verify_script_avm(request: &VerifyRequest<'_>) -> Result<FinalizedState, ScriptFailure> {
    verify_script_avm_with_limits(request, StateLimits::default())
}

/// Validates a single contract invocation against host-supplied state
/// limits.
pub fn verify_script_avm_with_limits(
    request: &VerifyRequest<'_>,
    limits: StateLimits,
) -> Result<FinalizedState, ScriptFailure> {
    let flags = ScriptFlags::from_bits(request.flags).map_err(ScriptFailure::host)?;

    let tx = TxView::parse(request.tx_to).map_err(ScriptFailure::host)?;
    tx.ensure_input_index(0).map_err(ScriptFailure::host)?;

    let mut state = StateContext::from_documents(
        StateDocuments {
            ft_state: request.ft_state,
            ft_state_incoming: request.ft_state_incoming,
            nft_state: request.nft_state,
            nft_state_incoming: request.nft_state_incoming,
            contract_state: request.contract_state,
            contract_external_state: request.contract_external_state,
        },
        limits,
    )
    .map_err(ScriptFailure::host)?;

    let context = ExecutionContext::new(
        &tx,
        request.unlock_script,
        request.lock_script,
        request.auth_pubkey,
    );

    script::verify_scripts(
        request.unlock_script,
        request.lock_script,
        flags,
        Some(&context),
        &mut state,
    )
    .map_err(ScriptFailure::script)?;

    validate_withdraws(&state, &tx)?;

    state
        .finalize(&request.prev_state_hash)
        .map_err(ScriptFailure::host)
}

/// Re-checks every recorded withdrawal against the transaction outputs
/// before the results leave the sandbox.
fn validate_withdraws(state: &StateContext, tx: &TxView) -> Result<(), ScriptFailure> {
    for outputs in state.ft_withdraw_map().values() {
        for (&output_index, &amount) in outputs {
            let valid = amount > 0
                && tx
                    .output(output_index as usize)
                    .map(|output| amount <= output.value.to_sat())
                    .unwrap_or(false);
            if !valid {
                return Err(ScriptFailure::host(Error::ERR_INVALID_FT_WITHDRAW));
            }
        }
    }
    for &output_index in state.nft_withdraw_map().values() {
        if tx.output(output_index as usize).is_none() {
            return Err(ScriptFailure::host(Error::ERR_INVALID_NFT_WITHDRAW));
        }
    }
    Ok(())
}
