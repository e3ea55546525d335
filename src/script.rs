//! Script interpreter.

use std::sync::OnceLock;

use bitcoin::hashes::{hash160, ripemd160, sha1, sha256, sha256d, sha512, sha512_256, Hash};
use bitcoin::secp256k1::{self, ecdsa, schnorr, Message, PublicKey, Secp256k1, XOnlyPublicKey};
use sha3::{Digest, Sha3_256};

use crate::context::ExecutionContext;
use crate::script_num::{ScriptNum, MAX_NUM_SIZE};
use crate::state::{AtomicalRef, StateContext, ATOMICAL_REF_SIZE};
use crate::{
    Error, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY,
    VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
};

/// Maximum size of a pushed stack element in bytes.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 4000;
/// Maximum number of non-push operations per script run.
pub const MAX_OPS_PER_SCRIPT: usize = 1_000_000;
/// Maximum script length in bytes.
pub const MAX_SCRIPT_SIZE: usize = 1_000_000;
/// Maximum combined depth of the main stack and altstack.
pub const MAX_STACK_SIZE: usize = 1000;
/// Maximum byte length of a state keyspace or key name.
pub const MAX_STATE_KEY_SIZE: usize = 1024;
/// Lock times at or above this value are interpreted as UNIX timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

const SCRIPTNUM_LOCKTIME_LEN: usize = 5;
const SEQUENCE_FINAL: u32 = 0xffff_ffff;
const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// The AVM opcode table.
///
/// Values below `OP_CHECKAUTHSIG` match the Bitcoin Cash lineage the AVM
/// grew out of; the `0xc0` and up range is AVM-specific.
#[allow(dead_code)]
pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_RESERVED: u8 = 0x50;
    pub const OP_1: u8 = 0x51;
    pub const OP_2: u8 = 0x52;
    pub const OP_3: u8 = 0x53;
    pub const OP_4: u8 = 0x54;
    pub const OP_5: u8 = 0x55;
    pub const OP_6: u8 = 0x56;
    pub const OP_7: u8 = 0x57;
    pub const OP_8: u8 = 0x58;
    pub const OP_9: u8 = 0x59;
    pub const OP_10: u8 = 0x5a;
    pub const OP_11: u8 = 0x5b;
    pub const OP_12: u8 = 0x5c;
    pub const OP_13: u8 = 0x5d;
    pub const OP_14: u8 = 0x5e;
    pub const OP_15: u8 = 0x5f;
    pub const OP_16: u8 = 0x60;

    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;

    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;

    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SPLIT: u8 = 0x7f;
    pub const OP_NUM2BIN: u8 = 0x80;
    pub const OP_BIN2NUM: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;

    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RESERVED1: u8 = 0x89;
    pub const OP_RESERVED2: u8 = 0x8a;

    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;

    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;

    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
    pub const OP_NOP4: u8 = 0xb3;
    pub const OP_NOP5: u8 = 0xb4;
    pub const OP_NOP6: u8 = 0xb5;
    pub const OP_NOP7: u8 = 0xb6;
    pub const OP_NOP8: u8 = 0xb7;
    pub const OP_NOP9: u8 = 0xb8;
    pub const OP_NOP10: u8 = 0xb9;

    pub const OP_CHECKDATASIG: u8 = 0xba;
    pub const OP_CHECKDATASIGVERIFY: u8 = 0xbb;
    pub const OP_REVERSEBYTES: u8 = 0xbc;

    pub const OP_CHECKAUTHSIG: u8 = 0xc0;
    pub const OP_CHECKAUTHSIGVERIFY: u8 = 0xc1;

    pub const OP_TXVERSION: u8 = 0xc2;
    pub const OP_TXINPUTCOUNT: u8 = 0xc3;
    pub const OP_TXOUTPUTCOUNT: u8 = 0xc4;
    pub const OP_TXLOCKTIME: u8 = 0xc5;
    pub const OP_OUTPOINTTXHASH: u8 = 0xc8;
    pub const OP_OUTPOINTINDEX: u8 = 0xc9;
    pub const OP_INPUTBYTECODE: u8 = 0xca;
    pub const OP_INPUTSEQUENCENUMBER: u8 = 0xcb;
    pub const OP_OUTPUTVALUE: u8 = 0xcd;
    pub const OP_OUTPUTBYTECODE: u8 = 0xce;

    pub const OP_NFT_PUT: u8 = 0xd1;
    pub const OP_FT_BALANCE_ADD: u8 = 0xd3;

    pub const OP_KV_EXISTS: u8 = 0xed;
    pub const OP_KV_GET: u8 = 0xef;
    pub const OP_KV_PUT: u8 = 0xf0;
    pub const OP_KV_DELETE: u8 = 0xf1;

    pub const OP_FT_WITHDRAW: u8 = 0xf2;
    pub const OP_NFT_WITHDRAW: u8 = 0xf3;
    pub const OP_FT_BALANCE: u8 = 0xf4;
    pub const OP_FT_COUNT: u8 = 0xf6;
    pub const OP_FT_ITEM: u8 = 0xf7;
    pub const OP_NFT_EXISTS: u8 = 0xf8;
    pub const OP_NFT_COUNT: u8 = 0xf9;
    pub const OP_NFT_ITEM: u8 = 0xfa;

    pub const OP_GETBLOCKINFO: u8 = 0xfb;
    pub const OP_DECODEBLOCKINFO: u8 = 0xfc;
    pub const OP_HASH_FN: u8 = 0xfd;
}

use opcodes::*;

/// Detailed interpreter failure reasons.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ScriptError {
    Ok = 0,
    Unknown,
    EvalFalse,
    OpReturn,

    ScriptSize,
    PushSize,
    OpCount,
    StackSize,

    InvalidOperandSize,
    InvalidNumberRange,
    ImpossibleEncoding,
    InvalidSplitRange,

    Verify,
    EqualVerify,
    NumEqualVerify,
    CheckDataSigVerify,

    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,

    DivByZero,
    ModByZero,

    NegativeLocktime,
    UnsatisfiedLocktime,

    MinimalData,
    SigPushOnly,
    CleanStack,
    MinimalIf,
    SigNullFail,
    PubkeyType,

    DiscourageUpgradableNops,

    ContextNotPresent,
    InvalidTxInputIndex,
    InvalidTxOutputIndex,

    InvalidAtomicalRefSize,
    StateKeyNotFound,
    StateKeySize,
    WithdrawFtAmount,
    WithdrawFt,
    WithdrawFtOutputIndex,
    WithdrawNft,
    WithdrawNftOutputIndex,
    InvalidFtItemIndex,
    InvalidNftItemIndex,
    FtBalanceType,
    NftExistsType,
    FtItemType,
    NftItemType,
    FtCountType,
    NftCountType,
    InvalidBlockInfoItem,
    InvalidBlockInfoHeight,
    InvalidBlockHeaderSize,
    InvalidHashFunc,
    FtBalanceAddInvalid,
    NftPutInvalid,
    CheckAuthSig,
    CheckAuthSigVerify,
    CheckAuthSigNull,

    BigInt,
}

/// Wrapper for script verification flags.
#[derive(Debug, Clone, Copy)]
pub struct ScriptFlags(u32);

const SUPPORTED_FLAGS: u32 =
    VERIFY_CHECKLOCKTIMEVERIFY | VERIFY_CHECKSEQUENCEVERIFY | VERIFY_DISCOURAGE_UPGRADABLE_NOPS;

impl ScriptFlags {
    pub fn from_bits(bits: u32) -> Result<Self, Error> {
        if bits & !SUPPORTED_FLAGS != 0 {
            return Err(Error::ERR_INVALID_FLAGS);
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// A script failure together with the ordinal of the offending instruction,
/// counted from zero within its own script run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvalFailure {
    pub error: ScriptError,
    pub op_num: u32,
}

/// One decoded instruction: the opcode byte and, for pushes, the payload.
#[derive(Debug, Copy, Clone)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub push: Option<&'a [u8]>,
}

/// Decodes the instruction at `*cursor`, advancing the cursor past it.
///
/// Any read past the end of the script is a `BadOpcode`; the element size
/// limit is the dispatcher's concern, not the decoder's.
pub fn next_instruction<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
) -> Result<Instruction<'a>, ScriptError> {
    let opcode = *bytes.get(*cursor).ok_or(ScriptError::BadOpcode)?;
    *cursor += 1;

    let push_len = match opcode {
        OP_0 => return Ok(Instruction { opcode, push: Some(&[]) }),
        len @ 0x01..=0x4b => len as usize,
        OP_PUSHDATA1 => read_push_length(bytes, cursor, 1)?,
        OP_PUSHDATA2 => read_push_length(bytes, cursor, 2)?,
        OP_PUSHDATA4 => read_push_length(bytes, cursor, 4)?,
        _ => return Ok(Instruction { opcode, push: None }),
    };

    let end = cursor.checked_add(push_len).ok_or(ScriptError::BadOpcode)?;
    if end > bytes.len() {
        return Err(ScriptError::BadOpcode);
    }
    let payload = &bytes[*cursor..end];
    *cursor = end;
    Ok(Instruction { opcode, push: Some(payload) })
}

fn read_push_length(
    bytes: &[u8],
    cursor: &mut usize,
    width: usize,
) -> Result<usize, ScriptError> {
    if bytes.len() < *cursor + width {
        return Err(ScriptError::BadOpcode);
    }
    let mut len = 0usize;
    for i in 0..width {
        len |= (bytes[*cursor + i] as usize) << (8 * i);
    }
    *cursor += width;
    Ok(len)
}

/// True when every instruction in `script` is a push.
pub fn is_push_only(script: &[u8]) -> bool {
    let mut cursor = 0usize;
    while cursor < script.len() {
        match next_instruction(script, &mut cursor) {
            Ok(instruction) if instruction.opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

/// True when `opcode` is the canonical (shortest) way to push `data`.
fn is_minimal_push(opcode: u8, data: &[u8]) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 {
        let value = data[0];
        if value == 0x81 {
            return opcode == OP_1NEGATE;
        }
        if (1..=16).contains(&value) {
            return opcode == OP_1 + value - 1;
        }
    }
    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 0xff {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 0xffff {
        return opcode == OP_PUSHDATA2;
    }
    opcode == OP_PUSHDATA4
}

/// Assembles scripts with canonical push encodings.
#[derive(Debug, Default, Clone)]
pub struct ScriptBuilder {
    bytes: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    /// Appends the canonical push of `data`.
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        match data.len() {
            0 => self.bytes.push(OP_0),
            1 if data[0] == 0x81 => self.bytes.push(OP_1NEGATE),
            1 if (1..=16).contains(&data[0]) => self.bytes.push(OP_1 + data[0] - 1),
            len @ 1..=75 => {
                self.bytes.push(len as u8);
                self.bytes.extend_from_slice(data);
            }
            len @ 76..=0xff => {
                self.bytes.push(OP_PUSHDATA1);
                self.bytes.push(len as u8);
                self.bytes.extend_from_slice(data);
            }
            len @ 0x100..=0xffff => {
                self.bytes.push(OP_PUSHDATA2);
                self.bytes.extend_from_slice(&(len as u16).to_le_bytes());
                self.bytes.extend_from_slice(data);
            }
            len => {
                self.bytes.push(OP_PUSHDATA4);
                self.bytes.extend_from_slice(&(len as u32).to_le_bytes());
                self.bytes.extend_from_slice(data);
            }
        }
        self
    }

    /// Appends the canonical push of the minimally encoded number.
    pub fn push_num(self, value: i64) -> Self {
        let encoded = ScriptNum::from(value).to_vec();
        self.push_slice(&encoded)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Condition stack for nested IF/ELSE/ENDIF.
///
/// Only "is empty" and "all true" are observable, so the stack is stored as
/// its size plus the position of the first false entry.
#[derive(Debug, Default)]
struct ConditionStack {
    size: u32,
    first_false: Option<u32>,
}

impl ConditionStack {
    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn all_true(&self) -> bool {
        self.first_false.is_none()
    }

    fn push(&mut self, value: bool) {
        if self.first_false.is_none() && !value {
            self.first_false = Some(self.size);
        }
        self.size += 1;
    }

    fn pop(&mut self) {
        self.size -= 1;
        if self.first_false == Some(self.size) {
            self.first_false = None;
        }
    }

    fn toggle_top(&mut self) {
        match self.first_false {
            None => self.first_false = Some(self.size - 1),
            Some(pos) if pos == self.size - 1 => self.first_false = None,
            // Toggling above the first false is unobservable.
            Some(_) => {}
        }
    }
}

/// Interprets a stack element as a boolean: any non-zero byte is true, except
/// that a trailing 0x80 alone is negative zero.
pub fn cast_to_bool(data: &[u8]) -> bool {
    for (i, &byte) in data.iter().enumerate() {
        if byte != 0 {
            if i == data.len() - 1 && byte == 0x80 {
                return false;
            }
            return true;
        }
    }
    false
}

fn encode_bool(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

static SECP256K1: OnceLock<Secp256k1<secp256k1::VerifyOnly>> = OnceLock::new();

fn with_secp256k1_verification_ctx<R>(
    f: impl FnOnce(&Secp256k1<secp256k1::VerifyOnly>) -> R,
) -> R {
    f(SECP256K1.get_or_init(Secp256k1::verification_only))
}

fn is_valid_pubkey_encoding(pubkey: &[u8]) -> bool {
    if pubkey.len() == 33 {
        matches!(pubkey[0], 0x02 | 0x03)
    } else if pubkey.len() == 65 {
        pubkey[0] == 0x04
    } else {
        false
    }
}

/// Verifies `sig` over a 32-byte message digest.
///
/// A 64-byte signature verifies as Schnorr against the x-only form of the
/// key; anything else parses as lax-DER ECDSA with S normalized.
fn verify_data_signature(sig: &[u8], message_hash: [u8; 32], pubkey_bytes: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
        return false;
    };
    let message = Message::from_digest(message_hash);

    if sig.len() == 64 {
        let Ok(signature) = schnorr::Signature::from_slice(sig) else {
            return false;
        };
        let xonly = XOnlyPublicKey::from(pubkey);
        with_secp256k1_verification_ctx(|secp| {
            secp.verify_schnorr(&signature, &message, &xonly).is_ok()
        })
    } else {
        let Ok(signature) = ecdsa::Signature::from_der_lax(sig) else {
            return false;
        };
        let mut normalized = signature;
        normalized.normalize_s();
        with_secp256k1_verification_ctx(|secp| {
            secp.verify_ecdsa(&message, &normalized, &pubkey).is_ok()
        })
    }
}

// Shift `data` right by `bits` (< 8 * len) with zero fill.
fn shift_right(data: &[u8], bits: usize) -> Vec<u8> {
    let bit_shift = bits % 8;
    let byte_shift = bits / 8;
    let mut result = vec![0u8; data.len()];
    for (i, &byte) in data.iter().enumerate() {
        let k = i + byte_shift;
        if k < data.len() {
            result[k] |= byte >> bit_shift;
        }
        if bit_shift > 0 && k + 1 < data.len() {
            result[k + 1] |= byte << (8 - bit_shift);
        }
    }
    result
}

// Shift `data` left by `bits` (< 8 * len) with zero fill.
fn shift_left(data: &[u8], bits: usize) -> Vec<u8> {
    let bit_shift = bits % 8;
    let byte_shift = bits / 8;
    let mut result = vec![0u8; data.len()];
    for (i, &byte) in data.iter().enumerate() {
        if i < byte_shift {
            continue;
        }
        let k = i - byte_shift;
        result[k] |= byte << bit_shift;
        if bit_shift > 0 && k > 0 {
            result[k - 1] |= byte >> (8 - bit_shift);
        }
    }
    result
}

enum Control {
    Continue,
    Finished,
}

#[derive(Copy, Clone)]
enum TableKind {
    Live,
    Incoming,
}

fn atomref_from_bytes(bytes: &[u8]) -> Result<AtomicalRef, ScriptError> {
    if bytes.len() != ATOMICAL_REF_SIZE {
        return Err(ScriptError::InvalidAtomicalRefSize);
    }
    Ok(AtomicalRef::from_slice(bytes).expect("length checked"))
}

fn parse_table_kind(bytes: &[u8], error: ScriptError) -> Result<TableKind, ScriptError> {
    let kind = ScriptNum::from_slice(bytes, MAX_NUM_SIZE)?;
    match kind.to_index() {
        Some(0) => Ok(TableKind::Live),
        Some(1) => Ok(TableKind::Incoming),
        _ => Err(error),
    }
}

/// The opcode dispatcher.
///
/// One interpreter instance evaluates the unlocking and locking scripts of a
/// single invocation over a shared main stack; the altstack, condition stack
/// and op counter reset per script run.
pub struct Interpreter<'ctx> {
    flags: ScriptFlags,
    context: Option<&'ctx ExecutionContext<'ctx>>,
    state: &'ctx mut StateContext,
    stack: Vec<Vec<u8>>,
    altstack: Vec<Vec<u8>>,
    cond: ConditionStack,
    op_count: usize,
    op_num: u32,
}

impl<'ctx> Interpreter<'ctx> {
    pub fn new(
        flags: ScriptFlags,
        context: Option<&'ctx ExecutionContext<'ctx>>,
        state: &'ctx mut StateContext,
    ) -> Self {
        Self {
            flags,
            context,
            state,
            stack: Vec::new(),
            altstack: Vec::new(),
            cond: ConditionStack::default(),
            op_count: 0,
            op_num: 0,
        }
    }

    pub fn stack(&self) -> &[Vec<u8>] {
        &self.stack
    }

    /// Evaluates one script over the current main stack.
    pub fn eval(&mut self, script: &[u8]) -> Result<(), EvalFailure> {
        self.cond = ConditionStack::default();
        self.altstack.clear();
        self.op_count = 0;
        self.op_num = 0;

        self.run(script).map_err(|error| EvalFailure {
            error,
            op_num: self.op_num,
        })
    }

    fn run(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize);
        }

        let mut cursor = 0usize;
        let mut counter = 0u32;
        while cursor < script.len() {
            self.op_num = counter;
            counter += 1;

            let should_execute = self.cond.all_true();
            let instruction = next_instruction(script, &mut cursor)?;
            let opcode = instruction.opcode;

            if let Some(payload) = instruction.push {
                if payload.len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
            }
            if opcode > OP_16 {
                self.op_count += 1;
                if self.op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
            }
            if matches!(opcode, OP_2MUL | OP_2DIV) {
                return Err(ScriptError::DisabledOpcode);
            }

            if should_execute && opcode <= OP_PUSHDATA4 {
                let payload = instruction.push.expect("push opcodes carry a payload");
                if !is_minimal_push(opcode, payload) {
                    return Err(ScriptError::MinimalData);
                }
                self.stack.push(payload.to_vec());
            } else if should_execute || (OP_IF..=OP_ENDIF).contains(&opcode) {
                match self.execute_opcode(opcode, should_execute)? {
                    Control::Continue => {}
                    Control::Finished => return Ok(()),
                }
            }

            if self.stack.len() + self.altstack.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
        }

        if !self.cond.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::InvalidStackOperation)
    }

    fn top(&self, depth_from_top: usize) -> Result<&Vec<u8>, ScriptError> {
        if self.stack.len() <= depth_from_top {
            return Err(ScriptError::InvalidStackOperation);
        }
        Ok(&self.stack[self.stack.len() - 1 - depth_from_top])
    }

    fn require_depth(&self, depth: usize) -> Result<(), ScriptError> {
        if self.stack.len() < depth {
            return Err(ScriptError::InvalidStackOperation);
        }
        Ok(())
    }

    fn pop_num(&mut self, max_size: usize) -> Result<ScriptNum, ScriptError> {
        let bytes = self.pop()?;
        ScriptNum::from_slice(&bytes, max_size)
    }

    fn context(&self) -> Result<&'ctx ExecutionContext<'ctx>, ScriptError> {
        self.context.ok_or(ScriptError::ContextNotPresent)
    }

    fn verify_top_with_code(&mut self, error: ScriptError) -> Result<(), ScriptError> {
        let value = self.pop()?;
        if !cast_to_bool(&value) {
            return Err(error);
        }
        Ok(())
    }

    fn pop_atomref(&mut self) -> Result<AtomicalRef, ScriptError> {
        let bytes = self.pop()?;
        atomref_from_bytes(&bytes)
    }

    fn pop_table_kind(&mut self, error: ScriptError) -> Result<TableKind, ScriptError> {
        let bytes = self.pop()?;
        parse_table_kind(&bytes, error)
    }

    fn execute_opcode(
        &mut self,
        opcode: u8,
        should_execute: bool,
    ) -> Result<Control, ScriptError> {
        match opcode {
            //
            // Push value
            //
            OP_1NEGATE => self.stack.push(vec![0x81]),
            OP_1..=OP_16 => {
                let value = i64::from(opcode - OP_1 + 1);
                self.stack.push(ScriptNum::from(value).to_vec());
            }

            //
            // Control
            //
            OP_NOP => {}
            OP_CHECKLOCKTIMEVERIFY => {
                if self.flags.contains(VERIFY_CHECKLOCKTIMEVERIFY) {
                    let locktime =
                        ScriptNum::from_slice(self.top(0)?, SCRIPTNUM_LOCKTIME_LEN)?;
                    if locktime.is_negative() {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    self.check_lock_time(locktime.to_i64())?;
                }
            }
            OP_CHECKSEQUENCEVERIFY => {
                if self.flags.contains(VERIFY_CHECKSEQUENCEVERIFY) {
                    let sequence =
                        ScriptNum::from_slice(self.top(0)?, SCRIPTNUM_LOCKTIME_LEN)?;
                    if sequence.is_negative() {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    let sequence = sequence.to_i64();
                    if sequence & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG) == 0 {
                        self.check_sequence(sequence)?;
                    }
                }
            }
            OP_NOP1 | OP_NOP4 | OP_NOP5 | OP_NOP6 | OP_NOP7 | OP_NOP8 | OP_NOP9 | OP_NOP10 => {
                if self.flags.contains(VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }
            OP_IF | OP_NOTIF => {
                let mut value = false;
                if should_execute {
                    if self.stack.is_empty() {
                        return Err(ScriptError::UnbalancedConditional);
                    }
                    let condition = self.pop()?;
                    if condition.len() > 1 || (condition.len() == 1 && condition[0] != 1) {
                        return Err(ScriptError::MinimalIf);
                    }
                    value = cast_to_bool(&condition);
                    if opcode == OP_NOTIF {
                        value = !value;
                    }
                }
                self.cond.push(value);
            }
            OP_ELSE => {
                if self.cond.is_empty() {
                    return Err(ScriptError::UnbalancedConditional);
                }
                self.cond.toggle_top();
            }
            OP_ENDIF => {
                if self.cond.is_empty() {
                    return Err(ScriptError::UnbalancedConditional);
                }
                self.cond.pop();
            }
            OP_VERIFY => {
                if self.stack.is_empty() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                self.verify_top_with_code(ScriptError::Verify)?;
            }
            OP_RETURN => {
                // With an empty stack OP_RETURN terminates the run
                // successfully; the rest of the script is not decoded.
                if self.stack.is_empty() {
                    return Ok(Control::Finished);
                }
                return Err(ScriptError::OpReturn);
            }

            //
            // Stack ops
            //
            OP_TOALTSTACK => {
                let value = self.pop()?;
                self.altstack.push(value);
            }
            OP_FROMALTSTACK => {
                let value = self
                    .altstack
                    .pop()
                    .ok_or(ScriptError::InvalidAltstackOperation)?;
                self.stack.push(value);
            }
            OP_2DROP => {
                self.require_depth(2)?;
                self.stack.pop();
                self.stack.pop();
            }
            OP_2DUP => {
                self.require_depth(2)?;
                let a = self.top(1)?.clone();
                let b = self.top(0)?.clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            OP_3DUP => {
                self.require_depth(3)?;
                let a = self.top(2)?.clone();
                let b = self.top(1)?.clone();
                let c = self.top(0)?.clone();
                self.stack.push(a);
                self.stack.push(b);
                self.stack.push(c);
            }
            OP_2OVER => {
                self.require_depth(4)?;
                let a = self.top(3)?.clone();
                let b = self.top(2)?.clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            OP_2ROT => {
                self.require_depth(6)?;
                let len = self.stack.len();
                let a = self.stack[len - 6].clone();
                let b = self.stack[len - 5].clone();
                self.stack.drain(len - 6..len - 4);
                self.stack.push(a);
                self.stack.push(b);
            }
            OP_2SWAP => {
                self.require_depth(4)?;
                let len = self.stack.len();
                self.stack.swap(len - 4, len - 2);
                self.stack.swap(len - 3, len - 1);
            }
            OP_IFDUP => {
                let value = self.top(0)?.clone();
                if cast_to_bool(&value) {
                    self.stack.push(value);
                }
            }
            OP_DEPTH => {
                let depth = ScriptNum::from(self.stack.len()).to_vec();
                self.stack.push(depth);
            }
            OP_DROP => {
                self.pop()?;
            }
            OP_DUP => {
                let value = self.top(0)?.clone();
                self.stack.push(value);
            }
            OP_NIP => {
                self.require_depth(2)?;
                let idx = self.stack.len() - 2;
                self.stack.remove(idx);
            }
            OP_OVER => {
                let value = self.top(1)?.clone();
                self.stack.push(value);
            }
            OP_PICK | OP_ROLL => {
                self.require_depth(2)?;
                let depth = self.pop_num(MAX_NUM_SIZE)?;
                let Some(depth) = depth.to_index() else {
                    return Err(ScriptError::InvalidStackOperation);
                };
                if depth >= self.stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let idx = self.stack.len() - 1 - depth;
                let value = if opcode == OP_ROLL {
                    self.stack.remove(idx)
                } else {
                    self.stack[idx].clone()
                };
                self.stack.push(value);
            }
            OP_ROT => {
                self.require_depth(3)?;
                let len = self.stack.len();
                self.stack.swap(len - 3, len - 2);
                self.stack.swap(len - 2, len - 1);
            }
            OP_SWAP => {
                self.require_depth(2)?;
                let len = self.stack.len();
                self.stack.swap(len - 2, len - 1);
            }
            OP_TUCK => {
                self.require_depth(2)?;
                let len = self.stack.len();
                let value = self.stack[len - 1].clone();
                self.stack.insert(len - 2, value);
            }
            OP_SIZE => {
                let size = ScriptNum::from(self.top(0)?.len()).to_vec();
                self.stack.push(size);
            }

            //
            // Bitwise logic and shifts
            //
            OP_AND | OP_OR | OP_XOR => {
                self.require_depth(2)?;
                let rhs = self.pop()?;
                let len = self.stack.len();
                let lhs = &mut self.stack[len - 1];
                if lhs.len() != rhs.len() {
                    return Err(ScriptError::InvalidOperandSize);
                }
                match opcode {
                    OP_AND => lhs.iter_mut().zip(&rhs).for_each(|(a, b)| *a &= b),
                    OP_OR => lhs.iter_mut().zip(&rhs).for_each(|(a, b)| *a |= b),
                    _ => lhs.iter_mut().zip(&rhs).for_each(|(a, b)| *a ^= b),
                }
            }
            OP_INVERT => {
                if self.stack.is_empty() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = self.stack.len();
                for byte in &mut self.stack[len - 1] {
                    *byte = !*byte;
                }
            }
            OP_LSHIFT | OP_RSHIFT => {
                self.require_depth(2)?;
                let count = self.pop_num(MAX_NUM_SIZE)?;
                if count.is_negative() {
                    return Err(ScriptError::InvalidNumberRange);
                }
                let data = self.pop()?;
                let total_bits = data.len() * 8;
                let result = if count >= ScriptNum::from(total_bits) {
                    vec![0u8; data.len()]
                } else {
                    // count < 8 * element size here, so it fits a usize.
                    let bits = count.to_index().expect("bounded by total_bits");
                    if opcode == OP_LSHIFT {
                        shift_left(&data, bits)
                    } else {
                        shift_right(&data, bits)
                    }
                };
                self.stack.push(result);
            }

            //
            // Equality
            //
            OP_EQUAL | OP_EQUALVERIFY => {
                self.require_depth(2)?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(encode_bool(a == b));
                if opcode == OP_EQUALVERIFY {
                    self.verify_top_with_code(ScriptError::EqualVerify)?;
                }
            }

            //
            // Numeric
            //
            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                if self.stack.is_empty() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let n = self.pop_num(MAX_NUM_SIZE)?;
                let one = ScriptNum::from(1i64);
                let result = match opcode {
                    OP_1ADD => &n + &one,
                    OP_1SUB => &n - &one,
                    OP_NEGATE => -&n,
                    OP_ABS => n.abs(),
                    OP_NOT => ScriptNum::from(i64::from(n.is_zero())),
                    _ => ScriptNum::from(i64::from(!n.is_zero())),
                };
                self.stack.push(result.to_vec());
            }
            OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MOD | OP_BOOLAND | OP_BOOLOR
            | OP_NUMEQUAL | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL | OP_LESSTHAN
            | OP_GREATERTHAN | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN
            | OP_MAX => {
                self.require_depth(2)?;
                let b = self.pop_num(MAX_NUM_SIZE)?;
                let a = self.pop_num(MAX_NUM_SIZE)?;
                let result = match opcode {
                    OP_ADD => &a + &b,
                    OP_SUB => &a - &b,
                    OP_MUL => &a * &b,
                    OP_DIV => a.checked_div(&b).ok_or(ScriptError::DivByZero)?,
                    OP_MOD => a.checked_rem(&b).ok_or(ScriptError::ModByZero)?,
                    OP_BOOLAND => {
                        ScriptNum::from(i64::from(!a.is_zero() && !b.is_zero()))
                    }
                    OP_BOOLOR => {
                        ScriptNum::from(i64::from(!a.is_zero() || !b.is_zero()))
                    }
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => ScriptNum::from(i64::from(a == b)),
                    OP_NUMNOTEQUAL => ScriptNum::from(i64::from(a != b)),
                    OP_LESSTHAN => ScriptNum::from(i64::from(a < b)),
                    OP_GREATERTHAN => ScriptNum::from(i64::from(a > b)),
                    OP_LESSTHANOREQUAL => ScriptNum::from(i64::from(a <= b)),
                    OP_GREATERTHANOREQUAL => ScriptNum::from(i64::from(a >= b)),
                    OP_MIN => {
                        if a < b {
                            a
                        } else {
                            b
                        }
                    }
                    _ => {
                        if a > b {
                            a
                        } else {
                            b
                        }
                    }
                };
                self.stack.push(result.to_vec());
                if opcode == OP_NUMEQUALVERIFY {
                    self.verify_top_with_code(ScriptError::NumEqualVerify)?;
                }
            }
            OP_WITHIN => {
                self.require_depth(3)?;
                let max = self.pop_num(MAX_NUM_SIZE)?;
                let min = self.pop_num(MAX_NUM_SIZE)?;
                let value = self.pop_num(MAX_NUM_SIZE)?;
                self.stack.push(encode_bool(min <= value && value < max));
            }

            //
            // Byte string operations
            //
            OP_CAT => {
                self.require_depth(2)?;
                let rhs = self.pop()?;
                let len = self.stack.len();
                let lhs = &mut self.stack[len - 1];
                if lhs.len() + rhs.len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                lhs.extend_from_slice(&rhs);
            }
            OP_SPLIT => {
                self.require_depth(2)?;
                let position = self.pop_num(MAX_NUM_SIZE)?;
                let data = self.pop()?;
                let Some(position) = position.to_index() else {
                    return Err(ScriptError::InvalidSplitRange);
                };
                if position > data.len() {
                    return Err(ScriptError::InvalidSplitRange);
                }
                let tail = data[position..].to_vec();
                let head = data[..position].to_vec();
                self.stack.push(head);
                self.stack.push(tail);
            }
            OP_REVERSEBYTES => {
                if self.stack.is_empty() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = self.stack.len();
                self.stack[len - 1].reverse();
            }
            OP_NUM2BIN => {
                self.require_depth(2)?;
                let requested = self.pop_num(MAX_NUM_SIZE)?;
                let Some(size) = requested.to_index() else {
                    return Err(ScriptError::PushSize);
                };
                if size > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                let len = self.stack.len();
                if len == 0 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let rawnum = &mut self.stack[len - 1];
                crate::bigint::minimally_encode(rawnum);
                if rawnum.len() > size {
                    return Err(ScriptError::ImpossibleEncoding);
                }
                if rawnum.len() < size {
                    let mut signbit = 0x00;
                    if let Some(last) = rawnum.last_mut() {
                        signbit = *last & 0x80;
                        *last &= 0x7f;
                    }
                    rawnum.resize(size, 0x00);
                    *rawnum.last_mut().expect("size is positive") = signbit;
                }
            }
            OP_BIN2NUM => {
                if self.stack.is_empty() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = self.stack.len();
                let data = &mut self.stack[len - 1];
                crate::bigint::minimally_encode(data);
                if !crate::bigint::is_minimally_encoded(data, MAX_NUM_SIZE) {
                    return Err(ScriptError::InvalidNumberRange);
                }
            }

            //
            // Crypto
            //
            OP_RIPEMD160 => {
                let data = self.pop()?;
                let hash = ripemd160::Hash::hash(&data);
                self.stack.push(hash.to_byte_array().to_vec());
            }
            OP_SHA1 => {
                let data = self.pop()?;
                let hash = sha1::Hash::hash(&data);
                self.stack.push(hash.to_byte_array().to_vec());
            }
            OP_SHA256 => {
                let data = self.pop()?;
                let hash = sha256::Hash::hash(&data);
                self.stack.push(hash.to_byte_array().to_vec());
            }
            OP_HASH160 => {
                let data = self.pop()?;
                let hash = hash160::Hash::hash(&data);
                self.stack.push(hash.to_byte_array().to_vec());
            }
            OP_HASH256 => {
                let data = self.pop()?;
                let hash = sha256d::Hash::hash(&data);
                self.stack.push(hash.to_byte_array().to_vec());
            }
            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                self.require_depth(3)?;
                let pubkey = self.pop()?;
                let message = self.pop()?;
                let sig = self.pop()?;

                // The key encoding is checked even when the signature is
                // empty and no verification happens.
                if !is_valid_pubkey_encoding(&pubkey) {
                    return Err(ScriptError::PubkeyType);
                }

                let mut success = false;
                if !sig.is_empty() {
                    let digest = sha256::Hash::hash(&message).to_byte_array();
                    success = verify_data_signature(&sig, digest, &pubkey);
                    // A signature that fails to verify may only be the empty
                    // string.
                    if !success {
                        return Err(ScriptError::SigNullFail);
                    }
                }
                self.stack.push(encode_bool(success));
                if opcode == OP_CHECKDATASIGVERIFY {
                    self.verify_top_with_code(ScriptError::CheckDataSigVerify)?;
                }
            }
            OP_CHECKAUTHSIG | OP_CHECKAUTHSIGVERIFY => {
                let context = self.context()?;
                let auth_sig = context.auth_signature();
                let auth_pubkey = context.auth_pubkey();
                if auth_sig.is_some() || auth_pubkey.is_some() {
                    let (Some(sig), Some(pubkey)) = (auth_sig, auth_pubkey) else {
                        return Err(ScriptError::CheckAuthSig);
                    };
                    if sig.is_empty() || !is_valid_pubkey_encoding(pubkey) {
                        return Err(ScriptError::CheckAuthSig);
                    }
                    let message = context.auth_message();
                    let digest = sha256::Hash::hash(&message).to_byte_array();
                    if !verify_data_signature(&sig, digest, pubkey) {
                        return Err(ScriptError::CheckAuthSigNull);
                    }
                    self.stack.push(pubkey.to_vec());
                } else if opcode == OP_CHECKAUTHSIGVERIFY {
                    return Err(ScriptError::CheckAuthSigVerify);
                } else {
                    self.stack.push(encode_bool(false));
                }
            }

            //
            // Native introspection (nullary)
            //
            OP_TXVERSION | OP_TXINPUTCOUNT | OP_TXOUTPUTCOUNT | OP_TXLOCKTIME => {
                let tx = self.context()?.tx();
                let value = match opcode {
                    OP_TXVERSION => ScriptNum::from(tx.version()),
                    OP_TXINPUTCOUNT => ScriptNum::from(tx.input_count()),
                    OP_TXOUTPUTCOUNT => ScriptNum::from(tx.output_count()),
                    _ => ScriptNum::from(tx.lock_time()),
                };
                self.stack.push(value.to_vec());
            }

            //
            // Native introspection (unary)
            //
            OP_OUTPOINTTXHASH | OP_OUTPOINTINDEX | OP_INPUTBYTECODE
            | OP_INPUTSEQUENCENUMBER | OP_OUTPUTVALUE | OP_OUTPUTBYTECODE => {
                let tx = self.context()?.tx();
                if self.stack.is_empty() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let index = self.pop_num(MAX_NUM_SIZE)?.to_index();

                match opcode {
                    OP_OUTPOINTTXHASH | OP_OUTPOINTINDEX | OP_INPUTBYTECODE
                    | OP_INPUTSEQUENCENUMBER => {
                        let input = index
                            .and_then(|i| tx.input(i))
                            .ok_or(ScriptError::InvalidTxInputIndex)?;
                        match opcode {
                            OP_OUTPOINTTXHASH => {
                                let txid = input.previous_output.txid;
                                self.stack.push(txid.to_byte_array().to_vec());
                            }
                            OP_OUTPOINTINDEX => {
                                let n = ScriptNum::from(input.previous_output.vout);
                                self.stack.push(n.to_vec());
                            }
                            OP_INPUTBYTECODE => {
                                let bytecode = input.script_sig.as_bytes();
                                if bytecode.len() > MAX_SCRIPT_ELEMENT_SIZE {
                                    return Err(ScriptError::PushSize);
                                }
                                self.stack.push(bytecode.to_vec());
                            }
                            _ => {
                                let n = ScriptNum::from(input.sequence.0);
                                self.stack.push(n.to_vec());
                            }
                        }
                    }
                    _ => {
                        let output = index
                            .and_then(|i| tx.output(i))
                            .ok_or(ScriptError::InvalidTxOutputIndex)?;
                        if opcode == OP_OUTPUTVALUE {
                            let n = ScriptNum::from(output.value.to_sat() as i64);
                            self.stack.push(n.to_vec());
                        } else {
                            let bytecode = output.script_pubkey.as_bytes();
                            if bytecode.len() > MAX_SCRIPT_ELEMENT_SIZE {
                                return Err(ScriptError::PushSize);
                            }
                            self.stack.push(bytecode.to_vec());
                        }
                    }
                }
            }

            //
            // AVM token opcodes (unary)
            //
            OP_FT_BALANCE_ADD | OP_NFT_PUT | OP_FT_COUNT | OP_NFT_COUNT => {
                self.context()?;
                if self.stack.is_empty() {
                    return Err(ScriptError::InvalidStackOperation);
                }

                match opcode {
                    OP_FT_BALANCE_ADD => {
                        let atomref = self.pop_atomref()?;
                        if !self.state.ft_balance_add(&atomref) {
                            return Err(ScriptError::FtBalanceAddInvalid);
                        }
                    }
                    OP_NFT_PUT => {
                        let atomref = self.pop_atomref()?;
                        if !self.state.nft_put(&atomref) {
                            return Err(ScriptError::NftPutInvalid);
                        }
                    }
                    OP_FT_COUNT => {
                        let count = match self.pop_table_kind(ScriptError::FtCountType)? {
                            TableKind::Live => self.state.ft_count(),
                            TableKind::Incoming => self.state.ft_count_incoming(),
                        };
                        self.stack.push(ScriptNum::from(count).to_vec());
                    }
                    _ => {
                        let count = match self.pop_table_kind(ScriptError::NftCountType)? {
                            TableKind::Live => self.state.nft_count(),
                            TableKind::Incoming => self.state.nft_count_incoming(),
                        };
                        self.stack.push(ScriptNum::from(count).to_vec());
                    }
                }
            }

            //
            // AVM opcodes (binary)
            //
            OP_KV_EXISTS | OP_KV_GET | OP_KV_DELETE | OP_NFT_WITHDRAW | OP_HASH_FN
            | OP_GETBLOCKINFO | OP_DECODEBLOCKINFO | OP_FT_BALANCE | OP_FT_ITEM
            | OP_NFT_ITEM | OP_NFT_EXISTS => {
                self.context()?;
                self.require_depth(2)?;

                match opcode {
                    OP_KV_EXISTS => {
                        let key = self.pop()?;
                        let keyspace = self.pop()?;
                        let exists = self.state.kv_exists(&keyspace, &key);
                        self.stack.push(encode_bool(exists));
                    }
                    OP_KV_GET => {
                        let key = self.pop()?;
                        let keyspace = self.pop()?;
                        let value = self
                            .state
                            .kv_get(&keyspace, &key)
                            .ok_or(ScriptError::StateKeyNotFound)?;
                        self.stack.push(value);
                    }
                    OP_KV_DELETE => {
                        let key = self.pop()?;
                        let keyspace = self.pop()?;
                        self.state.kv_delete(&keyspace, &key);
                    }
                    OP_NFT_WITHDRAW => {
                        let atomref = self.pop_atomref()?;
                        let index = self.pop_num(MAX_NUM_SIZE)?;
                        let tx = self.context()?.tx();
                        let index = index
                            .to_index()
                            .filter(|&i| i < tx.output_count())
                            .ok_or(ScriptError::WithdrawNftOutputIndex)?;
                        if !self.state.nft_withdraw(&atomref, index as u32) {
                            return Err(ScriptError::WithdrawNft);
                        }
                    }
                    OP_HASH_FN => {
                        let algo = self.pop_num(MAX_NUM_SIZE)?;
                        let data = self.pop()?;
                        let algo = algo
                            .to_index()
                            .filter(|&a| a <= 3)
                            .ok_or(ScriptError::InvalidHashFunc)?;
                        let digest = match algo {
                            0 => Sha3_256::digest(&data).to_vec(),
                            1 => sha512::Hash::hash(&data).to_byte_array().to_vec(),
                            2 => sha512_256::Hash::hash(&data).to_byte_array().to_vec(),
                            _ => {
                                let mut output = [0u8; 32];
                                eaglesong::eaglesong(&data, &mut output);
                                output.to_vec()
                            }
                        };
                        self.stack.push(digest);
                    }
                    OP_GETBLOCKINFO => {
                        let field = self.pop_num(MAX_NUM_SIZE)?;
                        let height = self.pop_num(MAX_NUM_SIZE)?;
                        let field = field
                            .to_index()
                            .filter(|&f| f <= 8)
                            .ok_or(ScriptError::InvalidBlockInfoItem)?;
                        let height = height
                            .to_index()
                            .map(|h| h as u32)
                            .ok_or(ScriptError::InvalidBlockInfoHeight)?;
                        let info = self.state.block_info(height)?;
                        let element = match field {
                            0 => ScriptNum::from(info.header.version.to_consensus()).to_vec(),
                            1 => info.header.prev_blockhash.to_byte_array().to_vec(),
                            2 => info.header.merkle_root.to_byte_array().to_vec(),
                            3 => ScriptNum::from(info.header.time).to_vec(),
                            4 => ScriptNum::from(info.header.bits.to_consensus()).to_vec(),
                            5 => ScriptNum::from(info.header.nonce).to_vec(),
                            6 => {
                                let difficulty = crate::state::header_difficulty(
                                    info.header.bits.to_consensus(),
                                );
                                ScriptNum::from(difficulty).to_vec()
                            }
                            7 => info.raw.to_vec(),
                            _ => ScriptNum::from(info.height).to_vec(),
                        };
                        self.stack.push(element);
                    }
                    OP_DECODEBLOCKINFO => {
                        let field = self.pop_num(MAX_NUM_SIZE)?;
                        let raw = self.pop()?;
                        if raw.len() != 80 {
                            return Err(ScriptError::InvalidBlockHeaderSize);
                        }
                        let field = field
                            .to_index()
                            .filter(|&f| f <= 6)
                            .ok_or(ScriptError::InvalidBlockInfoItem)?;
                        let header = crate::state::decode_header(&raw)?;
                        let element = match field {
                            0 => ScriptNum::from(header.version.to_consensus()).to_vec(),
                            1 => header.prev_blockhash.to_byte_array().to_vec(),
                            2 => header.merkle_root.to_byte_array().to_vec(),
                            3 => ScriptNum::from(header.time).to_vec(),
                            4 => ScriptNum::from(header.bits.to_consensus()).to_vec(),
                            5 => ScriptNum::from(header.nonce).to_vec(),
                            _ => {
                                let difficulty = crate::state::header_difficulty(
                                    header.bits.to_consensus(),
                                );
                                ScriptNum::from(difficulty).to_vec()
                            }
                        };
                        self.stack.push(element);
                    }
                    OP_FT_BALANCE => {
                        // The atomref operand below the type is validated
                        // first.
                        let kind_bytes = self.pop()?;
                        let atomref = self.pop_atomref()?;
                        let kind = parse_table_kind(&kind_bytes, ScriptError::FtBalanceType)?;
                        let balance = match kind {
                            TableKind::Live => self.state.ft_balance(&atomref),
                            TableKind::Incoming => self.state.ft_balance_incoming(&atomref),
                        };
                        self.stack.push(ScriptNum::from(balance).to_vec());
                    }
                    OP_NFT_EXISTS => {
                        let kind_bytes = self.pop()?;
                        let atomref = self.pop_atomref()?;
                        let kind = parse_table_kind(&kind_bytes, ScriptError::NftExistsType)?;
                        let exists = match kind {
                            TableKind::Live => self.state.nft_exists(&atomref),
                            TableKind::Incoming => self.state.nft_exists_incoming(&atomref),
                        };
                        self.stack.push(encode_bool(exists));
                    }
                    OP_FT_ITEM => {
                        let kind_bytes = self.pop()?;
                        let index = self
                            .pop_num(MAX_NUM_SIZE)?
                            .to_index()
                            .ok_or(ScriptError::InvalidFtItemIndex)?;
                        let kind = parse_table_kind(&kind_bytes, ScriptError::FtItemType)?;
                        let item = match kind {
                            TableKind::Live => self.state.ft_item(index),
                            TableKind::Incoming => self.state.ft_item_incoming(index),
                        };
                        let atomref = item.ok_or(ScriptError::InvalidFtItemIndex)?;
                        self.stack.push(atomref.as_bytes().to_vec());
                    }
                    _ => {
                        let kind_bytes = self.pop()?;
                        let index = self
                            .pop_num(MAX_NUM_SIZE)?
                            .to_index()
                            .ok_or(ScriptError::InvalidNftItemIndex)?;
                        let kind = parse_table_kind(&kind_bytes, ScriptError::NftItemType)?;
                        let item = match kind {
                            TableKind::Live => self.state.nft_item(index),
                            TableKind::Incoming => self.state.nft_item_incoming(index),
                        };
                        let atomref = item.ok_or(ScriptError::InvalidNftItemIndex)?;
                        self.stack.push(atomref.as_bytes().to_vec());
                    }
                }
            }

            //
            // AVM opcodes (ternary)
            //
            OP_KV_PUT | OP_FT_WITHDRAW => {
                self.context()?;
                self.require_depth(3)?;

                if opcode == OP_KV_PUT {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let keyspace = self.pop()?;
                    if keyspace.len() > MAX_STATE_KEY_SIZE || key.len() > MAX_STATE_KEY_SIZE {
                        return Err(ScriptError::StateKeySize);
                    }
                    self.state.kv_put(&keyspace, &key, &value);
                } else {
                    let atomref = self.pop_atomref()?;
                    let index = self.pop_num(MAX_NUM_SIZE)?;
                    let amount = self.pop_num(MAX_NUM_SIZE)?;
                    let tx = self.context()?.tx();
                    let index = index
                        .to_index()
                        .filter(|&i| i < tx.output_count())
                        .ok_or(ScriptError::WithdrawFtOutputIndex)?;
                    let output_value = tx
                        .output(index)
                        .expect("index validated")
                        .value
                        .to_sat() as i64;
                    let amount = amount.to_i64();
                    if amount <= 0 || amount > output_value {
                        return Err(ScriptError::WithdrawFtAmount);
                    }
                    if !self
                        .state
                        .ft_withdraw(&atomref, index as u32, amount as u64)
                    {
                        return Err(ScriptError::WithdrawFt);
                    }
                }
            }

            _ => return Err(ScriptError::BadOpcode),
        }

        Ok(Control::Continue)
    }

    fn check_lock_time(&self, lock_time: i64) -> Result<(), ScriptError> {
        if lock_time > i64::from(u32::MAX) {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        let lock_time = lock_time as u32;

        let tx = self.context()?.tx();
        let tx_lock = tx.lock_time();

        // Height locks and time locks are incomparable.
        if (tx_lock < LOCKTIME_THRESHOLD) != (lock_time < LOCKTIME_THRESHOLD) {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if lock_time > tx_lock {
            return Err(ScriptError::UnsatisfiedLocktime);
        }

        let sequence = tx
            .input(0)
            .ok_or(ScriptError::ContextNotPresent)?
            .sequence
            .0;
        if sequence == SEQUENCE_FINAL {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }

    fn check_sequence(&self, sequence: i64) -> Result<(), ScriptError> {
        if sequence > i64::from(u32::MAX) {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        let sequence = sequence as u32;

        let tx = self.context()?.tx();
        if tx.version() < 2 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }

        let tx_sequence = tx
            .input(0)
            .ok_or(ScriptError::ContextNotPresent)?
            .sequence
            .0;
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }

        let mask = SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK;
        let tx_masked = tx_sequence & mask;
        let op_masked = sequence & mask;

        let tx_is_time = tx_masked >= SEQUENCE_LOCKTIME_TYPE_FLAG;
        let op_is_time = op_masked >= SEQUENCE_LOCKTIME_TYPE_FLAG;
        if tx_is_time != op_is_time {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if op_masked > tx_masked {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }
}

/// Runs the unlocking and locking scripts of one invocation.
///
/// The unlocking script must be push-only. Both scripts share a single main
/// stack; on completion exactly one truthy element must remain.
pub fn verify_scripts(
    unlock: &[u8],
    lock: &[u8],
    flags: ScriptFlags,
    context: Option<&ExecutionContext<'_>>,
    state: &mut StateContext,
) -> Result<(), EvalFailure> {
    if !is_push_only(unlock) {
        return Err(EvalFailure {
            error: ScriptError::SigPushOnly,
            op_num: 0,
        });
    }

    let mut interpreter = Interpreter::new(flags, context, state);
    interpreter.eval(unlock)?;
    interpreter.eval(lock)?;

    let stack = interpreter.stack();
    let truthy = stack.last().map(|top| cast_to_bool(top)).unwrap_or(false);
    if !truthy {
        return Err(EvalFailure {
            error: ScriptError::EvalFalse,
            op_num: interpreter.op_num,
        });
    }
    if stack.len() != 1 {
        return Err(EvalFailure {
            error: ScriptError::CleanStack,
            op_num: interpreter.op_num,
        });
    }
    Ok(())
}
