//! Transaction parsing and the read-only view consumed by introspection
//! opcodes.
//!
//! The wire format is parsed once by the entry point; the interpreter only
//! ever sees this immutable view.

use bitcoin::{consensus, Transaction, TxIn, TxOut};

use crate::Error;

/// Read-only view over the decoded spending transaction.
#[derive(Debug, Clone)]
pub struct TxView {
    tx: Transaction,
}

impl TxView {
    /// Parses a transaction from wire bytes and re-serializes it to
    /// guarantee the input was the canonical encoding of exactly this
    /// transaction.
    pub fn parse(tx_bytes: &[u8]) -> Result<Self, Error> {
        let tx: Transaction =
            consensus::deserialize(tx_bytes).map_err(|_| Error::ERR_TX_DESERIALIZE)?;

        let canonical = consensus::serialize(&tx);
        if canonical.len() != tx_bytes.len() {
            return Err(Error::ERR_TX_SIZE_MISMATCH);
        }

        Ok(Self { tx })
    }

    /// Ensures `input_index` points to an existing transaction input.
    pub fn ensure_input_index(&self, input_index: usize) -> Result<(), Error> {
        if input_index >= self.tx.input.len() {
            Err(Error::ERR_TX_INDEX)
        } else {
            Ok(())
        }
    }

    pub fn version(&self) -> i32 {
        self.tx.version.0
    }

    pub fn lock_time(&self) -> u32 {
        self.tx.lock_time.to_consensus_u32()
    }

    pub fn input_count(&self) -> usize {
        self.tx.input.len()
    }

    pub fn output_count(&self) -> usize {
        self.tx.output.len()
    }

    pub fn input(&self, index: usize) -> Option<&TxIn> {
        self.tx.input.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&TxOut> {
        self.tx.output.get(index)
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.tx.output
    }
}
