//! CLI command implementations.

pub mod compact;
pub mod inspect_log;
pub mod list_ledgers;
pub mod read_entry;
pub mod read_ledger_index;

use thiserror::Error;

/// Errors raised by the commands themselves, as opposed to the storage.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command only works with one storage engine.
    #[error("{command} needs the {needed} storage, configured storage is {configured}")]
    WrongStorage {
        /// Command name.
        command: &'static str,
        /// Engine the command works with.
        needed: bookie_core::LedgerStorageKind,
        /// Engine in the configuration.
        configured: bookie_core::LedgerStorageKind,
    },

    /// No entry log matched the request.
    #[error("no entry logs found")]
    NoLogs,
}

/// Hex dump of at most `max` bytes, with an ellipsis when truncated.
pub(crate) fn hex_prefix(data: &[u8], max: usize) -> String {
    let mut out: String = data.iter().take(max).map(|b| format!("{b:02x}")).collect();
    if data.len() > max {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_prefix_truncates() {
        assert_eq!(hex_prefix(&[0x01, 0xab], 4), "01ab");
        assert_eq!(hex_prefix(&[1, 2, 3], 2), "0102..");
        assert_eq!(hex_prefix(&[], 2), "");
    }
}
