//! Command tables.
//!
//! | Module | Role |
//! |--------|------|
//! | [`registry`] | generic id ↔ name table, shared with the beacon crate |
//! | [`convert`] | server-side [`Converter`]s for the built-in commands |

pub mod convert;
pub mod registry;

use std::sync::Arc;

pub use convert::{ConvertError, Converter};
pub use registry::{CommandDescriptor, CommandRegistry, RegistryError};

use crate::protocol::BuiltinCommand;
use crate::transfer::TransferManager;

pub type ServerRegistry = CommandRegistry<Arc<dyn Converter>>;

/// Server registry with every built-in command.
pub fn builtin_registry(transfers: Arc<TransferManager>) -> Result<ServerRegistry, RegistryError> {
    let mut reg = ServerRegistry::new();
    for cmd in BuiltinCommand::ALL {
        let handler: Arc<dyn Converter> = match cmd {
            BuiltinCommand::Shell | BuiltinCommand::Upload | BuiltinCommand::Exit => {
                Arc::new(convert::Verbatim)
            }
            BuiltinCommand::Sleep => Arc::new(convert::SleepConverter),
            BuiltinCommand::Download => Arc::new(convert::DownloadConverter::new(transfers.clone())),
        };
        reg.try_register(CommandDescriptor::new(cmd.id(), cmd.name(), handler))?;
    }
    Ok(reg)
}

/// Parse `"<secs> [jitter_pct]"`. Jitter must be within 0–100.
pub fn parse_sleep_args(text: &str) -> Result<(u64, Option<u8>), String> {
    let mut tokens = text.split_whitespace();
    let secs = tokens
        .next()
        .ok_or_else(|| "missing sleep interval".to_string())?
        .parse::<u64>()
        .map_err(|e| format!("bad sleep interval: {e}"))?;
    let jitter = match tokens.next() {
        Some(tok) => {
            let pct = tok
                .parse::<u8>()
                .map_err(|e| format!("bad jitter: {e}"))?;
            if pct > 100 {
                return Err(format!("jitter {pct} exceeds 100"));
            }
            Some(pct)
        }
        None => None,
    };
    if tokens.next().is_some() {
        return Err("expected at most two tokens".into());
    }
    Ok((secs, jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;

    #[test]
    fn builtins_resolve_both_ways() {
        let reg = builtin_registry(Arc::new(TransferManager::new(TransferConfig::default()))).unwrap();
        assert_eq!(reg.len(), 5);
        assert_eq!(reg.resolve_name("shell").unwrap().id, 1);
        assert_eq!(reg.resolve_id(4).unwrap().name, "sleep");
        assert!(reg.resolve_name("keylog").is_none());
    }

    #[test]
    fn sleep_args() {
        assert_eq!(parse_sleep_args("60"), Ok((60, None)));
        assert_eq!(parse_sleep_args(" 5  25 "), Ok((5, Some(25))));
        assert!(parse_sleep_args("5 101").is_err());
        assert!(parse_sleep_args("5 10 x").is_err());
        assert!(parse_sleep_args("-1").is_err());
    }
}
