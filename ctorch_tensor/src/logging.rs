use libc::c_char;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::error::{cstr_to_str, ffi_guard, BridgeError, Status};

pub const LOG_ENV: &str = "CTORCH_LOG";
const DEFAULT_FILTER: &str = "warn";

static INSTALLED: OnceCell<()> = OnceCell::new();

fn build_filter(directive: Option<&str>) -> Result<EnvFilter, BridgeError> {
    match directive {
        Some(d) => EnvFilter::try_new(d)
            .map_err(|e| BridgeError::Invalid(format!("log filter '{d}': {e}"))),
        None => Ok(EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Installs a stderr `tracing` subscriber. `filter` uses `EnvFilter` syntax;
/// null reads `CTORCH_LOG` and falls back to `warn`. Later calls are no-ops,
/// as is installing when the host already set a global subscriber.
///
/// # Safety
/// `filter` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ct_init_logging(filter: *const c_char) -> Status {
    ffi_guard("ct_init_logging", || {
        if INSTALLED.get().is_some() {
            return Ok(());
        }
        let directive = if filter.is_null() {
            None
        } else {
            Some(cstr_to_str(filter, "filter")?)
        };
        let filter = build_filter(directive)?;
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init()
            .is_ok();
        let _ = INSTALLED.set(());
        tracing::debug!(installed, "logging initialised");
        Ok(())
    })
}
