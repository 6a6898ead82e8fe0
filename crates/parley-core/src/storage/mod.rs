mod sqlite;

pub use sqlite::SqliteStorage;

use std::path::PathBuf;

use crate::config::SessionConfig;
use crate::error::Result;

/// Open the session mirror described by `config`.
/// Default path: `~/.config/parley/sessions.db`.
pub fn open_session_mirror(config: &SessionConfig) -> Result<SqliteStorage> {
    let path = match &config.path {
        Some(p) => PathBuf::from(p),
        None => crate::config::state_dir()?.join("sessions.db"),
    };
    SqliteStorage::open(path)
}
