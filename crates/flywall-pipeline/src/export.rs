//! Running-configuration export

use flywall_common::{Config, Result};
use flywall_store::StateStore;

use crate::apply::{BUCKET_CONFIG, KEY_RUNNING};

/// The configuration last committed, if any.
///
/// For any accepted candidate C, committing C and exporting yields a
/// configuration semantically equal to C modulo optimization-neutral
/// transforms.
pub fn export_running(store: &StateStore) -> Result<Option<Config>> {
    match store.get(BUCKET_CONFIG, KEY_RUNNING) {
        Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
        None => Ok(None),
    }
}
