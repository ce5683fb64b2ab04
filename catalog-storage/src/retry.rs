//! Compare-and-set retry helper

use catalog_core::CatalogResult;
use tracing::warn;

/// Run `attempt`, re-running it up to `retries` more times while it fails
/// with a version conflict.
///
/// `attempt` must re-read whatever it compares against. After the retries
/// are spent the conflict is returned to the caller unchanged.
pub fn retry_on_conflict<T>(
    retries: u32,
    mut attempt: impl FnMut() -> CatalogResult<T>,
) -> CatalogResult<T> {
    let mut tries = 0;
    loop {
        match attempt() {
            Err(e) if e.is_version_conflict() && tries < retries => {
                tries += 1;
                warn!(attempt = tries, error = %e, "Lost compare-and-set race, retrying");
            }
            result => return result,
        }
    }
}
