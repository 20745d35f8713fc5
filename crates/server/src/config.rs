//! Configuration loading. There is no config file (§6): everything comes
//! from the environment, via `CrcoachConfig::from_env`.

use anyhow::Result;
use crcoach_protocol::CrcoachConfig;

/// Load configuration from the environment and log validation issues.
///
/// `ERROR:`-prefixed issues are fatal and bail the caller out before the
/// server binds anything; `WARNING:`-prefixed issues are logged and the
/// server starts anyway.
pub fn load_config() -> Result<CrcoachConfig> {
    let config = CrcoachConfig::from_env();

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|issue| issue.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            anyhow::bail!("configuration has {} fatal issue(s), refusing to start", issues.len());
        }
    }

    Ok(config)
}
