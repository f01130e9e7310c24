//! Target provisioning through the REST collaborator
//!
//! Before any connection is opened the harness logs in, lists the targets
//! it owns (identified by a remark prefix) and creates more if there are
//! not enough.

mod http;
mod service;
mod types;

use std::collections::HashSet;

use tracing::{debug, info, warn};

pub use http::HttpFixtureService;
pub use service::FixtureService;
pub use types::{
    ApiResponse, FixtureError, LoginData, LoginRequest, SUCCESS_CODE, Target, TargetPage,
    TargetSpec,
};

use crate::config::{Credentials, FixtureConfig};

/// List every target, page by page, until `total` is reached or a page comes
/// back short
pub async fn list_all_targets(
    service: &dyn FixtureService,
    token: &str,
    page_size: u32,
) -> Result<Vec<Target>, FixtureError> {
    let page_size = page_size.max(1);
    let mut all = Vec::new();
    let mut page = 1;

    loop {
        let TargetPage { list, total } = service.list_targets(token, page, page_size).await?;
        let short = list.len() < page_size as usize;
        all.extend(list);
        debug!("Fetched target page {} ({} of {})", page, all.len(), total);

        if all.len() as u64 >= total || short {
            break;
        }
        page += 1;
    }

    Ok(all)
}

/// Log in and return `config.target_count` targets, creating missing ones.
///
/// Fewer targets than requested is accepted with a warning; none at all is
/// [`FixtureError::NoTargets`].
pub async fn provision_targets(
    service: &dyn FixtureService,
    credentials: &Credentials,
    config: &FixtureConfig,
) -> Result<Vec<Target>, FixtureError> {
    let token = service.login(credentials).await?;
    info!("Logged in as {}", credentials.username);

    let existing = list_all_targets(service, &token, config.page_size).await?;
    let mut owned: Vec<Target> = existing
        .into_iter()
        .filter(|t| t.remark.starts_with(&config.remark_prefix))
        .collect();
    info!(
        "Found {} existing targets with remark prefix '{}'",
        owned.len(),
        config.remark_prefix
    );

    if owned.len() >= config.target_count {
        owned.truncate(config.target_count);
        info!("Reusing {} existing targets", owned.len());
        return Ok(owned);
    }

    let taken: HashSet<String> = owned.iter().map(|t| t.remark.clone()).collect();
    let mut created = 0;
    for n in 1..=config.max_create_attempts {
        if owned.len() >= config.target_count {
            break;
        }
        let remark = format!("{}{}", config.remark_prefix, n);
        if taken.contains(&remark) {
            continue;
        }
        match service.create_target(&token, &TargetSpec::active(&remark)).await {
            Ok(target) => {
                debug!("Created target {} ({})", target.key, target.remark);
                owned.push(target);
                created += 1;
            }
            Err(e) => warn!("Creating target '{}' failed: {}", remark, e),
        }
    }
    if created > 0 {
        info!("Created {} targets", created);
    }

    if owned.is_empty() {
        return Err(FixtureError::NoTargets);
    }
    if owned.len() < config.target_count {
        warn!(
            "Only {} targets available, wanted {}",
            owned.len(),
            config.target_count
        );
    }
    Ok(owned)
}
