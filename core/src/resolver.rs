//! Target resolution
//!
//! Turns [`TargetCriteria`] into the concrete, ordered, deduplicated target
//! list for a run. Resolution order is always the configuration's declared
//! order; servers supplied without a configuration keep their append order.

use std::collections::BTreeSet;
use tracing::debug;

use crate::{Configuration, Error, Result, Server, TargetCriteria};

/// Resolve criteria against an optional configuration.
///
/// - Empty criteria target every configured server, in declared order.
/// - Explicit tokens match by exact name first, then by unambiguous prefix.
/// - Role tokens contribute the union of their members; a role with no
///   members is an empty contribution, not an error.
/// - Without a configuration, explicit tokens are taken as full hostnames;
///   role criteria then have nothing to match against.
pub fn resolve(criteria: &TargetCriteria, config: Option<&Configuration>) -> Result<Vec<Server>> {
    let Some(config) = config else {
        return resolve_without_config(criteria);
    };

    if criteria.is_empty() {
        if config.is_empty() {
            return Err(Error::NoTargets);
        }
        return Ok(config.servers().to_vec());
    }

    // Union of positions keeps declared order and drops duplicates.
    let mut positions = BTreeSet::new();

    for token in &criteria.servers {
        positions.insert(match_server(config, token)?);
    }

    for role in &criteria.roles {
        positions.extend(config.role_positions(role).iter().copied());
    }

    if positions.is_empty() {
        return Err(Error::NoTargets);
    }

    let targets: Vec<Server> = positions
        .into_iter()
        .map(|idx| config.servers()[idx].clone())
        .collect();

    debug!(count = targets.len(), "Resolved targets");
    Ok(targets)
}

/// Match one explicit token: exact name, else unambiguous prefix
fn match_server(config: &Configuration, token: &str) -> Result<usize> {
    if let Some(idx) = config.position(token) {
        return Ok(idx);
    }

    let candidates: Vec<usize> = config
        .servers()
        .iter()
        .enumerate()
        .filter(|(_, s)| s.name().starts_with(token))
        .map(|(idx, _)| idx)
        .collect();

    match candidates.as_slice() {
        [] => Err(Error::UnknownServer(token.to_string())),
        [idx] => Ok(*idx),
        _ => Err(Error::AmbiguousServer {
            token: token.to_string(),
            candidates: candidates
                .iter()
                .map(|&idx| config.servers()[idx].name().to_string())
                .collect(),
        }),
    }
}

/// Resolution with no configuration: explicit full hostnames only
fn resolve_without_config(criteria: &TargetCriteria) -> Result<Vec<Server>> {
    if !criteria.roles.is_empty() || criteria.servers.is_empty() {
        return Err(Error::NoConfiguration);
    }

    let mut targets: Vec<Server> = Vec::new();
    for token in &criteria.servers {
        if !targets.iter().any(|s| s.name() == token) {
            targets.push(Server::bare(token.clone()));
        }
    }
    Ok(targets)
}
