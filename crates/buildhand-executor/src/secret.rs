//! Secret injection.
//!
//! Secrets resolve by name against the build's pre-populated secret map
//! and land in the container environment before substitution runs, so
//! user-declared variables can reference them.

use dashmap::DashMap;
use tracing::debug;

use buildhand_core::{Container, Secret};

use crate::{ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Injects every secret the container references into its environment.
///
/// Fails when a secret is unknown, or when its origin restricts it to a
/// different container name.
pub fn inject(ctn: &mut Container, secrets: &DashMap<String, Secret>) -> ExecutorResult {
    for reference in ctn.secrets.clone() {
        let secret = secrets.get(&reference.source).ok_or_else(|| {
            ExecutorError::from(ExecutorErrorKind::InvalidConfiguration {
                reason: format!("unknown secret '{}'", reference.source),
            })
        })?;

        if !secret.allows(&ctn.name) {
            return Err(ExecutorError::from(ExecutorErrorKind::SecretDenied {
                secret: reference.source.clone(),
                container: ctn.name.clone(),
            }));
        }

        debug!(secret = %reference.source, target = %reference.target, "injecting secret");
        ctn.environment
            .insert(reference.target.clone(), secret.value.clone());
    }

    Ok(())
}
