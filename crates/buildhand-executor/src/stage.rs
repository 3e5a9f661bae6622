//! Stage scheduling.
//!
//! Stages run concurrently when the `needs` graph permits: stages are
//! grouped into dependency waves (a stage lands in the wave after its
//! deepest dependency) and each wave runs as a set of concurrent tasks.
//! Within a stage, steps run sequentially; a failing step flips the
//! build's gating status, and subsequent steps whose rulesets only match a
//! succeeding build are recorded as skipped.

use futures_util::future::join_all;
use std::collections::HashMap;
use tracing::{debug, info};

use buildhand_core::{RuleData, Stage, Status};

use crate::{Engine, ExecutorError, ExecutorErrorKind, ExecutorResult};

impl Engine {
    /// Runs every stage of the pipeline per the dependency graph.
    pub(crate) async fn exec_stages(&self) -> ExecutorResult {
        for wave in waves(&self.pipeline.stages) {
            let results = join_all(wave.into_iter().map(|stage| self.exec_stage(stage))).await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    /// Runs the steps of one stage in order.
    async fn exec_stage(&self, stage: &Stage) -> ExecutorResult {
        let _permit = self.stage_limit.acquire().await.map_err(|_| {
            ExecutorError::from(ExecutorErrorKind::Internal {
                reason: "stage concurrency limiter closed".to_string(),
            })
        })?;

        info!(stage = %stage.name, "executing stage");

        for ctn in &stage.steps {
            if ctn.is_init() {
                continue;
            }

            if self.token.is_cancelled() {
                return Err(ExecutorError::from(ExecutorErrorKind::Cancelled));
            }

            let prepared = self
                .prepared
                .get(&ctn.id)
                .map(|c| c.value().clone())
                .unwrap_or_else(|| ctn.clone());

            let data = RuleData {
                branch: self.meta.branch.clone(),
                event: self.meta.event.clone(),
                status: self.outcome(),
                repo: self.meta.repo.clone(),
            };

            if !prepared.ruleset.matches(&data) {
                debug!(step = %prepared.name, "ruleset evaluated false, skipping");
                self.skip_step(&prepared).await?;
                continue;
            }

            self.plan_step(&prepared).await?;

            match self.exec_step(&prepared).await {
                Ok(None) => {
                    // detached steps are not waited on; their default
                    // outcome stands
                    self.finish_step(&prepared, Status::Success, 0).await?;
                }
                Ok(Some(exit_code)) => {
                    let status = if exit_code == 0 {
                        Status::Success
                    } else {
                        Status::Failure
                    };
                    self.finish_step(&prepared, status, exit_code).await?;

                    if status == Status::Failure
                        && !prepared.ruleset.continue_on_error
                        && !stage.independent
                    {
                        self.merge_outcome(Status::Failure);
                    }
                }
                Err(e) if e.is_cancelled() => {
                    self.finish_step(&prepared, Status::Killed, 0).await?;
                    self.merge_outcome(Status::Killed);
                    return Err(e);
                }
                Err(e) => {
                    self.finish_step(&prepared, Status::Failure, 0).await?;
                    self.merge_outcome(Status::Failure);
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// Groups stages into dependency waves preserving declaration order.
///
/// Assumes the graph was validated acyclic at plan time; stages stuck on a
/// cycle would simply never be scheduled here.
fn waves(stages: &[Stage]) -> Vec<Vec<&Stage>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<&Stage>> = Vec::new();

    let mut remaining: Vec<&Stage> = stages.iter().collect();
    while !remaining.is_empty() {
        let mut progressed = false;
        remaining.retain(|stage| {
            let resolved = stage
                .needs
                .iter()
                .map(|n| depth.get(n.as_str()).copied())
                .collect::<Option<Vec<usize>>>();
            match resolved {
                Some(deps) => {
                    let level = deps.into_iter().max().map_or(0, |d| d + 1);
                    depth.insert(stage.name.as_str(), level);
                    if waves.len() <= level {
                        waves.resize_with(level + 1, Vec::new);
                    }
                    waves[level].push(*stage);
                    progressed = true;
                    false
                }
                None => true,
            }
        });
        if !progressed {
            break;
        }
    }

    waves
}
