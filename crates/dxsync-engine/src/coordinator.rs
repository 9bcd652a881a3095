//! Fan-out of one operation across artifact kinds in dependency order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use dxsync_core::{ArtifactKind, ItemFailure, Options, SyncError, PULL_ORDER, PUSH_ORDER};

use crate::driver::Summary;
use crate::helper::ArtifactHelper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Push,
    Pull,
}

impl Operation {
    pub fn past_tense(self) -> &'static str {
        match self {
            Operation::Push => "pushed",
            Operation::Pull => "pulled",
        }
    }
}

/// What the coordinator needs from one kind. [`ArtifactHelper`] is the real
/// implementation; tests substitute counting stubs.
#[async_trait]
pub trait KindRunner: Send + Sync {
    fn kind(&self) -> ArtifactKind;
    async fn pull_all(&self, opts: &Options) -> Result<Summary, SyncError>;
    async fn pull_modified(&self, opts: &Options) -> Result<Summary, SyncError>;
    async fn push_all(&self, opts: &Options) -> Result<Summary, SyncError>;
    async fn push_modified(&self, opts: &Options) -> Result<Summary, SyncError>;
}

#[async_trait]
impl KindRunner for Arc<ArtifactHelper> {
    fn kind(&self) -> ArtifactKind {
        ArtifactHelper::kind(self)
    }

    async fn pull_all(&self, opts: &Options) -> Result<Summary, SyncError> {
        ArtifactHelper::pull_all(self, opts).await
    }

    async fn pull_modified(&self, opts: &Options) -> Result<Summary, SyncError> {
        ArtifactHelper::pull_modified(self, opts).await
    }

    async fn push_all(&self, opts: &Options) -> Result<Summary, SyncError> {
        ArtifactHelper::push_all(self, opts).await
    }

    async fn push_modified(&self, opts: &Options) -> Result<Summary, SyncError> {
        ArtifactHelper::push_modified(self, opts).await
    }
}

/// Aggregated outcome of an all-kinds run.
#[derive(Debug)]
pub struct RunReport {
    pub operation: Operation,
    pub per_kind: Vec<(ArtifactKind, Summary)>,
}

impl RunReport {
    pub fn total_succeeded(&self) -> usize {
        self.per_kind
            .iter()
            .map(|(_, summary)| summary.succeeded.len())
            .sum()
    }

    pub fn total_errors(&self) -> usize {
        self.per_kind
            .iter()
            .map(|(_, summary)| summary.failed.len())
            .sum()
    }

    pub fn clean(&self) -> bool {
        self.total_errors() == 0
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} artifacts successfully {}, {} errors",
            self.total_succeeded(),
            self.operation.past_tense(),
            self.total_errors()
        )
    }
}

/// Runs each selected kind to completion before the next, in the fixed
/// dependency order, and aggregates per-kind summaries.
pub struct AllSwitch {
    runners: Vec<Arc<dyn KindRunner>>,
}

impl AllSwitch {
    pub fn new(runners: Vec<Arc<dyn KindRunner>>) -> Self {
        Self { runners }
    }

    pub async fn pull(&self, kinds: &[ArtifactKind], opts: &Options) -> RunReport {
        self.run(Operation::Pull, kinds, opts).await
    }

    pub async fn push(&self, kinds: &[ArtifactKind], opts: &Options) -> RunReport {
        self.run(Operation::Push, kinds, opts).await
    }

    fn in_dependency_order(
        &self,
        operation: Operation,
        kinds: &[ArtifactKind],
    ) -> Vec<Arc<dyn KindRunner>> {
        let order = match operation {
            Operation::Pull => &PULL_ORDER[..],
            Operation::Push => &PUSH_ORDER[..],
        };
        let mut ordered: Vec<ArtifactKind> = order
            .iter()
            .copied()
            .filter(|kind| kinds.contains(kind))
            .collect();
        // Kinds outside the fixed order (publishing jobs) run last.
        for kind in kinds {
            if !ordered.contains(kind) {
                ordered.push(*kind);
            }
        }
        ordered
            .into_iter()
            .filter_map(|kind| {
                self.runners
                    .iter()
                    .find(|runner| runner.kind() == kind)
                    .cloned()
            })
            .collect()
    }

    async fn run(
        &self,
        operation: Operation,
        kinds: &[ArtifactKind],
        opts: &Options,
    ) -> RunReport {
        let mut report = RunReport {
            operation,
            per_kind: Vec::new(),
        };
        for runner in self.in_dependency_order(operation, kinds) {
            let kind = runner.kind();
            let result = match (operation, opts.ignore_timestamps) {
                (Operation::Pull, true) => runner.pull_all(opts).await,
                (Operation::Pull, false) => runner.pull_modified(opts).await,
                (Operation::Push, true) => runner.push_all(opts).await,
                (Operation::Push, false) => runner.push_modified(opts).await,
            };
            let summary = match result {
                Ok(summary) => summary,
                // A kind-level setup failure counts as one error and does
                // not stop the remaining kinds.
                Err(err) => Summary {
                    succeeded: Vec::new(),
                    failed: vec![ItemFailure::new(kind.label(), err)],
                },
            };
            info!(
                kind = kind.label(),
                succeeded = summary.succeeded.len(),
                errors = summary.failed.len(),
                "kind finished"
            );
            report.per_kind.push((kind, summary));
        }
        report
    }
}
