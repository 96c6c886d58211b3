use std::collections::{BTreeSet, HashMap, HashSet};

use crate::store::{FeedbackRow, FeedbackVerdict, StateStore};
use crate::{Result, VaultConfig, VaultPath};

/// Frozen view of the feedback tables, taken once per scoring pass so the
/// scorer stays pure and benchmarkable against a fixed table.
#[derive(Debug, Clone, Default)]
pub struct FeedbackSnapshot {
    rows: HashMap<(String, String), (u32, u32)>,
    suppressions: HashSet<(String, String)>,
    min_sample: u32,
}

impl FeedbackSnapshot {
    pub fn empty(min_sample: u32) -> Self {
        Self {
            min_sample,
            ..Self::default()
        }
    }

    pub fn load(store: &StateStore, min_sample: u32) -> Result<Self> {
        let mut rows = HashMap::new();
        for row in store.all_feedback()? {
            rows.insert(
                (row.target_entity, row.context_key),
                (row.correct, row.incorrect),
            );
        }
        let suppressions = store.suppressions()?.into_iter().collect();
        Ok(Self {
            rows,
            suppressions,
            min_sample,
        })
    }

    /// Accuracy of an entity within one context; `None` below the minimum
    /// sample size.
    pub fn accuracy_in(&self, entity: &str, context: &str) -> Option<f64> {
        let (correct, incorrect) = self
            .rows
            .get(&(entity.to_string(), context.to_string()))
            .copied()?;
        let total = correct + incorrect;
        if total < self.min_sample {
            return None;
        }
        Some(f64::from(correct) / f64::from(total))
    }

    /// Accuracy across every context the entity has been judged in.
    pub fn global_accuracy(&self, entity: &str) -> Option<f64> {
        let mut correct = 0u32;
        let mut incorrect = 0u32;
        for ((e, _), (c, i)) in &self.rows {
            if e == entity {
                correct += c;
                incorrect += i;
            }
        }
        let total = correct + incorrect;
        if total < self.min_sample {
            return None;
        }
        Some(f64::from(correct) / f64::from(total))
    }

    pub fn is_suppressed(&self, entity: &str, folder: &str) -> bool {
        self.suppressions
            .contains(&(entity.to_string(), folder.to_string()))
            || self
                .suppressions
                .contains(&(entity.to_string(), "*".to_string()))
    }
}

/// Outcome of an explicit or implicit verdict, including whether the
/// pairing crossed the suppression threshold.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VerdictOutcome {
    pub row: FeedbackRow,
    pub accuracy: Option<f64>,
    pub suppressed: bool,
}

/// Records user signal into the store and promotes suppressions.
pub struct FeedbackEngine<'a> {
    store: &'a mut StateStore,
    cfg: &'a VaultConfig,
}

impl<'a> FeedbackEngine<'a> {
    pub fn new(store: &'a mut StateStore, cfg: &'a VaultConfig) -> Self {
        Self { store, cfg }
    }

    /// Persist one auto-link application for later reconciliation.
    pub fn record_application(
        &mut self,
        source: &VaultPath,
        target_entity: &str,
        span_text: &str,
    ) -> Result<i64> {
        self.store
            .record_application(source, target_entity, span_text, source.folder())
    }

    /// Implicit negative signal: any previously applied link that is no
    /// longer present in the note gets an incorrect verdict; links still
    /// present get a correct one. Returns the entities judged incorrect.
    pub fn reconcile_applications(
        &mut self,
        source: &VaultPath,
        current_targets: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for app in self.store.open_applications(source)? {
            let verdict = if current_targets.contains(&app.target_entity) {
                FeedbackVerdict::Correct
            } else {
                FeedbackVerdict::Incorrect
            };
            self.store.set_application_verdict(app.id, verdict)?;
            self.apply_verdict(&app.target_entity, &app.context_key, verdict)?;
            if verdict == FeedbackVerdict::Incorrect {
                removed.push(app.target_entity);
            }
        }
        Ok(removed)
    }

    /// Explicit verdict from the caller.
    pub fn report(
        &mut self,
        target_entity: &str,
        context_key: &str,
        verdict: FeedbackVerdict,
    ) -> Result<VerdictOutcome> {
        self.apply_verdict(target_entity, context_key, verdict)
    }

    fn apply_verdict(
        &mut self,
        target_entity: &str,
        context_key: &str,
        verdict: FeedbackVerdict,
    ) -> Result<VerdictOutcome> {
        let row = self.store.add_feedback(target_entity, context_key, verdict)?;
        let mut suppressed = false;
        if verdict == FeedbackVerdict::Incorrect {
            suppressed = self.maybe_promote_suppression(&row)?;
        }
        Ok(VerdictOutcome {
            accuracy: row.accuracy(self.cfg.feedback_min_sample),
            suppressed,
            row,
        })
    }

    /// Enough negatives at low raw accuracy turn into a suppression. The
    /// raw ratio is used here: three straight negatives from a cold start
    /// must suppress even though the sample is small.
    fn maybe_promote_suppression(&mut self, row: &FeedbackRow) -> Result<bool> {
        if row.incorrect < self.cfg.suppression_negatives {
            return Ok(false);
        }
        let total = row.correct + row.incorrect;
        let raw = f64::from(row.correct) / f64::from(total);
        if raw >= self.cfg.suppression_accuracy {
            return Ok(false);
        }
        self.store
            .add_suppression(&row.target_entity, &row.context_key)?;
        tracing::debug!(
            entity = %row.target_entity,
            context = %row.context_key,
            "suppression promoted"
        );
        Ok(true)
    }
}
