use crate::error::{ReconcileError, Result};
use crate::identity::NameNormalizer;
use crate::sheet::{CellAddress, EditTarget};
use crate::{AuditEntry, CellMapping, FeeRecord, FeeValue};
use log::{debug, info};
use std::collections::HashMap;

type JoinKey = (String, String, String);

/// Joins parsed cell mappings against aggregated fee records and writes the
/// matches into the edit target.
pub struct ReconciliationEngine<'a> {
    normalizer: &'a NameNormalizer,
}

/// What the planning pass decided for one mapping.
struct PlannedCell<'m> {
    mapping: &'m CellMapping,
    fee: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub visited: usize,
    pub updated: usize,
    pub missing: usize,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(normalizer: &'a NameNormalizer) -> Self {
        Self { normalizer }
    }

    fn key(&self, operation: &str, employee: &str, month: &str) -> JoinKey {
        let employee = self
            .normalizer
            .normalize_str(employee)
            .unwrap_or_default();
        (operation.trim().to_string(), employee, month.to_string())
    }

    /// Produces exactly one audit entry per mapping, in mapping order.
    ///
    /// Every mapping is resolved before the first write, so an ambiguous
    /// match aborts without touching `target`.
    pub fn reconcile(
        &self,
        target: &mut EditTarget,
        mappings: &[CellMapping],
        records: &[FeeRecord],
    ) -> Result<(Vec<AuditEntry>, ReconcileStats)> {
        let mut index: HashMap<JoinKey, Vec<&FeeRecord>> = HashMap::new();
        for record in records {
            index
                .entry(self.key(&record.operation, &record.employee, &record.month))
                .or_default()
                .push(record);
        }

        let mut plan = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let key = self.key(&mapping.operation, &mapping.employee, &mapping.month);
            let fee = match index.get(&key).map(Vec::as_slice) {
                None | Some([]) => None,
                Some([record]) => Some(record.fee),
                Some(matches) => {
                    return Err(ReconcileError::AmbiguousMatch {
                        operation: key.0,
                        employee: key.1,
                        month: key.2,
                        count: matches.len(),
                    })
                }
            };
            plan.push(PlannedCell { mapping, fee });
        }

        let mut stats = ReconcileStats::default();
        let mut audit = Vec::with_capacity(plan.len());
        for PlannedCell { mapping, fee } in plan {
            stats.visited += 1;
            let fee_after = match fee {
                Some(fee) => {
                    apply(target, mapping.cell, fee);
                    stats.updated += 1;
                    FeeValue::Amount(fee)
                }
                None => {
                    stats.missing += 1;
                    FeeValue::Missing
                }
            };
            audit.push(AuditEntry::from_mapping(mapping, fee_after));
        }

        info!(
            "Updated {} cells with new costs, {} cells without a matching record",
            stats.updated, stats.missing
        );
        Ok((audit, stats))
    }
}

fn apply(target: &mut EditTarget, cell: CellAddress, fee: i64) {
    match target.write_fee(cell, fee) {
        Some(formula) => debug!("{} <- {} (replaces ={})", cell, fee, formula),
        None => debug!("{} <- {}", cell, fee),
    }
}
