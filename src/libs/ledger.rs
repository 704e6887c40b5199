use crate::libs::model::BindingModel;

/// Append-only record of every binding model each replicate has had.
///
/// Models live in one arena; each replicate keeps the indices of its own
/// lineage, oldest first. A seed model is recorded per replicate on
/// construction, so after `n` rounds every lineage holds `n + 1` models.
#[derive(Debug, Clone)]
pub struct BindingModelLedger {
    arena: Vec<BindingModel>,
    lineages: Vec<Vec<usize>>,
}

impl BindingModelLedger {
    pub fn new(seeds: Vec<BindingModel>) -> Self {
        let lineages = (0..seeds.len()).map(|i| vec![i]).collect();
        Self {
            arena: seeds,
            lineages,
        }
    }

    pub fn record(&mut self, replicate: usize, model: BindingModel) {
        self.arena.push(model);
        self.lineages[replicate].push(self.arena.len() - 1);
    }

    /// The model currently in force for `replicate`.
    pub fn latest(&self, replicate: usize) -> &BindingModel {
        let idx = *self.lineages[replicate]
            .last()
            .expect("every lineage starts with a seed");
        &self.arena[idx]
    }

    pub fn history(&self, replicate: usize) -> impl Iterator<Item = &BindingModel> {
        self.lineages[replicate].iter().map(|&i| &self.arena[i])
    }

    pub fn history_len(&self, replicate: usize) -> usize {
        self.lineages[replicate].len()
    }

    pub fn num_replicates(&self) -> usize {
        self.lineages.len()
    }

    /// Widest model currently in force.
    pub fn max_width(&self) -> i64 {
        (0..self.num_replicates())
            .map(|r| self.latest(r).width())
            .max()
            .unwrap_or(0)
    }
}
