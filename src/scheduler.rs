use serde::{Deserialize, Serialize};

/// Settings for learning rate reduction on a loss plateau
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauOptions {
    /// Number of non-improving steps tolerated before a reduction.
    pub patience: u64,
    /// Steps after a reduction during which plateaus are ignored.
    pub cooldown: u64,
    pub factor: f64,
    pub min_lr: f64,
}

impl Default for PlateauOptions {
    fn default() -> Self {
        Self {
            patience: 100,
            cooldown: 100,
            factor: 0.5,
            min_lr: 0.,
        }
    }
}

/// Multiplies the learning rate by `factor` once the loss has not improved
/// on its best value for more than `patience` consecutive steps.
///
/// Any strict decrease counts as an improvement.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    best: f64,
    num_bad: u64,
    cooldown_counter: u64,
    reductions: u64,
    settings: PlateauOptions,
}

impl ReduceLrOnPlateau {
    pub fn new(settings: PlateauOptions) -> Self {
        Self {
            best: f64::INFINITY,
            num_bad: 0,
            cooldown_counter: 0,
            reductions: 0,
            settings,
        }
    }

    /// Record one loss value and return the learning rate to use next.
    pub fn step(&mut self, loss: f64, learning_rate: f64) -> f64 {
        if loss < self.best {
            self.best = loss;
            self.num_bad = 0;
        } else {
            self.num_bad += 1;
        }

        if self.in_cooldown() {
            self.cooldown_counter -= 1;
            self.num_bad = 0;
        }

        if self.num_bad > self.settings.patience {
            self.cooldown_counter = self.settings.cooldown;
            self.num_bad = 0;
            let reduced = (learning_rate * self.settings.factor).max(self.settings.min_lr);
            if reduced < learning_rate {
                self.reductions += 1;
                return reduced;
            }
        }
        learning_rate
    }

    pub fn in_cooldown(&self) -> bool {
        self.cooldown_counter > 0
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn reductions(&self) -> u64 {
        self.reductions
    }
}
