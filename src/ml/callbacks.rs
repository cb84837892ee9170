//! 学習ループの制御
//!
//! エポックごとの検証指標を見て、早期終了と学習率の減衰を判断します。
//! どちらもテンソルに依存しない純粋な状態機械です。

use crate::model::config::{EarlyStoppingSettings, PlateauSettings};

/// 早期終了の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// 指標が改善した（最良の重みとして保存すべき）
    Improved,
    /// 改善なし、学習継続
    Continue,
    /// 辛抱回数に達したので停止
    Stop,
}

/// 検証精度を監視する早期終了（大きいほど良い）
///
/// `M` は最良エポックの重みのスナップショット。`restore_best_weights` が有効な場合のみ保持します。
#[derive(Debug, Clone)]
pub struct EarlyStopping<M> {
    patience: usize,
    restore_best_weights: bool,
    best: f64,
    best_epoch: Option<usize>,
    best_weights: Option<M>,
    wait: usize,
    stopped: bool,
}

impl<M> EarlyStopping<M> {
    pub fn new(settings: &EarlyStoppingSettings) -> Self {
        Self {
            patience: settings.patience,
            restore_best_weights: settings.restore_best_weights,
            best: f64::NEG_INFINITY,
            best_epoch: None,
            best_weights: None,
            wait: 0,
            stopped: false,
        }
    }

    /// エポック終了時に呼び出す
    ///
    /// `snapshot` は改善したエポックでのみ呼ばれます。
    pub fn step(&mut self, epoch: usize, val_accuracy: f64, snapshot: impl FnOnce() -> M) -> StopDecision {
        if val_accuracy > self.best {
            self.best = val_accuracy;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            if self.restore_best_weights {
                self.best_weights = Some(snapshot());
            }
            return StopDecision::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped = true;
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }

    pub fn restore_best_weights(&self) -> bool {
        self.restore_best_weights
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn best(&self) -> Option<(usize, f64)> {
        self.best_epoch.map(|epoch| (epoch, self.best))
    }

    /// 最終的に使う重みを選ぶ
    ///
    /// 停止が発動し復元が有効なら最良エポックの重み、それ以外は `last`。
    pub fn finish(self, last: M) -> M {
        match self.best_weights {
            Some(best) if self.stopped => best,
            _ => last,
        }
    }
}

/// 検証損失が停滞したら学習率を下げる（小さいほど良い）
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
    current_lr: f64,
}

impl ReduceLrOnPlateau {
    pub fn new(settings: &PlateauSettings, initial_lr: f64) -> Self {
        Self {
            factor: settings.factor,
            patience: settings.patience,
            min_lr: settings.min_lr,
            min_delta: settings.min_delta,
            best: f64::INFINITY,
            wait: 0,
            current_lr: initial_lr,
        }
    }

    /// 新しい検証損失を渡し、次のエポックで使う学習率を返す
    pub fn step(&mut self, val_loss: f64) -> f64 {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return self.current_lr;
        }

        self.wait += 1;
        if self.wait >= self.patience && self.current_lr > self.min_lr {
            self.current_lr = (self.current_lr * self.factor).max(self.min_lr);
            self.wait = 0;
        }
        self.current_lr
    }

    pub fn lr(&self) -> f64 {
        self.current_lr
    }
}
