//! 勾配ノルムのガード
//!
//! 全パラメータの勾配をまとめた L2 ノルムを計算し、
//! 閾値を超えれば縮小、非有限なら更新そのものを見送る。

use crate::error::{RasrError, RasrResult};
use crate::model::Param;
use crate::optim::Optimizer;

/// ガード付き更新の結果
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GuardedStep {
    /// クリップ前のノルム
    pub norm: f32,
    /// オプティマイザを呼んだか
    pub applied: bool,
}

#[derive(Clone, Debug)]
pub struct GradientGuard {
    threshold: f32,
    skipped: u64,
}

impl GradientGuard {
    pub fn new(threshold: f32) -> RasrResult<Self> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(RasrError::InvalidConfig(format!(
                "grad clip threshold must be positive and finite (got {threshold})"
            )));
        }
        Ok(Self {
            threshold,
            skipped: 0,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// これまでに見送った更新の回数
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// 勾配全体の L2 ノルム（f64 で累積）
    pub fn global_norm(params: &[Param]) -> f32 {
        let norm_sq: f64 = params
            .iter()
            .flat_map(|p| p.grad.iter())
            .map(|&g| (g as f64) * (g as f64))
            .sum();
        norm_sq.sqrt() as f32
    }

    /// 勾配を検査・クリップしてから `optimizer.step` を呼ぶ
    pub fn step<O: Optimizer + ?Sized>(&mut self, params: &mut [Param], optimizer: &mut O) -> GuardedStep {
        let norm = Self::global_norm(params);

        if !norm.is_finite() {
            self.skipped += 1;
            log::warn!("{}; skipping optimizer step", RasrError::NumericInstability { norm });
            return GuardedStep {
                norm,
                applied: false,
            };
        }

        if norm > self.threshold {
            let scale = self.threshold / norm;
            for p in params.iter_mut() {
                p.grad.iter_mut().for_each(|g| *g *= scale);
            }
        }

        optimizer.step(params);
        GuardedStep {
            norm,
            applied: true,
        }
    }
}
