//! オプティマイザ（Adadelta / Adam）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RasrError, RasrResult};
use crate::model::Param;

pub const ADADELTA_RHO: f32 = 0.95;
pub const ADADELTA_LR: f32 = 1.0;
pub const ADAM_LR: f32 = 1e-3;
pub const ADAM_BETA1: f32 = 0.9;
pub const ADAM_BETA2: f32 = 0.999;
pub const ADAM_EPSILON: f32 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adadelta,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adadelta" => Ok(Self::Adadelta),
            "adam" => Ok(Self::Adam),
            other => Err(format!("unknown optimizer '{other}' (expected adadelta|adam)")),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Adadelta => "adadelta",
            Self::Adam => "adam",
        })
    }
}

pub trait Optimizer {
    /// 各パラメータの `grad` を使って `value` を更新する
    fn step(&mut self, params: &mut [Param]);

    /// 数値安定化項
    fn eps(&self) -> f32;

    fn set_eps(&mut self, eps: f32);

    fn scale_eps(&mut self, factor: f32) {
        self.set_eps(self.eps() * factor);
    }

    fn kind(&self) -> OptimizerKind;
}

pub fn build_optimizer(kind: OptimizerKind, eps: f32) -> RasrResult<Box<dyn Optimizer>> {
    if !eps.is_finite() || eps <= 0.0 {
        return Err(RasrError::InvalidConfig(format!("eps must be positive (got {eps})")));
    }
    Ok(match kind {
        OptimizerKind::Adadelta => Box::new(Adadelta::new(eps)),
        OptimizerKind::Adam => Box::new(Adam::new(eps)),
    })
}

// 状態ベクトルはパラメータの並びに合わせて遅延確保する
fn ensure_state(state: &mut Vec<Vec<f32>>, params: &[Param]) {
    if state.len() != params.len() || state.iter().zip(params).any(|(s, p)| s.len() != p.len()) {
        *state = params.iter().map(|p| vec![0.0; p.len()]).collect();
    }
}

pub struct Adadelta {
    pub rho: f32,
    pub lr: f32,
    eps: f32,
    square_avg: Vec<Vec<f32>>,
    acc_delta: Vec<Vec<f32>>,
}

impl Adadelta {
    pub fn new(eps: f32) -> Self {
        Self {
            rho: ADADELTA_RHO,
            lr: ADADELTA_LR,
            eps,
            square_avg: Vec::new(),
            acc_delta: Vec::new(),
        }
    }
}

impl Optimizer for Adadelta {
    fn step(&mut self, params: &mut [Param]) {
        ensure_state(&mut self.square_avg, params);
        ensure_state(&mut self.acc_delta, params);
        let (rho, eps, lr) = (self.rho, self.eps, self.lr);

        for ((p, sq), acc) in params.iter_mut().zip(&mut self.square_avg).zip(&mut self.acc_delta) {
            for i in 0..p.value.len() {
                let g = p.grad[i];
                sq[i] = rho * sq[i] + (1.0 - rho) * g * g;
                let delta = ((acc[i] + eps).sqrt() / (sq[i] + eps).sqrt()) * g;
                acc[i] = rho * acc[i] + (1.0 - rho) * delta * delta;
                p.value[i] -= lr * delta;
            }
        }
    }

    fn eps(&self) -> f32 {
        self.eps
    }

    fn set_eps(&mut self, eps: f32) {
        self.eps = eps;
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adadelta
    }
}

pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    epsilon: f32,
    t: i32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    pub fn new(epsilon: f32) -> Self {
        Self {
            lr: ADAM_LR,
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            epsilon,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [Param]) {
        ensure_state(&mut self.m, params);
        ensure_state(&mut self.v, params);
        self.t = self.t.saturating_add(1);
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        let (b1, b2) = (self.beta1, self.beta2);

        for ((p, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            for i in 0..p.value.len() {
                let g = p.grad[i];
                m[i] = b1 * m[i] + (1.0 - b1) * g;
                v[i] = b2 * v[i] + (1.0 - b2) * g * g;
                let m_hat = m[i] / bc1;
                let v_hat = v[i] / bc2;
                p.value[i] -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }

    fn eps(&self) -> f32 {
        self.epsilon
    }

    fn set_eps(&mut self, eps: f32) {
        self.epsilon = eps;
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adam
    }
}
