//! 参照用の小さなモデル
//!
//! 入力（音響フレームの平均 or ソーストークン埋め込みの平均）を tanh 隠れ層に写し、
//! 共有の線形出力層で出力語彙上の分布を作る。損失は bag-of-tokens の交差エントロピー。
//! 注意機構や CTC は持たない。パイプライン全体を動かして検証するためのもの。

use std::io::{self, Read, Write};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::codec::FeatureMatrix;
use crate::error::{RasrError, RasrResult};
use crate::feature_store::AcousticBatch;
use crate::model::{BatchObservation, Param, Recognizer, TrainableModel, TrainingExample};

const MAGIC: &[u8; 8] = b"RASRLBM1";

const ACOUSTIC: usize = 0;
const EMBED: usize = 1;
const OUT_W: usize = 2;
const OUT_B: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearBagDims {
    pub idim: usize,
    pub hidden: usize,
    pub odim: usize,
    /// テキスト拡張の入力語彙（0 = 拡張なし）
    pub vocab_in: usize,
}

pub struct LinearBagModel {
    dims: LinearBagDims,
    params: Vec<Param>,
    training: bool,
}

enum Input<'a> {
    Frames(Vec<f32>),
    Tokens(&'a [u32]),
}

impl LinearBagModel {
    pub fn new<R: Rng>(dims: LinearBagDims, rng: &mut R) -> RasrResult<Self> {
        if dims.idim == 0 || dims.hidden == 0 || dims.odim == 0 {
            return Err(RasrError::InvalidConfig(format!("model dims must be positive: {dims:?}")));
        }
        let mut init = |name: &str, len: usize, fan_in: usize| {
            let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
            Param::new(name, (0..len).map(|_| rng.random_range(-bound..bound)).collect())
        };
        let params = vec![
            init("acoustic.weight", dims.hidden * dims.idim, dims.idim),
            init("embed.weight", dims.vocab_in * dims.hidden, 1),
            init("output.weight", dims.odim * dims.hidden, dims.hidden),
            Param::new("output.bias", vec![0.0; dims.odim]),
        ];
        Ok(Self {
            dims,
            params,
            training: true,
        })
    }

    pub fn dims(&self) -> LinearBagDims {
        self.dims
    }

    // tanh 後の隠れ層
    fn encode(&self, input: &Input<'_>) -> RasrResult<Vec<f32>> {
        let d = self.dims;
        let h = d.hidden;
        let mut pre = vec![0.0f32; h];
        match input {
            Input::Frames(x) => {
                if x.len() != d.idim {
                    return Err(RasrError::decode(
                        "acoustic input",
                        format!("feature dim {} != idim {}", x.len(), d.idim),
                    ));
                }
                let a = &self.params[ACOUSTIC].value;
                for (j, p) in pre.iter_mut().enumerate() {
                    *p = a[j * d.idim..(j + 1) * d.idim].iter().zip(x).map(|(w, v)| w * v).sum();
                }
            }
            Input::Tokens(src) => {
                if d.vocab_in == 0 {
                    return Err(RasrError::InvalidConfig(
                        "model has no text embedding for augmentation input".into(),
                    ));
                }
                let e = &self.params[EMBED].value;
                for &t in src.iter() {
                    let t = t as usize;
                    if t >= d.vocab_in {
                        return Err(RasrError::decode("source token", format!("id {t} >= {}", d.vocab_in)));
                    }
                    for (p, w) in pre.iter_mut().zip(&e[t * h..(t + 1) * h]) {
                        *p += w;
                    }
                }
                if !src.is_empty() {
                    let inv = 1.0 / src.len() as f32;
                    pre.iter_mut().for_each(|p| *p *= inv);
                }
            }
        }
        Ok(pre.into_iter().map(f32::tanh).collect())
    }

    fn logits(&self, hid: &[f32]) -> Vec<f32> {
        let h = self.dims.hidden;
        let w = &self.params[OUT_W].value;
        let b = &self.params[OUT_B].value;
        (0..self.dims.odim)
            .map(|k| b[k] + w[k * h..(k + 1) * h].iter().zip(hid).map(|(w, x)| w * x).sum::<f32>())
            .collect()
    }

    fn target_dist(&self, targets: &[u32]) -> RasrResult<Vec<f32>> {
        let mut t = vec![0.0f32; self.dims.odim];
        let inv = 1.0 / targets.len() as f32;
        for &k in targets {
            let slot = t
                .get_mut(k as usize)
                .ok_or_else(|| RasrError::decode("target token", format!("id {k} >= {}", self.dims.odim)))?;
            *slot += inv;
        }
        Ok(t)
    }

    /// 1件分の損失と正解数。`grads` が与えられれば `scale` 倍した勾配を加算する
    fn step_item(
        &self,
        input: &Input<'_>,
        targets: &[u32],
        grads: Option<(&mut [Vec<f32>], f32)>,
    ) -> RasrResult<Option<(f32, f32)>> {
        if targets.is_empty() {
            return Ok(None);
        }
        let hid = self.encode(input)?;
        let probs = softmax(&self.logits(&hid));
        let t = self.target_dist(targets)?;

        let loss: f32 = -t.iter().zip(&probs).map(|(t, p)| t * p.max(1e-12).ln()).sum::<f32>();
        let argmax = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(k, _)| k as u32);
        let correct = if targets.contains(&argmax) { 1.0 } else { 0.0 };

        let Some((g, scale)) = grads else {
            return Ok(Some((loss, correct)));
        };

        let d = self.dims;
        let h = d.hidden;
        let ow = &self.params[OUT_W].value;
        let mut dh = vec![0.0f32; h];
        for k in 0..d.odim {
            let dl = (probs[k] - t[k]) * scale;
            g[OUT_B][k] += dl;
            for j in 0..h {
                g[OUT_W][k * h + j] += dl * hid[j];
                dh[j] += dl * ow[k * h + j];
            }
        }
        let dpre: Vec<f32> = dh.iter().zip(&hid).map(|(d, y)| d * (1.0 - y * y)).collect();

        match input {
            Input::Frames(x) => {
                for (j, dp) in dpre.iter().enumerate() {
                    for (i, xi) in x.iter().enumerate() {
                        g[ACOUSTIC][j * d.idim + i] += dp * xi;
                    }
                }
            }
            Input::Tokens(src) => {
                let inv = 1.0 / src.len().max(1) as f32;
                for &tok in src.iter() {
                    let row = tok as usize * h;
                    for (j, dp) in dpre.iter().enumerate() {
                        g[EMBED][row + j] += dp * inv;
                    }
                }
            }
        }
        Ok(Some((loss, correct)))
    }

    fn run_batch(&self, inputs: &[(Input<'_>, &[u32])], mut grads: Option<&mut Vec<Vec<f32>>>) -> RasrResult<BatchObservation> {
        let counted = inputs.iter().filter(|(_, t)| !t.is_empty()).count();
        if counted == 0 {
            return Ok(BatchObservation::default());
        }
        let scale = 1.0 / counted as f32;
        let (mut loss, mut acc) = (0.0f32, 0.0f32);
        for (input, targets) in inputs {
            let g = grads.as_mut().map(|g| (g.as_mut_slice(), scale));
            if let Some((l, c)) = self.step_item(input, targets, g)? {
                loss += l;
                acc += c;
            }
        }
        Ok(BatchObservation {
            loss: loss * scale,
            acc: acc * scale,
        })
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn acoustic_inputs(batch: &AcousticBatch) -> Vec<(Input<'_>, &[u32])> {
    batch
        .items
        .iter()
        .map(|it| (Input::Frames(it.feats.mean_row()), it.targets.as_slice()))
        .collect()
}

fn read_exact(reader: &mut dyn Read, buf: &mut [u8]) -> RasrResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => RasrError::decode("model snapshot", "truncated"),
        _ => RasrError::Io(e),
    })
}

impl TrainableModel for LinearBagModel {
    fn forward_backward(&mut self, example: TrainingExample<'_>) -> RasrResult<BatchObservation> {
        let inputs: Vec<(Input<'_>, &[u32])> = match example {
            TrainingExample::Acoustic(b) => acoustic_inputs(b),
            TrainingExample::Text(b) => b
                .pairs
                .iter()
                .map(|p| (Input::Tokens(p.src.as_slice()), p.tgt.as_slice()))
                .collect(),
        };
        let mut grads: Vec<Vec<f32>> = self.params.iter().map(|p| vec![0.0; p.len()]).collect();
        let obs = self.run_batch(&inputs, Some(&mut grads))?;
        for (p, g) in self.params.iter_mut().zip(grads) {
            for (pg, gv) in p.grad.iter_mut().zip(g) {
                *pg += gv;
            }
        }
        Ok(obs)
    }

    fn evaluate(&self, batch: &AcousticBatch) -> RasrResult<BatchObservation> {
        self.run_batch(&acoustic_inputs(batch), None)
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn save(&self, writer: &mut dyn Write) -> RasrResult<()> {
        let d = self.dims;
        writer.write_all(MAGIC)?;
        for v in [d.idim, d.hidden, d.odim, d.vocab_in] {
            writer.write_all(&(v as u32).to_le_bytes())?;
        }
        for p in &self.params {
            for v in &p.value {
                writer.write_all(&v.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// 形状が一致しない場合は何も書き換えずにエラー
    fn load(&mut self, reader: &mut dyn Read) -> RasrResult<()> {
        let mut magic = [0u8; 8];
        read_exact(reader, &mut magic)?;
        if &magic != MAGIC {
            return Err(RasrError::decode("model snapshot", "bad magic"));
        }
        let mut header = [0u8; 16];
        read_exact(reader, &mut header)?;
        let dim = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]) as usize;
        let found = LinearBagDims {
            idim: dim(0),
            hidden: dim(4),
            odim: dim(8),
            vocab_in: dim(12),
        };
        if found != self.dims {
            return Err(RasrError::decode(
                "model snapshot",
                format!("shape mismatch: file {found:?}, model {:?}", self.dims),
            ));
        }

        let mut values = Vec::with_capacity(self.params.len());
        for p in &self.params {
            let mut buf = vec![0u8; p.len() * 4];
            read_exact(reader, &mut buf)?;
            values.push(
                buf.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect::<Vec<f32>>(),
            );
        }
        for (p, v) in self.params.iter_mut().zip(values) {
            p.value = v;
        }
        Ok(())
    }
}

impl Recognizer for LinearBagModel {
    /// 事後確率が一様分布を上回るトークンを確率の降順に最大 `maxlen` 個返す。
    /// ID 0（blank）は出力しない
    fn recognize(&self, feats: &FeatureMatrix, maxlen: usize) -> RasrResult<Vec<u32>> {
        let hid = self.encode(&Input::Frames(feats.mean_row()))?;
        let probs = softmax(&self.logits(&hid));
        let prior = 1.0 / self.dims.odim as f32;
        let mut cand: Vec<(usize, f32)> = probs.into_iter().enumerate().skip(1).filter(|(_, p)| *p > prior).collect();
        cand.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(cand.into_iter().take(maxlen).map(|(k, _)| k as u32).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::{TextBatch, TextPair};
    use crate::feature_store::AcousticItem;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn dims() -> LinearBagDims {
        LinearBagDims {
            idim: 3,
            hidden: 4,
            odim: 5,
            vocab_in: 6,
        }
    }

    fn model() -> LinearBagModel {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        LinearBagModel::new(dims(), &mut rng).unwrap()
    }

    fn batch() -> AcousticBatch {
        AcousticBatch {
            items: vec![
                AcousticItem {
                    index: 0,
                    feats: FeatureMatrix::new(2, 3, vec![0.5, -0.2, 0.1, 0.3, 0.4, -0.6]),
                    targets: vec![1, 2],
                },
                AcousticItem {
                    index: 1,
                    feats: FeatureMatrix::new(1, 3, vec![-0.4, 0.9, 0.2]),
                    targets: vec![3],
                },
            ],
        }
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut m = model();
        let b = batch();
        m.zero_grad();
        m.forward_backward(TrainingExample::Acoustic(&b)).unwrap();

        let h = 1e-2f32;
        for (pi, idx) in [(ACOUSTIC, 5), (OUT_W, 7), (OUT_B, 2)] {
            let analytic = m.params[pi].grad[idx];
            let orig = m.params[pi].value[idx];
            m.params[pi].value[idx] = orig + h;
            let up = m.evaluate(&b).unwrap().loss;
            m.params[pi].value[idx] = orig - h;
            let down = m.evaluate(&b).unwrap().loss;
            m.params[pi].value[idx] = orig;
            let numeric = (up - down) / (2.0 * h);
            assert!((analytic - numeric).abs() < 1e-2, "param {pi}[{idx}]: {analytic} vs {numeric}");
        }
    }

    #[test]
    fn test_text_batch_touches_embedding_only_on_input_side() {
        let mut m = model();
        let text = TextBatch {
            pairs: vec![TextPair {
                line: 0,
                src: vec![1, 4],
                tgt: vec![2],
            }],
        };
        m.zero_grad();
        m.forward_backward(TrainingExample::Text(&text)).unwrap();
        assert!(m.params[ACOUSTIC].grad.iter().all(|g| *g == 0.0));
        assert!(m.params[EMBED].grad.iter().any(|g| *g != 0.0));

        let bad = TextBatch {
            pairs: vec![TextPair {
                line: 0,
                src: vec![99],
                tgt: vec![2],
            }],
        };
        assert!(matches!(
            m.forward_backward(TrainingExample::Text(&bad)),
            Err(RasrError::Decode { .. })
        ));
    }

    #[test]
    fn test_snapshot_restores_values() {
        let m = model();
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();

        let mut other = LinearBagModel::new(dims(), &mut Xoshiro256PlusPlus::seed_from_u64(99)).unwrap();
        assert_ne!(other.params, m.params);
        other.load(&mut buf.as_slice()).unwrap();
        let values: Vec<_> = other.params.iter().map(|p| &p.value).collect();
        let expected: Vec<_> = m.params.iter().map(|p| &p.value).collect();
        assert_eq!(values, expected);

        let mut wrong = LinearBagModel::new(
            LinearBagDims { odim: 7, ..dims() },
            &mut Xoshiro256PlusPlus::seed_from_u64(1),
        )
        .unwrap();
        let before = wrong.params.clone();
        assert!(wrong.load(&mut buf.as_slice()).is_err());
        assert_eq!(wrong.params, before);
    }

    #[test]
    fn test_recognize_respects_maxlen_and_skips_blank() {
        let mut m = model();
        // blank と ID 3 を強く推す
        m.params[OUT_B].value = vec![5.0, 0.0, 0.0, 4.0, 0.0];
        let feats = FeatureMatrix::new(1, 3, vec![0.0; 3]);
        let out = m.recognize(&feats, 4).unwrap();
        assert_eq!(out, vec![3]);
        assert!(m.recognize(&feats, 0).unwrap().is_empty());
    }
}
