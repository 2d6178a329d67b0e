//! Operations applied to a primitive's result before it is stored.

/// Element-wise activation functions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EltwiseAlg {
    /// `x` if positive, `alpha * x` otherwise.
    Relu,
    Tanh,
    /// `x` if positive, `alpha * (e^x - 1)` otherwise.
    Elu,
    Square,
    Abs,
    /// Square root, with non-positive inputs mapped to zero.
    Sqrt,
    /// `alpha * x + beta`.
    Linear,
    /// `min(max(x, 0), alpha)`.
    BoundedRelu,
    /// `ln(1 + e^x)`.
    SoftRelu,
    /// `1 / (1 + e^-x)`.
    Logistic,
    Exp,
    /// `x * logistic(alpha * x)`.
    Swish,
}

/// Evaluate activation `alg` with parameters `alpha` and `beta`.
#[inline]
pub fn eltwise(alg: EltwiseAlg, x: f32, alpha: f32, beta: f32) -> f32 {
    match alg {
        EltwiseAlg::Relu => {
            if x > 0. {
                x
            } else {
                alpha * x
            }
        }
        EltwiseAlg::Tanh => x.tanh(),
        EltwiseAlg::Elu => {
            if x > 0. {
                x
            } else {
                alpha * x.exp_m1()
            }
        }
        EltwiseAlg::Square => x * x,
        EltwiseAlg::Abs => x.abs(),
        EltwiseAlg::Sqrt => {
            if x > 0. {
                x.sqrt()
            } else {
                0.
            }
        }
        EltwiseAlg::Linear => alpha * x + beta,
        EltwiseAlg::BoundedRelu => x.max(0.).min(alpha),
        // Rewritten as `max(x, 0) + ln(1 + e^-|x|)` so that large inputs do
        // not overflow.
        EltwiseAlg::SoftRelu => x.max(0.) + (-x.abs()).exp().ln_1p(),
        EltwiseAlg::Logistic => logistic(x),
        EltwiseAlg::Exp => x.exp(),
        EltwiseAlg::Swish => x * logistic(alpha * x),
    }
}

#[inline]
fn logistic(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// A single operation in a [`PostOps`] chain.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PostOp {
    /// Replace the value with `scale * eltwise(alg, value, alpha, beta)`.
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
        scale: f32,
    },

    /// Add `scale` times the value previously stored in the destination.
    Sum { scale: f32 },
}

/// A chain of operations applied in order to each output value of a
/// primitive, after bias and output scales.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PostOps {
    ops: Vec<PostOp>,
}

impl PostOps {
    pub fn new() -> PostOps {
        PostOps::default()
    }

    /// Append an activation with unit scale.
    pub fn eltwise(self, alg: EltwiseAlg, alpha: f32, beta: f32) -> PostOps {
        self.push(PostOp::Eltwise {
            alg,
            alpha,
            beta,
            scale: 1.,
        })
    }

    /// Append an accumulation onto the prior destination value.
    pub fn sum(self, scale: f32) -> PostOps {
        self.push(PostOp::Sum { scale })
    }

    pub fn push(mut self, op: PostOp) -> PostOps {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[PostOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Return true if the chain reads the prior destination value.
    pub fn has_sum(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, PostOp::Sum { .. }))
    }

    /// Apply the chain to `value`. `prior_dst` is the value that was stored
    /// in the destination before the primitive ran, converted to `f32`.
    #[inline]
    pub fn apply(&self, mut value: f32, prior_dst: f32) -> f32 {
        for op in &self.ops {
            value = match *op {
                PostOp::Eltwise {
                    alg,
                    alpha,
                    beta,
                    scale,
                } => scale * eltwise(alg, value, alpha, beta),
                PostOp::Sum { scale } => value + scale * prior_dst,
            };
        }
        value
    }
}
