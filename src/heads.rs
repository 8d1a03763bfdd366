use burn::{
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    prelude::*,
    tensor::{activation::sigmoid, backend::Backend},
};

/// Binary classification head: hidden layer, ReLU, dropout, single logit.
#[derive(Module, Debug)]
pub struct BinaryHead<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    relu: Relu,
}

impl<B: Backend> BinaryHead<B> {
    pub fn new(
        in_features: usize,
        hidden_features: usize,
        dropout_rate: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            fc1: LinearConfig::new(in_features, hidden_features).init(device),
            fc2: LinearConfig::new(hidden_features, 1).init(device),
            dropout: DropoutConfig::new(dropout_rate).init(),
            relu: Relu::new(),
        }
    }

    /// Pre-sigmoid output, `[N, 1]`.
    pub fn forward_logits(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.fc1.forward(x);
        let x = self.relu.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// Probability in `[0, 1]`, `[N, 1]`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        sigmoid(self.forward_logits(x))
    }
}
