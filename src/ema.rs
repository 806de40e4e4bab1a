//! Exponential moving average of model parameters, kept on the inner backend.

use std::collections::HashMap;
use std::marker::PhantomData;

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

/// Flattened float parameters by id.
struct ParamCollector<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let numel = tensor.shape().num_elements();
        self.params.insert(id, tensor.clone().reshape([numel]));
    }
}

/// Maps online parameters to `decay·shadow + (1 − decay)·online`.
struct Blend<B: Backend> {
    shadow: HashMap<ParamId, Tensor<B, 1>>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.shadow.remove(&id) {
            Some(shadow) => {
                let shadow = shadow.reshape(tensor.dims());
                shadow.mul_scalar(self.decay) + tensor.mul_scalar(1.0 - self.decay)
            }
            None => tensor,
        }
    }
}

pub struct Ema<B: AutodiffBackend, M: AutodiffModule<B>> {
    model: M::InnerModule,
    decay: f64,
    update_every: usize,
    update_after_step: usize,
    step: usize,
    _backend: PhantomData<B>,
}

impl<B, M> Ema<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    pub fn new(online: &M, decay: f64, update_every: usize, update_after_step: usize) -> Self {
        Self {
            model: online.valid(),
            decay,
            update_every: update_every.max(1),
            update_after_step,
            step: 0,
            _backend: PhantomData,
        }
    }

    pub fn model(&self) -> &M::InnerModule {
        &self.model
    }

    /// Number of `update` calls so far.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Replace the shadow model and update counter, e.g. from a checkpoint.
    pub fn restore(&mut self, model: M::InnerModule, step: usize) {
        self.model = model;
        self.step = step;
    }

    /// Called once per optimizer step.
    ///
    /// Only every `update_every`-th call does anything. Up to `update_after_step`
    /// the online weights are copied, afterwards they are blended in. Non-parameter
    /// state such as batch-norm running statistics is always copied.
    pub fn update(&mut self, online: &M) {
        let step = self.step;
        self.step += 1;
        if step % self.update_every != 0 {
            return;
        }

        let online = online.valid();
        if step <= self.update_after_step {
            self.model = online;
            return;
        }

        let mut collector = ParamCollector {
            params: HashMap::new(),
        };
        self.model.visit(&mut collector);
        let mut blend = Blend {
            shadow: collector.params,
            decay: self.decay,
        };
        self.model = online.map(&mut blend);
    }
}
