//! Adam optimizer over named parameter groups
//!
//! One instance serves one optimizer role. Each group is a network's
//! [`VarMap`]; moment estimates are keyed `<network>/<var>` so they can be
//! checkpointed next to the parameters they belong to.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use tracing::trace;

use super::{Optimizer, OptimizerScalars, OptimizerStateDict};

/// A network's parameters, registered under the network name
#[derive(Clone)]
pub struct ParameterGroup {
    /// Network name, used as key prefix
    pub name: String,
    /// Parameters of the network
    pub varmap: VarMap,
}

impl ParameterGroup {
    /// Create a group
    pub fn new(name: impl Into<String>, varmap: VarMap) -> Self {
        Self {
            name: name.into(),
            varmap,
        }
    }

    /// All vars of the group as `(<network>/<var>, var)`, sorted by key
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter map of '{}' is poisoned", self.name))?;
        let mut vars: Vec<_> = data
            .iter()
            .map(|(k, v)| (format!("{}/{}", self.name, k), v.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }
}

/// Adam with bias correction and no weight decay
pub struct AdamOptimizer {
    /// Optimizer name (one per role)
    name: String,

    /// Parameter groups updated by this optimizer
    groups: Vec<ParameterGroup>,

    /// Learning rate
    learning_rate: f64,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Number of updates applied
    step_count: u64,

    /// First moment estimates
    momentum: HashMap<String, Tensor>,

    /// Second moment estimates
    variance: HashMap<String, Tensor>,
}

impl AdamOptimizer {
    /// Create a new Adam optimizer
    pub fn new(
        name: impl Into<String>,
        groups: Vec<ParameterGroup>,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    ) -> Self {
        Self {
            name: name.into(),
            groups,
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step_count: 0,
            momentum: HashMap::new(),
            variance: HashMap::new(),
        }
    }

    /// Parameter groups
    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let mut all = Vec::new();
        for group in &self.groups {
            all.extend(group.named_vars()?);
        }
        Ok(all)
    }

    /// Apply one Adam update to a parameter
    fn update_parameter(&mut self, key: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let t = self.step_count as f64;
        let grad = grad.detach();

        let new_momentum = match self.momentum.get(key) {
            Some(m) => (m.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?,
            None => grad.affine(1.0 - self.beta1, 0.0)?,
        };
        let new_variance = match self.variance.get(key) {
            Some(v) => (v.affine(self.beta2, 0.0)? + grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?,
            None => grad.sqr()?.affine(1.0 - self.beta2, 0.0)?,
        };

        let bias_correction1 = 1.0 - self.beta1.powf(t);
        let bias_correction2 = 1.0 - self.beta2.powf(t);
        let m_hat = new_momentum.affine(1.0 / bias_correction1, 0.0)?;
        let v_hat = new_variance.affine(1.0 / bias_correction2, 0.0)?;

        let denominator = v_hat.sqrt()?.affine(1.0, self.epsilon)?;
        let update = m_hat.div(&denominator)?.affine(self.learning_rate, 0.0)?;
        var.set(&var.as_tensor().detach().sub(&update)?)?;

        self.momentum.insert(key.to_string(), new_momentum);
        self.variance.insert(key.to_string(), new_variance);
        Ok(())
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, gradients: &GradStore) -> Result<usize> {
        self.step_count += 1;
        let mut updated = 0;
        for (key, var) in self.named_vars()? {
            // Vars outside the loss graph (batch-norm statistics) have no gradient.
            if let Some(grad) = gradients.get(&var) {
                self.update_parameter(&key, &var, grad)?;
                updated += 1;
            }
        }
        trace!("{} step {} updated {} tensors", self.name, self.step_count, updated);
        Ok(updated)
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut hyperparameters = HashMap::new();
        hyperparameters.insert("beta1".to_string(), self.beta1);
        hyperparameters.insert("beta2".to_string(), self.beta2);
        hyperparameters.insert("epsilon".to_string(), self.epsilon);

        let mut tensors = HashMap::new();
        for (key, m) in &self.momentum {
            tensors.insert(format!("m/{key}"), m.clone());
        }
        for (key, v) in &self.variance {
            tensors.insert(format!("v/{key}"), v.clone());
        }

        Ok(OptimizerStateDict {
            scalars: OptimizerScalars {
                optimizer_type: "adam".to_string(),
                step_count: self.step_count,
                learning_rate: self.learning_rate,
                hyperparameters,
            },
            tensors,
        })
    }

    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()> {
        self.validate_state_dict(&state)?;

        let mut momentum = HashMap::new();
        let mut variance = HashMap::new();
        for (key, tensor) in state.tensors {
            if let Some(name) = key.strip_prefix("m/") {
                momentum.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix("v/") {
                variance.insert(name.to_string(), tensor);
            }
        }

        let scalars = state.scalars;
        self.step_count = scalars.step_count;
        self.learning_rate = scalars.learning_rate;
        if let Some(&b1) = scalars.hyperparameters.get("beta1") {
            self.beta1 = b1;
        }
        if let Some(&b2) = scalars.hyperparameters.get("beta2") {
            self.beta2 = b2;
        }
        if let Some(&eps) = scalars.hyperparameters.get("epsilon") {
            self.epsilon = eps;
        }
        self.momentum = momentum;
        self.variance = variance;
        Ok(())
    }

    fn validate_state_dict(&self, state: &OptimizerStateDict) -> Result<()> {
        if state.scalars.optimizer_type != "adam" {
            return Err(anyhow!(
                "optimizer '{}' cannot load '{}' state",
                self.name,
                state.scalars.optimizer_type
            ));
        }
        let vars: HashMap<String, Var> = self.named_vars()?.into_iter().collect();
        for (key, tensor) in &state.tensors {
            let name = key
                .strip_prefix("m/")
                .or_else(|| key.strip_prefix("v/"))
                .ok_or_else(|| anyhow!("unexpected optimizer tensor '{key}'"))?;
            let var = vars
                .get(name)
                .ok_or_else(|| anyhow!("optimizer tensor '{key}' has no matching parameter"))?;
            if var.dims() != tensor.dims() {
                return Err(anyhow!(
                    "optimizer tensor '{key}' has shape {:?}, parameter has {:?}",
                    tensor.dims(),
                    var.dims()
                ));
            }
        }
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        self.groups.iter().map(|g| g.varmap.all_vars().len()).sum()
    }

    fn step_count(&self) -> u64 {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn single_param(value: f32) -> (VarMap, Var) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(1, "w", Init::Const(value as f64)).unwrap();
        let var = varmap.all_vars().remove(0);
        (varmap, var)
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let (varmap, var) = single_param(1.0);
        let mut opt = AdamOptimizer::new("g", vec![ParameterGroup::new("net", varmap)], 0.1, 0.9, 0.999, 1e-8);

        // loss = 3 * w, gradient 3
        let loss = var.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert_eq!(opt.step(&grads).unwrap(), 1);

        // Bias-corrected first Adam step is lr * sign(grad)
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert_relative_eq!(w, 0.9, epsilon = 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_vars_without_gradients_untouched() {
        let (varmap_a, var_a) = single_param(1.0);
        let (varmap_b, var_b) = single_param(2.0);
        let mut opt = AdamOptimizer::new(
            "g",
            vec![ParameterGroup::new("a", varmap_a), ParameterGroup::new("b", varmap_b)],
            0.1,
            0.5,
            0.999,
            1e-8,
        );

        let loss = var_a.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert_eq!(opt.step(&grads).unwrap(), 1);

        assert_eq!(var_b.as_tensor().to_vec1::<f32>().unwrap(), vec![2.0]);
        let state = opt.state_dict().unwrap();
        assert!(state.tensors.contains_key("m/a/w"));
        assert!(!state.tensors.contains_key("m/b/w"));
    }

    #[test]
    fn test_state_dict_round_trip() {
        let (varmap, var) = single_param(1.0);
        let group = ParameterGroup::new("net", varmap);
        let mut opt = AdamOptimizer::new("g", vec![group.clone()], 0.01, 0.5, 0.999, 1e-8);
        let grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();

        let state = opt.state_dict().unwrap();
        let mut restored = AdamOptimizer::new("g", vec![group], 0.5, 0.9, 0.9, 1e-3);
        restored.load_state_dict(state).unwrap();

        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.learning_rate(), 0.01);
        let restored_state = restored.state_dict().unwrap();
        assert_eq!(restored_state.scalars.hyperparameters["beta1"], 0.5);
    }

    #[test]
    fn test_bias_correction_beyond_i32_steps() {
        let (varmap, var) = single_param(1.0);
        let mut opt = AdamOptimizer::new("g", vec![ParameterGroup::new("net", varmap)], 0.01, 0.9, 0.999, 1e-8);
        let mut state = opt.state_dict().unwrap();
        state.scalars.step_count = 1 << 32;
        opt.load_state_dict(state).unwrap();

        let loss = var.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();

        // Both corrections are ~1: update is lr * 0.3 / sqrt(0.009)
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert_relative_eq!(w, 1.0 - 0.01 * 0.3 / 0.009f32.sqrt(), epsilon = 1e-5);
        assert_eq!(opt.step_count(), (1 << 32) + 1);
    }

    #[test]
    fn test_state_dict_shape_mismatch_rejected() {
        let (varmap, _) = single_param(1.0);
        let opt = AdamOptimizer::new("g", vec![ParameterGroup::new("net", varmap)], 0.01, 0.5, 0.999, 1e-8);

        let mut state = opt.state_dict().unwrap();
        state
            .tensors
            .insert("m/net/w".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
        assert!(opt.validate_state_dict(&state).is_err());
    }
}
