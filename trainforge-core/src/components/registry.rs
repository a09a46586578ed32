//! Factory mapping `ComponentSpec` type names to constructors.

use crate::components::criterion::{BceWithLogitsLoss, Criterion, MseLoss};
use crate::components::network::{EnsembleNetwork, LinearNetwork, Network};
use crate::components::optimizer::{Adam, Optimizer, Sgd};
use crate::components::scheduler::{
    Constant, ExponentialLr, OneCycle, ScheduleContext, Scheduler, StepLr,
};
use crate::config::ComponentSpec;
use crate::error::{ExecutorError, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub type Params = serde_json::Map<String, serde_json::Value>;

/// Values available to every network constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkContext {
    pub seed: u64,
}

pub type NetworkBuilder =
    Arc<dyn Fn(&Params, &NetworkContext, &ComponentRegistry) -> Result<Box<dyn Network>> + Send + Sync>;
pub type CriterionBuilder = Arc<dyn Fn(&Params) -> Result<Box<dyn Criterion>> + Send + Sync>;
pub type OptimizerBuilder = Arc<dyn Fn(&Params) -> Result<Box<dyn Optimizer>> + Send + Sync>;
pub type SchedulerBuilder =
    Arc<dyn Fn(&Params, &ScheduleContext) -> Result<Box<dyn Scheduler>> + Send + Sync>;

/// Registry of collaborator constructors keyed by type name.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    networks: HashMap<String, NetworkBuilder>,
    criteria: HashMap<String, CriterionBuilder>,
    optimizers: HashMap<String, OptimizerBuilder>,
    schedulers: HashMap<String, SchedulerBuilder>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn sorted<'a>(mut names: Vec<&'a String>) -> Vec<&'a String> {
            names.sort();
            names
        }
        f.debug_struct("ComponentRegistry")
            .field("networks", &sorted(self.networks.keys().collect()))
            .field("criteria", &sorted(self.criteria.keys().collect()))
            .field("optimizers", &sorted(self.optimizers.keys().collect()))
            .field("schedulers", &sorted(self.schedulers.keys().collect()))
            .finish()
    }
}

fn reject_params(what: &str, params: &Params) -> Result<()> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(ExecutorError::component(format!(
            "{what} takes no parameters, got {:?}",
            params.keys().collect::<Vec<_>>()
        )))
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in collaborator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_network("linear", |params, ctx, _| {
            Ok(Box::new(LinearNetwork::from_params(params, ctx.seed)?))
        });
        registry.register_network("ensemble", |params, ctx, registry| {
            let specs: Vec<ComponentSpec> = params
                .get("members")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ExecutorError::component(format!("ensemble: {e}")))?
                .ok_or_else(|| ExecutorError::component("ensemble: missing 'members'"))?;
            let members = specs
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let member_ctx = NetworkContext {
                        seed: ctx.seed.wrapping_add(i as u64),
                    };
                    registry.build_network(spec, &member_ctx)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(EnsembleNetwork::new(members)?))
        });

        registry.register_criterion("mse", |params| {
            reject_params("mse", params)?;
            Ok(Box::new(MseLoss))
        });
        registry.register_criterion("bce_with_logits", |params| {
            reject_params("bce_with_logits", params)?;
            Ok(Box::new(BceWithLogitsLoss))
        });

        registry.register_optimizer("sgd", |params| Ok(Box::new(Sgd::from_params(params)?)));
        registry.register_optimizer("adam", |params| Ok(Box::new(Adam::from_params(params)?)));

        registry.register_scheduler("constant", |params, _| {
            reject_params("constant", params)?;
            Ok(Box::new(Constant::default()))
        });
        registry.register_scheduler("step_lr", |params, ctx| {
            Ok(Box::new(StepLr::from_params(params, ctx)?))
        });
        registry.register_scheduler("exponential_lr", |params, ctx| {
            Ok(Box::new(ExponentialLr::from_params(params, ctx)?))
        });
        registry.register_scheduler("one_cycle", |params, ctx| {
            Ok(Box::new(OneCycle::from_params(params, ctx)?))
        });

        registry
    }

    pub fn register_network<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&Params, &NetworkContext, &ComponentRegistry) -> Result<Box<dyn Network>>
            + Send
            + Sync
            + 'static,
    {
        self.networks.insert(name.to_string(), Arc::new(builder));
    }

    pub fn register_criterion<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&Params) -> Result<Box<dyn Criterion>> + Send + Sync + 'static,
    {
        self.criteria.insert(name.to_string(), Arc::new(builder));
    }

    pub fn register_optimizer<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&Params) -> Result<Box<dyn Optimizer>> + Send + Sync + 'static,
    {
        self.optimizers.insert(name.to_string(), Arc::new(builder));
    }

    pub fn register_scheduler<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&Params, &ScheduleContext) -> Result<Box<dyn Scheduler>> + Send + Sync + 'static,
    {
        self.schedulers.insert(name.to_string(), Arc::new(builder));
    }

    pub fn build_network(&self, spec: &ComponentSpec, ctx: &NetworkContext) -> Result<Box<dyn Network>> {
        let builder = self.networks.get(&spec.type_name).ok_or_else(|| unknown("network", spec))?;
        builder(&spec.params, ctx, self)
    }

    pub fn build_criterion(&self, spec: &ComponentSpec) -> Result<Box<dyn Criterion>> {
        let builder = self.criteria.get(&spec.type_name).ok_or_else(|| unknown("criterion", spec))?;
        builder(&spec.params)
    }

    pub fn build_optimizer(&self, spec: &ComponentSpec) -> Result<Box<dyn Optimizer>> {
        let builder = self
            .optimizers
            .get(&spec.type_name)
            .ok_or_else(|| unknown("optimizer", spec))?;
        builder(&spec.params)
    }

    pub fn build_scheduler(
        &self,
        spec: &ComponentSpec,
        ctx: &ScheduleContext,
    ) -> Result<Box<dyn Scheduler>> {
        let builder = self
            .schedulers
            .get(&spec.type_name)
            .ok_or_else(|| unknown("scheduler", spec))?;
        builder(&spec.params, ctx)
    }
}

fn unknown(kind: &str, spec: &ComponentSpec) -> ExecutorError {
    ExecutorError::component(format!("unknown {kind} type '{}'", spec.type_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::scheduler::Cadence;

    fn ctx() -> NetworkContext {
        NetworkContext { seed: 7 }
    }

    #[test]
    fn test_debug_lists_sorted_names() {
        let debug = format!("{:?}", ComponentRegistry::with_builtins());
        assert!(debug.starts_with("ComponentRegistry"));
        let adam = debug.find("\"adam\"").unwrap();
        let sgd = debug.find("\"sgd\"").unwrap();
        assert!(adam < sgd);
        assert!(debug.contains("\"step_lr\""));
        assert_eq!(format!("{:?}", ComponentRegistry::new()).matches("[]").count(), 4);
    }

    #[test]
    fn test_builds_builtin_network() {
        let registry = ComponentRegistry::with_builtins();
        let spec = ComponentSpec::new("linear")
            .with_param("in_features", 3)
            .with_param("out_features", 1);
        let network = registry.build_network(&spec, &ctx()).unwrap();
        assert_eq!(network.parameters().len(), 2);
    }

    #[test]
    fn test_builds_ensemble_from_member_specs() {
        let registry = ComponentRegistry::with_builtins();
        let member = serde_json::json!({"type": "linear", "params": {"in_features": 2, "out_features": 1}});
        let spec = ComponentSpec::new("ensemble").with_param("members", serde_json::json!([member, member]));
        let network = registry.build_network(&spec, &ctx()).unwrap();
        assert!(network.is_ensemble());
        // members get distinct seeds
        let state = network.state_dict();
        assert_ne!(state["0.output.weight"], state["1.output.weight"]);
    }

    #[test]
    fn test_unknown_type_is_component_error() {
        let registry = ComponentRegistry::with_builtins();
        let err = registry.build_optimizer(&ComponentSpec::new("lbfgs")).err().unwrap();
        assert!(matches!(err, ExecutorError::Component(_)));
    }

    #[test]
    fn test_scheduler_cadence_comes_from_type() {
        let registry = ComponentRegistry::with_builtins();
        let sctx = ScheduleContext {
            base_lr: 0.1,
            steps_per_epoch: 4,
            epochs: 2,
        };
        let constant = registry.build_scheduler(&ComponentSpec::new("constant"), &sctx).unwrap();
        assert_eq!(constant.cadence(), Cadence::Epoch);
        let cycle = registry
            .build_scheduler(&ComponentSpec::new("one_cycle").with_param("max_lr", 0.1), &sctx)
            .unwrap();
        assert_eq!(cycle.cadence(), Cadence::Step);
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = ComponentRegistry::new();
        registry.register_criterion("always_mse", |_| Ok(Box::new(MseLoss)));
        let criterion = registry.build_criterion(&ComponentSpec::new("always_mse")).unwrap();
        assert_eq!(criterion.name(), "mse");
    }
}
