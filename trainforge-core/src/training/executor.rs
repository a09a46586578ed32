//! Shared executor machinery: network construction, device placement and
//! checkpoint restoration.

use crate::batch::{Batch, InputValue};
use crate::components::network::{DataParallel, Network};
use crate::components::optimizer::Optimizer;
use crate::components::registry::{ComponentRegistry, NetworkContext};
use crate::components::scheduler::Scheduler;
use crate::config::Config;
use crate::error::{ExecutorError, Result};
use crate::events::{EventManager, Payload};
use crate::tensor::Device;
use crate::training::checkpoint::CheckpointManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything an executor is built from.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Arc<Config>,
    pub registry: Arc<ComponentRegistry>,
    pub events: EventManager,
}

impl RunContext {
    /// Built-in components and no observers.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ComponentRegistry::with_builtins()),
            events: EventManager::new(),
        }
    }

    pub fn with_registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_events(mut self, events: EventManager) -> Self {
        self.events = events;
        self
    }
}

/// A network placed on its device plus the checkpoint it is bound to.
pub struct Executor {
    ctx: RunContext,
    network: Box<dyn Network>,
    device: Device,
    checkpoint_path: Option<PathBuf>,
    start_epoch: usize,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("network", &self.network.describe())
            .field("device", &self.device)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("start_epoch", &self.start_epoch)
            .finish()
    }
}

impl Executor {
    /// Build the configured network, let observers see it, wrap it for
    /// data-parallel execution when several GPUs are enabled and move it to
    /// the configured device.
    pub fn new(ctx: RunContext, checkpoint_path: Option<PathBuf>) -> Result<Self> {
        let config = ctx.config.clone();
        let network_ctx = NetworkContext { seed: config.seed };
        let mut network = ctx.registry.build_network(&config.model, &network_ctx)?;

        ctx.events.dispatch(&mut Payload::AfterNetworkCreate {
            network: network.as_mut(),
            config: &config,
        })?;

        if config.should_parallelize() {
            debug!(gpus = ?config.enabled_gpus, "Wrapping network for data-parallel execution");
            network = Box::new(DataParallel::new(network, config.enabled_gpus.clone()));
        }

        let device = config.device();
        network.to_device(device);

        Ok(Self {
            ctx,
            network,
            device,
            checkpoint_path,
            start_epoch: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn events(&self) -> &EventManager {
        &self.ctx.events
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.ctx.registry
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    pub fn network_mut(&mut self) -> &mut dyn Network {
        self.network.as_mut()
    }

    /// The network together with the observers, for dispatching payloads
    /// that borrow the network mutably.
    pub fn network_and_events(&mut self) -> (&mut dyn Network, &EventManager) {
        (self.network.as_mut(), &self.ctx.events)
    }

    pub fn into_network(self) -> Box<dyn Network> {
        self.network
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint_path.as_deref()
    }

    /// Last completed epoch restored from a checkpoint; `0` for a fresh run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Place every tensor of `batch` on the executor's device.
    ///
    /// Maps and lists are walked recursively. A list whose first element is a
    /// tensor but which holds other values too is left where it is, as are
    /// scalars and text.
    pub fn move_to_device(&self, batch: &mut Batch) {
        batch.outputs = batch.outputs.to_device(self.device);
        for (key, value) in batch.inputs.iter_mut() {
            place(key, value, self.device);
        }
    }

    /// Restore state from the bound checkpoint.
    ///
    /// Network weights are always restored. When `train` is set and the run
    /// is not fine-tuning, the optimizer, scheduler and resume epoch are
    /// restored as well, for whichever sections the file contains. Either
    /// every requested section is applied or none is.
    pub fn load_checkpoint(
        &mut self,
        train: bool,
        mut optimizer: Option<&mut dyn Optimizer>,
        mut scheduler: Option<&mut dyn Scheduler>,
    ) -> Result<()> {
        let path = self
            .checkpoint_path
            .clone()
            .ok_or(ExecutorError::CheckpointNotFound(None))?;
        if !path.is_file() {
            return Err(ExecutorError::CheckpointNotFound(Some(path)));
        }

        self.ctx.events.dispatch(&mut Payload::BeforeCheckpointLoad {
            network: self.network.as_mut(),
            path: &path,
        })?;

        let checkpoint = CheckpointManager::load(&path)?;
        let full_restore = train && !self.ctx.config.is_finetuning;

        let network_before = self.network.state_dict();
        let optimizer_before = match (&optimizer, full_restore) {
            (Some(opt), true) => Some(opt.state()?),
            _ => None,
        };
        let scheduler_before = match (&scheduler, full_restore) {
            (Some(sched), true) => Some(sched.state()?),
            _ => None,
        };

        let applied = (|| -> Result<()> {
            self.network.load_state_dict(&checkpoint.model)?;
            if full_restore {
                if let (Some(opt), Some(state)) = (optimizer.as_deref_mut(), &checkpoint.optimizer) {
                    opt.load_state(state)?;
                }
                if let (Some(sched), Some(state)) = (scheduler.as_deref_mut(), &checkpoint.scheduler)
                {
                    sched.load_state(state)?;
                }
            }
            Ok(())
        })();

        if let Err(e) = applied {
            warn!(path = %path.display(), error = %e, "Checkpoint restore failed; rolling back");
            let rollback = (|| -> Result<()> {
                self.network.load_state_dict(&network_before)?;
                if let (Some(opt), Some(state)) = (optimizer.as_deref_mut(), &optimizer_before) {
                    opt.load_state(state)?;
                }
                if let (Some(sched), Some(state)) = (scheduler.as_deref_mut(), &scheduler_before) {
                    sched.load_state(state)?;
                }
                Ok(())
            })();
            if let Err(rollback_error) = rollback {
                warn!(error = %rollback_error, "Rollback after failed checkpoint restore also failed");
            }
            return Err(e);
        }

        if full_restore {
            if let Some(epoch) = checkpoint.epoch {
                self.start_epoch = epoch;
            }
        }
        info!(path = %path.display(), start_epoch = self.start_epoch, "Loaded checkpoint");

        self.ctx.events.dispatch(&mut Payload::AfterCheckpointLoad {
            network: self.network.as_mut(),
            path: &path,
            start_epoch: self.start_epoch,
        })?;
        Ok(())
    }
}

fn place(key: &str, value: &mut InputValue, device: Device) {
    match value {
        InputValue::Tensor(t) => *t = t.to_device(device),
        InputValue::Graph(g) => *g = g.to_device(device),
        InputValue::Map(map) => {
            for (inner_key, inner) in map.iter_mut() {
                place(inner_key, inner, device);
            }
        }
        InputValue::List(items) => {
            let leads_with_tensor = items.first().is_some_and(InputValue::is_tensor_like);
            if leads_with_tensor && !items.iter().all(InputValue::is_tensor_like) {
                debug!(key, "list mixes tensors with other values; left in place");
                return;
            }
            for item in items.iter_mut() {
                place(key, item, device);
            }
        }
        InputValue::Scalar(_) | InputValue::Text(_) => {}
    }
}
