//! Lifecycle hooks.
//!
//! Executors announce well-defined points of their run through an
//! [`EventManager`]. Observers registered for an event receive a mutable
//! [`Payload`] and may rewrite its fields; the executor reads the fields back
//! once every observer has returned.

use crate::batch::{Batch, Inputs};
use crate::components::network::{NamedOutputs, Network};
use crate::config::Config;
use crate::error::Result;
use crate::tensor::Tensor;
use crate::training::checkpoint::Checkpoint;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub mod names {
    pub const AFTER_NETWORK_CREATE: &str = "after_network_create";
    pub const BEFORE_CHECKPOINT_LOAD: &str = "before_checkpoint_load";
    pub const AFTER_CHECKPOINT_LOAD: &str = "after_checkpoint_load";
    pub const BEFORE_TRAIN_START: &str = "before_train_start";
    pub const AFTER_TRAIN_END: &str = "after_train_end";
    pub const BEFORE_CRITERION: &str = "before_criterion";
    pub const BEFORE_TRACKER_UPDATE: &str = "before_tracker_update";
    pub const AFTER_VAL_INFERENCE: &str = "after_val_inference";
    pub const BEFORE_CHECKPOINT_SAVE: &str = "before_checkpoint_save";
    pub const BEFORE_TRAIN_PROGRESS_LOG: &str = "before_train_progress_log";
    pub const BEFORE_PREDICT: &str = "before_predict";
    pub const AFTER_PREDICT: &str = "after_predict";

    pub const ALL: [&str; 12] = [
        AFTER_NETWORK_CREATE,
        BEFORE_CHECKPOINT_LOAD,
        AFTER_CHECKPOINT_LOAD,
        BEFORE_TRAIN_START,
        AFTER_TRAIN_END,
        BEFORE_CRITERION,
        BEFORE_TRACKER_UPDATE,
        AFTER_VAL_INFERENCE,
        BEFORE_CHECKPOINT_SAVE,
        BEFORE_TRAIN_PROGRESS_LOG,
        BEFORE_PREDICT,
        AFTER_PREDICT,
    ];
}

/// Data handed to observers for one dispatch. One variant per event.
pub enum Payload<'a> {
    /// The freshly built network, before parallel wrapping and device placement.
    AfterNetworkCreate {
        network: &'a mut dyn Network,
        config: &'a Config,
    },
    BeforeCheckpointLoad {
        network: &'a mut dyn Network,
        path: &'a Path,
    },
    AfterCheckpointLoad {
        network: &'a mut dyn Network,
        path: &'a Path,
        start_epoch: usize,
    },
    BeforeTrainStart {
        network: &'a mut dyn Network,
        config: &'a Config,
        samples: usize,
    },
    AfterTrainEnd {
        network: &'a mut dyn Network,
        config: &'a Config,
        samples: usize,
    },
    /// Observers may replace `logits` or push extra loss terms.
    BeforeCriterion {
        batch: &'a mut Batch,
        logits: &'a mut Tensor,
        extras: &'a mut Vec<Tensor>,
        epoch: usize,
        config: &'a Config,
    },
    BeforeTrackerUpdate {
        outputs: &'a mut Tensor,
    },
    AfterValInference {
        logits: &'a mut Tensor,
        logits_var: &'a mut Option<Tensor>,
        softmax_score: &'a mut Option<Tensor>,
    },
    BeforeCheckpointSave {
        checkpoint: &'a mut Checkpoint,
    },
    BeforeTrainProgressLog {
        message: &'a mut String,
        epoch: usize,
    },
    BeforePredict {
        inputs: &'a mut Inputs,
        extras: &'a mut Vec<Tensor>,
        loss_type: &'a str,
    },
    /// Observers may add derived outputs such as a variance or a score.
    AfterPredict {
        batch: &'a Batch,
        outputs: &'a mut NamedOutputs,
    },
}

impl Payload<'_> {
    pub fn event_name(&self) -> &'static str {
        match self {
            Payload::AfterNetworkCreate { .. } => names::AFTER_NETWORK_CREATE,
            Payload::BeforeCheckpointLoad { .. } => names::BEFORE_CHECKPOINT_LOAD,
            Payload::AfterCheckpointLoad { .. } => names::AFTER_CHECKPOINT_LOAD,
            Payload::BeforeTrainStart { .. } => names::BEFORE_TRAIN_START,
            Payload::AfterTrainEnd { .. } => names::AFTER_TRAIN_END,
            Payload::BeforeCriterion { .. } => names::BEFORE_CRITERION,
            Payload::BeforeTrackerUpdate { .. } => names::BEFORE_TRACKER_UPDATE,
            Payload::AfterValInference { .. } => names::AFTER_VAL_INFERENCE,
            Payload::BeforeCheckpointSave { .. } => names::BEFORE_CHECKPOINT_SAVE,
            Payload::BeforeTrainProgressLog { .. } => names::BEFORE_TRAIN_PROGRESS_LOG,
            Payload::BeforePredict { .. } => names::BEFORE_PREDICT,
            Payload::AfterPredict { .. } => names::AFTER_PREDICT,
        }
    }
}

pub type Observer = Arc<dyn Fn(&mut Payload<'_>) -> Result<()> + Send + Sync>;

/// Registry of observers keyed by event name.
///
/// Cloning is cheap and clones share no state afterwards: subscribing on a
/// clone does not affect the original.
#[derive(Clone, Default)]
pub struct EventManager {
    observers: BTreeMap<String, Vec<Observer>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .observers
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        f.debug_struct("EventManager").field("observers", &counts).finish()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` for `event`. Observers run in registration order.
    pub fn subscribe<F>(&mut self, event: &str, observer: F)
    where
        F: Fn(&mut Payload<'_>) -> Result<()> + Send + Sync + 'static,
    {
        if !names::ALL.contains(&event) {
            debug!(event, "subscribing to an event no executor dispatches");
        }
        self.observers
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(observer));
    }

    pub fn observer_count(&self, event: &str) -> usize {
        self.observers.get(event).map_or(0, Vec::len)
    }

    /// Run every observer of the payload's event in order. The first failure
    /// stops the dispatch and is returned to the executor.
    pub fn dispatch(&self, payload: &mut Payload<'_>) -> Result<()> {
        let event = payload.event_name();
        let Some(observers) = self.observers.get(event) else {
            return Ok(());
        };
        for observer in observers {
            if let Err(e) = observer(payload) {
                debug!(event, error = %e, "observer failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_runs_observers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut events = EventManager::new();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            events.subscribe(names::BEFORE_TRAIN_PROGRESS_LOG, move |payload| {
                if let Payload::BeforeTrainProgressLog { message, .. } = payload {
                    message.push_str(&format!(" [{tag}]"));
                }
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }

        let mut message = String::from("epoch: 1");
        events
            .dispatch(&mut Payload::BeforeTrainProgressLog {
                message: &mut message,
                epoch: 1,
            })
            .unwrap();
        assert_eq!(message, "epoch: 1 [first] [second]");
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_observer_failure_stops_dispatch() {
        let reached = Arc::new(Mutex::new(false));
        let mut events = EventManager::new();
        events.subscribe(names::BEFORE_TRACKER_UPDATE, |_| {
            Err(ExecutorError::observer(names::BEFORE_TRACKER_UPDATE, "boom"))
        });
        let flag = reached.clone();
        events.subscribe(names::BEFORE_TRACKER_UPDATE, move |_| {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        let mut outputs = Tensor::scalar(1.0);
        let err = events
            .dispatch(&mut Payload::BeforeTrackerUpdate {
                outputs: &mut outputs,
            })
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Observer { .. }));
        assert!(!*reached.lock().unwrap());
    }

    #[test]
    fn test_events_without_observers_are_no_ops() {
        let events = EventManager::new();
        let mut outputs = Tensor::scalar(2.0);
        events
            .dispatch(&mut Payload::BeforeTrackerUpdate {
                outputs: &mut outputs,
            })
            .unwrap();
        assert_eq!(outputs.data(), &[2.0]);
        assert_eq!(events.observer_count(names::AFTER_PREDICT), 0);
    }

    #[test]
    fn test_observer_only_sees_its_event() {
        let mut events = EventManager::new();
        events.subscribe(names::AFTER_VAL_INFERENCE, |payload| {
            if let Payload::AfterValInference { logits, .. } = payload {
                **logits = logits.map(|v| v * 2.0);
            }
            Ok(())
        });

        let mut outputs = Tensor::scalar(1.0);
        events
            .dispatch(&mut Payload::BeforeTrackerUpdate {
                outputs: &mut outputs,
            })
            .unwrap();
        assert_eq!(outputs.data(), &[1.0]);

        let mut logits = Tensor::scalar(1.5);
        let (mut var, mut score) = (None, None);
        events
            .dispatch(&mut Payload::AfterValInference {
                logits: &mut logits,
                logits_var: &mut var,
                softmax_score: &mut score,
            })
            .unwrap();
        assert_eq!(logits.data(), &[3.0]);
    }
}
