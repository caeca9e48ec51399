//! At most one in-flight execution per skill, with waiters sharing the result.
//!
//! The owner of a skill's lock must release it exactly once. `FlightOwner`
//! enforces that: releasing consumes the guard, and dropping an unreleased
//! guard delivers an `abandoned` error to every waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quill_core::lock_unpoisoned;
use tokio::sync::oneshot;

use crate::skill_job::{SkillJobError, SkillJobOutcome};

#[derive(Debug, Default)]
struct ExecutionLock {
    waiters: Vec<oneshot::Sender<SkillJobOutcome>>,
}

#[derive(Debug, Default)]
pub struct SingleFlightCoordinator {
    locks: Mutex<HashMap<String, ExecutionLock>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// How a waiter's registration ended.
pub enum FlightWait {
    Resolved(SkillJobOutcome),
    /// No execution was in flight when the waiter registered.
    Missed,
}

#[derive(Debug)]
pub struct SkillWaiter {
    skill_id: String,
    receiver: Option<oneshot::Receiver<SkillJobOutcome>>,
}

impl SkillWaiter {
    pub fn skill_id(&self) -> &str {
        &self.skill_id
    }

    pub fn is_enqueued(&self) -> bool {
        self.receiver.is_some()
    }

    pub async fn wait(self) -> FlightWait {
        let Some(receiver) = self.receiver else {
            return FlightWait::Missed;
        };
        match receiver.await {
            Ok(outcome) => FlightWait::Resolved(outcome),
            Err(_) => FlightWait::Resolved(Err(SkillJobError::abandoned(&self.skill_id))),
        }
    }
}

#[derive(Debug)]
pub enum FlightTicket {
    Owner(FlightOwner),
    Waiter(SkillWaiter),
}

#[derive(Debug)]
/// Exclusive right to execute one skill until released.
pub struct FlightOwner {
    coordinator: Arc<SingleFlightCoordinator>,
    skill_id: String,
    released: bool,
}

impl FlightOwner {
    pub fn skill_id(&self) -> &str {
        &self.skill_id
    }

    /// Releases the lock and delivers `outcome` to every queued waiter.
    pub fn release(mut self, outcome: SkillJobOutcome) -> usize {
        self.released = true;
        self.coordinator.release_lock(&self.skill_id, outcome)
    }
}

impl Drop for FlightOwner {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(skill_id = %self.skill_id, "skill execution owner dropped without releasing");
            self.coordinator
                .release_lock(&self.skill_id, Err(SkillJobError::abandoned(&self.skill_id)));
        }
    }
}

impl SingleFlightCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, skill_id: &str) -> bool {
        lock_unpoisoned(&self.locks).contains_key(skill_id)
    }

    /// Non-blocking attempt to become the skill's sole executor.
    pub fn acquire_lock(&self, skill_id: &str) -> bool {
        let mut locks = lock_unpoisoned(&self.locks);
        if locks.contains_key(skill_id) {
            return false;
        }
        locks.insert(skill_id.to_string(), ExecutionLock::default());
        true
    }

    /// Queues a waiter on the current execution. When nothing is in flight the
    /// waiter is not queued and resolves to [`FlightWait::Missed`].
    pub fn add_waiter(&self, skill_id: &str) -> SkillWaiter {
        let mut locks = lock_unpoisoned(&self.locks);
        let receiver = locks.get_mut(skill_id).map(|lock| {
            let (sender, receiver) = oneshot::channel();
            lock.waiters.push(sender);
            receiver
        });
        SkillWaiter {
            skill_id: skill_id.to_string(),
            receiver,
        }
    }

    /// Clears ownership and resolves every waiter queued so far. Returns the
    /// number of waiters that received the outcome.
    pub fn release_lock(&self, skill_id: &str, outcome: SkillJobOutcome) -> usize {
        let Some(lock) = lock_unpoisoned(&self.locks).remove(skill_id) else {
            return 0;
        };
        let mut delivered = 0;
        for waiter in lock.waiters {
            if waiter.send(outcome.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(skill_id = %skill_id, delivered, ok = outcome.is_ok(), "skill lock released");
        delivered
    }

    pub fn waiter_count(&self, skill_id: &str) -> usize {
        lock_unpoisoned(&self.locks)
            .get(skill_id)
            .map(|lock| lock.waiters.len())
            .unwrap_or(0)
    }

    /// Becomes the owner, or joins the in-flight execution, in one step.
    pub fn acquire_or_wait(self: &Arc<Self>, skill_id: &str) -> FlightTicket {
        let mut locks = lock_unpoisoned(&self.locks);
        if let Some(lock) = locks.get_mut(skill_id) {
            let (sender, receiver) = oneshot::channel();
            lock.waiters.push(sender);
            return FlightTicket::Waiter(SkillWaiter {
                skill_id: skill_id.to_string(),
                receiver: Some(receiver),
            });
        }
        locks.insert(skill_id.to_string(), ExecutionLock::default());
        FlightTicket::Owner(FlightOwner {
            coordinator: Arc::clone(self),
            skill_id: skill_id.to_string(),
            released: false,
        })
    }
}
