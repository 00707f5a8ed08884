//! Admission control for fetching jobs.
//!
//! One lock guards all counters: per-user FIFO queues, the round-robin ring
//! of users with waiting jobs, and the per-user / global in-flight counts.
//! Workers never touch the counters directly; the job queue admits and
//! releases on their behalf.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::download::model::{JobId, UserId};

#[derive(Debug, Clone, Copy)]
struct Waiting {
    job: JobId,
    /// Cooldown after a rate limit; the job can't be admitted before this
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct AdmissionState {
    queues: HashMap<UserId, VecDeque<Waiting>>,
    /// Users with at least one waiting job, in round-robin order
    ring: VecDeque<UserId>,
    active_per_user: HashMap<UserId, usize>,
    active_total: usize,
}

impl AdmissionState {
    fn queued_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn push(&mut self, user: UserId, entry: Waiting, front: bool) {
        let queue = self.queues.entry(user).or_default();
        if front {
            queue.push_front(entry);
        } else {
            queue.push_back(entry);
        }
        if !self.ring.contains(&user) {
            self.ring.push_back(user);
        }
    }

    fn drop_empty(&mut self, user: UserId) {
        if self.queues.get(&user).is_some_and(VecDeque::is_empty) {
            self.queues.remove(&user);
            self.ring.retain(|u| *u != user);
        }
    }
}

/// A job that was granted a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub user: UserId,
    pub job: JobId,
}

pub struct AdmissionController {
    state: Mutex<AdmissionState>,
    notify: Notify,
    max_global: usize,
    max_per_user: usize,
}

impl AdmissionController {
    pub fn new(max_global: usize, max_per_user: usize) -> Self {
        Self {
            state: Mutex::new(AdmissionState::default()),
            notify: Notify::new(),
            max_global: max_global.max(1),
            max_per_user: max_per_user.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends `job` to the end of `user`'s queue.
    pub fn enqueue(&self, user: UserId, job: JobId) {
        self.lock().push(user, Waiting { job, not_before: None }, false);
        self.notify.notify_one();
    }

    /// Appends `job` unless `max_queued` jobs are already waiting.
    /// Returns false when the queue is full.
    pub fn try_enqueue(&self, user: UserId, job: JobId, max_queued: usize) -> bool {
        {
            let mut state = self.lock();
            if state.queued_len() >= max_queued {
                return false;
            }
            state.push(user, Waiting { job, not_before: None }, false);
        }
        self.notify.notify_one();
        true
    }

    /// Admits the next eligible job, if a slot is free.
    ///
    /// Users are visited in round-robin order; within a user the head of the
    /// queue goes first. A user whose head is cooling down or who is at the
    /// per-user cap is skipped for this round.
    pub fn try_admit(&self) -> Option<Admission> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.active_total >= self.max_global {
            return None;
        }

        for _ in 0..state.ring.len() {
            let user = state.ring.pop_front()?;
            let active = state.active_per_user.get(&user).copied().unwrap_or(0);
            let head = state.queues.get(&user).and_then(|q| q.front()).copied();

            match head {
                Some(head) if active < self.max_per_user && head.not_before.is_none_or(|t| t <= now) => {
                    if let Some(queue) = state.queues.get_mut(&user) {
                        queue.pop_front();
                    }
                    *state.active_per_user.entry(user).or_insert(0) += 1;
                    state.active_total += 1;
                    // Served users go to the back of the ring
                    state.ring.push_back(user);
                    state.drop_empty(user);
                    return Some(Admission { user, job: head.job });
                }
                Some(_) => state.ring.push_back(user),
                None => {
                    state.queues.remove(&user);
                }
            }
        }
        None
    }

    /// Frees the slot held by one of `user`'s jobs.
    pub fn release(&self, user: UserId) {
        {
            let mut state = self.lock();
            release_locked(&mut state, user);
        }
        self.notify.notify_one();
    }

    /// Frees the slot and puts `job` back at the head of `user`'s queue,
    /// not admissible before `not_before`. One lock for both steps.
    pub fn requeue_with_cooldown(&self, user: UserId, job: JobId, not_before: Instant) {
        {
            let mut state = self.lock();
            release_locked(&mut state, user);
            state.push(
                user,
                Waiting {
                    job,
                    not_before: Some(not_before),
                },
                true,
            );
        }
        self.notify.notify_one();
    }

    /// Removes a waiting job. Returns false if it wasn't queued.
    pub fn remove(&self, user: UserId, job: JobId) -> bool {
        let mut state = self.lock();
        let removed = match state.queues.get_mut(&user) {
            Some(queue) => {
                let before = queue.len();
                queue.retain(|w| w.job != job);
                queue.len() != before
            }
            None => false,
        };
        state.drop_empty(user);
        removed
    }

    /// 1-based position of `job` in round-robin admission order.
    pub fn position(&self, job: JobId) -> Option<usize> {
        let state = self.lock();
        let queues: Vec<&VecDeque<Waiting>> = state.ring.iter().filter_map(|u| state.queues.get(u)).collect();
        let longest = queues.iter().map(|q| q.len()).max().unwrap_or(0);
        let mut position = 0;
        for round in 0..longest {
            for queue in &queues {
                if let Some(entry) = queue.get(round) {
                    position += 1;
                    if entry.job == job {
                        return Some(position);
                    }
                }
            }
        }
        None
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queued_len()
    }

    pub fn active_len(&self) -> usize {
        self.lock().active_total
    }

    pub fn active_for(&self, user: UserId) -> usize {
        self.lock().active_per_user.get(&user).copied().unwrap_or(0)
    }

    /// Resolves when something changed (enqueue, release, requeue).
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

fn release_locked(state: &mut AdmissionState, user: UserId) {
    match state.active_per_user.get_mut(&user) {
        Some(count) if *count > 0 => {
            *count -= 1;
            if *count == 0 {
                state.active_per_user.remove(&user);
            }
            state.active_total = state.active_total.saturating_sub(1);
        }
        _ => log::warn!("Release for user {} without an active slot", user),
    }
}
