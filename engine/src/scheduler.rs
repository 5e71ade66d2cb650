//! Dependency-ordered scheduling of live query runs.
//!
//! When a source commits, every live query reading it schedules a job keyed
//! by its derived collection. Jobs are deduplicated: scheduling an already
//! queued collection replaces its run function but keeps its place. A job is
//! ready once none of the derived collections it depends on still has a
//! queued job, so a live query over two others sees both of their updates in
//! a single run.

use crate::{error::Result, CollectionId, Error};
use std::collections::HashMap;
use std::rc::Rc;

pub(crate) type Job = Rc<dyn Fn()>;

struct Entry {
    dependencies: Vec<CollectionId>,
    run: Job,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    /// Queued collections in first-scheduled order
    queue: Vec<CollectionId>,
    jobs: HashMap<CollectionId, Entry>,
}

impl Scheduler {
    pub fn schedule(&mut self, id: CollectionId, dependencies: Vec<CollectionId>, run: Job) {
        if !self.jobs.contains_key(&id) {
            self.queue.push(id);
        }
        self.jobs.insert(id, Entry { dependencies, run });
    }

    /// Drop a collection's queued job.
    pub fn clear(&mut self, id: CollectionId) {
        self.queue.retain(|queued| *queued != id);
        self.jobs.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn is_ready(&self, id: &CollectionId) -> bool {
        self.jobs.get(id).is_some_and(|entry| {
            entry
                .dependencies
                .iter()
                .all(|dep| dep == id || !self.jobs.contains_key(dep))
        })
    }

    /// Dequeue the first job whose dependencies have all run.
    ///
    /// Returns `Ok(None)` once the queue is empty. If jobs remain but none
    /// is ready the queue is discarded and an error returned.
    pub fn next_ready(&mut self) -> Result<Option<Job>> {
        if self.queue.is_empty() {
            return Ok(None);
        }

        match self.queue.iter().position(|id| self.is_ready(id)) {
            Some(index) => {
                let id = self.queue.remove(index);
                Ok(self.jobs.remove(&id).map(|entry| entry.run))
            }
            None => {
                let stuck = self
                    .queue
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.queue.clear();
                self.jobs.clear();
                Err(Error::UnresolvedDependencies(stuck))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn job(log: &Rc<RefCell<Vec<u64>>>, id: u64) -> Job {
        let log = log.clone();
        Rc::new(move || log.borrow_mut().push(id))
    }

    fn drain(scheduler: &mut Scheduler) -> Result<()> {
        while let Some(run) = scheduler.next_ready()? {
            run();
        }
        Ok(())
    }

    #[test]
    fn runs_dependencies_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::default();

        scheduler.schedule(CollectionId(3), vec![CollectionId(1), CollectionId(2)], job(&log, 3));
        scheduler.schedule(CollectionId(1), vec![], job(&log, 1));
        scheduler.schedule(CollectionId(2), vec![CollectionId(1)], job(&log, 2));

        drain(&mut scheduler).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn rescheduling_replaces_run_and_keeps_position() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::default();

        scheduler.schedule(CollectionId(1), vec![], job(&log, 10));
        scheduler.schedule(CollectionId(2), vec![], job(&log, 2));
        scheduler.schedule(CollectionId(1), vec![], job(&log, 1));

        drain(&mut scheduler).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn unresolvable_queue_fails_and_clears() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::default();

        scheduler.schedule(CollectionId(1), vec![CollectionId(2)], job(&log, 1));
        scheduler.schedule(CollectionId(2), vec![CollectionId(1)], job(&log, 2));

        assert!(matches!(
            scheduler.next_ready(),
            Err(Error::UnresolvedDependencies(_))
        ));
        assert!(scheduler.is_empty());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn cleared_jobs_unblock_dependents() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::default();

        scheduler.schedule(CollectionId(1), vec![], job(&log, 1));
        scheduler.schedule(CollectionId(2), vec![CollectionId(1)], job(&log, 2));
        scheduler.clear(CollectionId(1));

        drain(&mut scheduler).unwrap();
        assert_eq!(*log.borrow(), vec![2]);
    }
}
