use log::*;
use std::future::Future;
use tokio::task::JoinSet;

/// Unordered, concurrent work with a hard synchronisation point.
///
/// Tasks are fire-and-forget from the submitter's point of view. Every `checkpoint` submissions the owner is expected to
/// [`TaskGroup::drain`], which waits for everything submitted since the previous drain. The group therefore never holds
/// more than `checkpoint` tasks when the owner follows [`TaskGroup::at_checkpoint`].
pub struct TaskGroup {
    tasks: JoinSet<()>,
    submitted: usize,
    checkpoint: usize,
}

impl TaskGroup {
    pub fn new(checkpoint: usize) -> Self {
        Self { tasks: JoinSet::new(), submitted: 0, checkpoint: checkpoint.max(1) }
    }

    pub fn checkpoint(&self) -> usize {
        self.checkpoint
    }

    /// Spawn `task` on the runtime. It starts running immediately; its result is only observed by [`Self::drain`].
    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
        self.submitted += 1;
    }

    /// Tasks submitted since the last drain that have not been joined yet (finished or not).
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Submissions since the last drain.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn at_checkpoint(&self) -> bool {
        self.submitted >= self.checkpoint
    }

    /// Wait for every outstanding task and reset the counter. Returns how many tasks were joined.
    ///
    /// A task that panicked is logged and otherwise ignored.
    pub async fn drain(&mut self) -> usize {
        let mut joined = 0;
        while let Some(result) = self.tasks.join_next().await {
            joined += 1;
            if let Err(err) = result {
                error!("Ingestion task failed. {err}");
            }
        }
        trace!("Checkpoint: joined {joined} tasks after {} submissions", self.submitted);
        self.submitted = 0;
        joined
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_waits_for_everything() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(10);
        for i in 0..10u64 {
            let done = Arc::clone(&done);
            group.submit(async move {
                tokio::time::sleep(Duration::from_millis(10 - i)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(group.at_checkpoint());
        assert_eq!(group.drain().await, 10);
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(group.outstanding(), 0);
        assert_eq!(group.submitted(), 0);
        assert!(!group.at_checkpoint());
    }

    #[tokio::test]
    async fn panicking_task_does_not_poison_the_group() {
        env_logger::try_init().ok();
        let mut group = TaskGroup::new(3);
        group.submit(async { panic!("bad message") });
        group.submit(async {});
        assert_eq!(group.drain().await, 2);
        group.submit(async {});
        assert_eq!(group.drain().await, 1);
    }

    #[test]
    fn zero_checkpoint_is_clamped() {
        assert_eq!(TaskGroup::new(0).checkpoint(), 1);
    }
}
