//! Supervised task group: the first real failure cancels the siblings.

use super::PipelineError;
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct TaskGroup {
    tasks: JoinSet<Result<(), PipelineError>>,
    cancel: CancellationToken,
}

impl TaskGroup {
    /// New group whose token is a child of `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: parent.child_token(),
        }
    }

    /// Token every member must observe.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Waits for every member.
    ///
    /// The first error that is not a cancellation cancels the rest of the
    /// group and is returned once they all exited. If members only reported
    /// cancellation, the result is [`PipelineError::Cancelled`].
    pub async fn wait(mut self) -> Result<(), PipelineError> {
        let mut first: Option<PipelineError> = None;
        let mut cancelled = false;

        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(PipelineError::Join(e.to_string())));
            match result {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => cancelled = true,
                Err(err) => {
                    if first.is_none() {
                        tracing::debug!(error = %err, "task group member failed, cancelling siblings");
                        self.cancel.cancel();
                        first = Some(err);
                    }
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None if cancelled => Err(PipelineError::Cancelled),
            None => Ok(()),
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn all_ok_is_ok() {
        let mut group = TaskGroup::new(&CancellationToken::new());
        group.spawn(async { Ok(()) });
        group.spawn(async { Ok(()) });
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn first_failure_cancels_siblings() {
        let root = CancellationToken::new();
        let mut group = TaskGroup::new(&root);
        let token = group.token();
        let sibling_stopped = Arc::new(AtomicBool::new(false));

        let stopped = sibling_stopped.clone();
        group.spawn(async move {
            token.cancelled().await;
            stopped.store(true, Ordering::SeqCst);
            Err(PipelineError::Cancelled)
        });
        group.spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(PipelineError::Join("boom".into()))
        });

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, PipelineError::Join(ref m) if m == "boom"));
        assert!(sibling_stopped.load(Ordering::SeqCst));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_reports_cancelled() {
        let root = CancellationToken::new();
        let mut group = TaskGroup::new(&root);
        for _ in 0..2 {
            let token = group.token();
            group.spawn(async move {
                token.cancelled().await;
                Err(PipelineError::Cancelled)
            });
        }
        root.cancel();
        assert!(matches!(group.wait().await, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn panics_surface_as_join_errors() {
        let mut group = TaskGroup::new(&CancellationToken::new());
        let explode = true;
        group.spawn(async move {
            if explode {
                panic!("leg exploded");
            }
            Ok(())
        });
        assert!(matches!(group.wait().await, Err(PipelineError::Join(_))));
    }
}
