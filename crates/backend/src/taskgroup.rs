//! First-error-cancels-siblings task group.
//!
//! Both the sniffer supervisor and the directory expander run a small set
//! of cooperating tasks with the same contract: the tasks share a
//! cancellation token, the first error cancels the rest, `wait` joins
//! everything and returns that first error. Panics are re-raised after the
//! join; swallowing one would hide a correctness bug.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct TaskGroup<E> {
  set: JoinSet<Result<(), E>>,
  cancel: CancellationToken,
}

impl<E: Send + 'static> TaskGroup<E> {
  /// A group whose token is a child of `parent`: cancelling the parent
  /// cancels every task, a task failure cancels only the siblings.
  pub fn new(parent: &CancellationToken) -> Self {
    Self {
      set: JoinSet::new(),
      cancel: parent.child_token(),
    }
  }

  /// The token tasks should select on.
  pub fn token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn spawn<F>(&mut self, task: F)
  where
    F: Future<Output = Result<(), E>> + Send + 'static,
  {
    self.set.spawn(task);
  }

  /// Join all tasks. Returns the first error observed; cancellation-derived
  /// errors from siblings are dropped. Re-raises the first captured panic.
  pub async fn wait(mut self) -> Result<(), E> {
    let mut first_error = None;
    let mut panic = None;

    while let Some(joined) = self.set.join_next().await {
      match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
          if first_error.is_none() {
            first_error = Some(e);
          }
          self.cancel.cancel();
        }
        Err(join_error) => {
          if join_error.is_panic() && panic.is_none() {
            panic = Some(join_error.into_panic());
          }
          self.cancel.cancel();
        }
      }
    }

    if let Some(payload) = panic {
      std::panic::resume_unwind(payload);
    }

    match first_error {
      None => Ok(()),
      Some(e) => Err(e),
    }
  }
}
