use parley_remote::SubscriptionHandle;
use tokio::task::JoinHandle;

/// A live remote subscription and the task consuming its events.
///
/// Dropping a `Listener` unregisters the subscription before aborting the
/// task, so no event is queued for it afterwards.
pub(crate) struct Listener {
    handle: Option<SubscriptionHandle>,
    task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn new(handle: SubscriptionHandle, task: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
            task,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
        self.task.abort();
    }
}
