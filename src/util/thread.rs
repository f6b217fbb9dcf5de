use std::thread::{self, JoinHandle};

pub const OTHER_THREAD_ERR: &str = "This error is shown because other thread has panicked \
                                    You can safety skip this error.";

/// A thread handle whose thread name is prefixed with the namespace of the crate,
/// so logs and debuggers show which worker is which (e.g. `lanchat/udp-listener`).
/// Dropping it joins the thread: the owner must make the thread finish first.
pub struct NamespacedThread<T: Send + 'static> {
    name: String,
    join_handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> NamespacedThread<T> {
    /// Spawns a new named thread running `f`.
    pub fn spawn<F>(name: &str, f: F) -> Self
    where F: FnOnce() -> T + Send + 'static {
        let full_name = format!("lanchat/{}", name);
        let join_handle = thread::Builder::new()
            .name(full_name.clone())
            .spawn(move || {
                log::trace!("Thread [{}] spawned", thread::current().name().unwrap_or(""));
                f()
            })
            .expect(OTHER_THREAD_ERR);

        Self { name: full_name, join_handle: Some(join_handle) }
    }

    /// Waits to the thread to finish and returns its value.
    /// Panics if the thread was already joined or if it panicked.
    pub fn join(&mut self) -> T {
        self.try_join().expect(OTHER_THREAD_ERR)
    }

    /// Waits to the thread to finish.
    /// Returns `None` if the thread was already joined.
    pub fn try_join(&mut self) -> Option<T> {
        let handle = self.join_handle.take()?;
        log::trace!("Waiting to finish thread: [{}]", self.name);
        let value = handle.join().expect(OTHER_THREAD_ERR);
        log::trace!("Finished to waiting thread: [{}]", self.name);
        Some(value)
    }

    /// Check if the thread has already finished its work (or it was joined).
    pub fn is_finished(&self) -> bool {
        match &self.join_handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Send + 'static> Drop for NamespacedThread<T> {
    fn drop(&mut self) {
        if self.join_handle.is_some() && !thread::panicking() {
            self.join();
        }
    }
}
