use tokio::task::JoinHandle;

#[derive(Debug)]
// Join handle that aborts when it's dropped.
pub struct DroppableHandle<T>(pub JoinHandle<T>);

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
